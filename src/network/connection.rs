use std::sync::Arc;

use crate::errors::{RequestAttemptError, WriteError};
use crate::execution::executor::Executor;
use crate::frame::{Request, Response, StreamId};

/// Callback object registered with every write; the transport invokes exactly
/// one of these methods per event, always on the connection's own executor.
pub trait ResponseCallback: Send + Sync {
    /// A decoded response arrived for the stream.
    fn on_response(&self, stream: StreamId, response: Response);

    /// The request failed without a server response (connection broke,
    /// encoding failure, etc.).
    fn on_exception(&self, stream: StreamId, error: RequestAttemptError);

    /// The transport-level deadline for the stream elapsed.
    fn on_timeout(&self, stream: StreamId);
}

/// A single logical channel to one host.
///
/// All response, exception and timeout callbacks for a connection are invoked
/// on that connection's own single-threaded executor, so per-request state
/// mutated from callbacks never races with itself.
pub trait Connection: Send + Sync {
    /// Keyspace the connection is currently bound to.
    fn keyspace(&self) -> Option<String>;

    /// Sends a request. On success, `callback` will later receive exactly one
    /// of `on_response`, `on_exception` or `on_timeout` for the returned
    /// stream id. A synchronous failure means nothing was sent.
    fn write(
        &self,
        request: Request,
        callback: Arc<dyn ResponseCallback>,
    ) -> Result<StreamId, WriteError>;

    /// The executor running this connection's event loop. Timers armed for
    /// requests on this connection are scheduled here.
    fn executor(&self) -> Arc<dyn Executor>;

    /// Stops reading further bytes from the socket. The server observes the
    /// client ceasing to acknowledge data and throttles accordingly.
    fn pause_reads(&self);

    /// Re-enables socket reads after a previous [`Connection::pause_reads`].
    fn resume_reads(&self);

    /// Marks the connection unusable for any future request. Called when the
    /// server reports an internal error that may have corrupted the channel.
    fn mark_defunct(&self);
}
