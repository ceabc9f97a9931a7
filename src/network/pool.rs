use std::sync::Arc;

use crate::errors::PoolError;
use crate::network::Connection;

/// A pool of connections to a single host.
///
/// The execution core borrows one connection per attempt and releases it
/// deterministically on every exit path, except after a client-side timeout:
/// the server may still deliver responses for the abandoned stream, and
/// releasing early would let the stream id be reused by an unrelated request.
pub trait ConnectionPool: Send + Sync {
    /// Borrows a connection, waiting a bounded amount of time if the pool is
    /// momentarily exhausted.
    fn borrow(&self) -> Result<Arc<dyn Connection>, PoolError>;

    /// Returns a previously borrowed connection to the pool.
    fn release(&self, connection: &Arc<dyn Connection>);

    /// Whether the pool has been shut down.
    fn is_closed(&self) -> bool;
}
