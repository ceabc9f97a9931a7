//! Errors surfaced while executing a request.
//!
//! Two layers mirror the two lifetimes involved: [`RequestAttemptError`]
//! describes the failure of a single attempt on a single host, while
//! [`RequestError`] is the terminal outcome of the whole logical request,
//! delivered to the consumer exactly once.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::cluster::Host;

pub use crate::frame::{DbError, WriteType};

/// The connection pool could not lend a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool has been shut down.
    #[error("The connection pool is closed")]
    PoolClosed,

    /// No connection is currently available in the pool.
    #[error("No connection available in the pool")]
    NoConnectionAvailable,

    /// The bounded wait for a connection elapsed.
    #[error("Timed out waiting for a pooled connection (after {0:?})")]
    BorrowTimeout(Duration),
}

/// A synchronous failure to put a request on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteError {
    /// The connection broke before or during the write.
    #[error("Connection is broken: {0}")]
    BrokenConnection(String),

    /// The connection was closed by its owner.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// All stream ids on the connection are busy.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
}

/// The load balancing policy failed while producing the next plan item.
#[derive(Error, Debug, Clone)]
#[error("Load balancing policy failed to produce the next host: {0}")]
pub struct PlanError(pub String);

/// An error that failed a single attempt of a request on a single host.
///
/// Attempt errors never reach the consumer directly: they are either consumed
/// by the retry machinery or recorded per host and aggregated into
/// [`RequestError::NoHostAvailable`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Database sent an ERROR response.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Selected host's connection pool refused to lend a connection.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The request could not be written to the connection.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// The connection broke while the request was in flight.
    #[error("Connection broke while the request was in flight: {0}")]
    BrokenConnection(String),

    /// Received a response of a kind that makes no sense for this request.
    #[error("Received unexpected response from the server: {0}. Expected RESULT or ERROR response.")]
    UnexpectedResponse(&'static str),

    /// The client-side deadline elapsed before the first response arrived.
    #[error("Client-side timeout elapsed before the first response arrived")]
    ClientTimeout,
}

/// Terminal outcome of a logical request, as observed by the consumer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Every candidate host either refused the write or failed the attempt.
    /// Carries the error recorded for each host that was tried.
    #[error("All attempted hosts failed to execute the request: {}", fmt_attempt_errors(.0))]
    NoHostAvailable(Vec<(Host, RequestAttemptError)>),

    /// The error of the last attempt, surfaced without retrying.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// The consumer waited longer than the configured timeout for a page.
    #[error("Timed out waiting for page {page} of the result stream (after {timeout:?})")]
    PageTimeout {
        /// 1-based sequence number of the page that never arrived.
        page: u64,
        /// The per-page timeout that elapsed.
        timeout: Duration,
    },

    /// The request was cancelled by the caller.
    #[error("The request was cancelled by the caller")]
    Cancelled,

    /// The last page of the stream was already delivered.
    #[error("No next page: the last page of this request was already delivered")]
    NoMorePages,

    /// The server pushed a page out of order. Indicates a driver or server
    /// invariant violation; the request fails rather than reorder silently.
    #[error("Protocol invariant violated: expected page {expected}, server sent page {got}")]
    PageSequenceMismatch {
        /// The sequence number the client expected next.
        expected: u64,
        /// The sequence number the server actually sent.
        got: u64,
    },

    /// The server reported the statement unprepared, but its id is unknown
    /// to the local prepared statement cache, so it cannot be re-prepared.
    #[error("Unprepared statement with id {0:?} not found in the prepared statement cache")]
    UnknownPreparedId(Bytes),

    /// A prepared statement was executed on a connection bound to a different
    /// keyspace. This is a caller programming error and is never retried.
    #[error(
        "Prepared statement keyspace {statement_keyspace:?} does not match \
        connection keyspace {connection_keyspace:?}"
    )]
    KeyspaceMismatch {
        /// Keyspace the statement was prepared in.
        statement_keyspace: Option<String>,
        /// Keyspace the connection is currently bound to.
        connection_keyspace: Option<String>,
    },

    /// A driver invariant was violated. Never retried.
    #[error("Driver internal error: {0}")]
    InternalError(String),

    /// The paging API was misused, e.g. a second page was requested while a
    /// previous request was still pending.
    #[error("Invalid use of the paging API: {0}")]
    IllegalState(&'static str),
}

fn fmt_attempt_errors(errors: &[(Host, RequestAttemptError)]) -> String {
    if errors.is_empty() {
        return "no host was tried (empty query plan)".to_string();
    }
    errors
        .iter()
        .map(|(host, error)| format!("{host}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use uuid::Uuid;

    use super::{PoolError, RequestAttemptError, RequestError};
    use crate::cluster::Host;

    fn host(port: u16) -> Host {
        Host {
            id: Uuid::new_v4(),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn no_host_available_lists_every_host() {
        let a = host(9042);
        let b = host(9043);
        let error = RequestError::NoHostAvailable(vec![
            (a.clone(), RequestAttemptError::Pool(PoolError::PoolClosed)),
            (
                b.clone(),
                RequestAttemptError::BrokenConnection("reset by peer".to_string()),
            ),
        ]);

        let displayed = error.to_string();
        assert!(displayed.contains(&a.to_string()));
        assert!(displayed.contains(&b.to_string()));
        assert!(displayed.contains("pool is closed"));
        assert!(displayed.contains("reset by peer"));
    }

    #[test]
    fn no_host_available_with_empty_plan() {
        let error = RequestError::NoHostAvailable(Vec::new());
        assert!(error.to_string().contains("empty query plan"));
    }
}
