//! Structured protocol values exchanged with the server.
//!
//! Wire framing and encoding are external collaborators; this module only
//! models the request/response shapes the execution core needs to interpret:
//! continuous-paging row pages, error codes with their code-specific payloads,
//! and the outgoing control messages.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::statement::{PreparedStatement, Statement};

/// Identifies one in-flight request multiplexed on a connection.
pub type StreamId = i16;

/// Consistency level of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Consistency {
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
    Serial,
    LocalSerial,
}

impl Consistency {
    /// Checks if the consistency is a serial one.
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Type of write operation requested, reported back in `WriteTimeout` errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// Non-batched write
    Simple,
    /// Logged batch
    Batch,
    /// Unlogged batch
    UnloggedBatch,
    /// Counter update
    Counter,
    /// Timeout occurred during the write to the batch log
    BatchLog,
    /// Compare-and-set write
    Cas,
    /// Write involving a materialized view
    View,
    /// Write to a CDC-enabled table
    Cdc,
    /// Other type not listed here
    Other(String),
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteType::Other(x) => write!(f, "{x}"),
            x => write!(f, "{x:?}"),
        }
    }
}

/// An error sent by the server in an ERROR response, classified by its
/// protocol error code. Code-specific payloads are carried inline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// Internal server error on the coordinator. The connection that received
    /// this error may be left in an unusable state.
    #[error("Internal server error on the coordinator")]
    ServerError,

    /// The request cannot be processed because the coordinator node is overloaded
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    /// The coordinator node is still bootstrapping
    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    /// Not enough nodes are alive to satisfy required consistency level
    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        /// Consistency level of the request
        consistency: Consistency,
        /// Number of nodes required to be alive to satisfy required consistency level
        required: i32,
        /// Found number of active nodes
        alive: i32,
    },

    /// Not enough nodes responded to the read request in time to satisfy required consistency level
    #[error("Not enough nodes responded to the read request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})")]
    ReadTimeout {
        /// Consistency level of the request
        consistency: Consistency,
        /// Number of nodes that responded to the read request
        received: i32,
        /// Number of nodes required to respond to satisfy required consistency level
        required: i32,
        /// Replica that was asked for data has responded
        data_present: bool,
    },

    /// Not enough nodes responded to the write request in time to satisfy required consistency level
    #[error("Not enough nodes responded to the write request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})")]
    WriteTimeout {
        /// Consistency level of the request
        consistency: Consistency,
        /// Number of nodes that responded to the write request
        received: i32,
        /// Number of nodes required to respond to satisfy required consistency level
        required: i32,
        /// Type of write operation requested
        write_type: WriteType,
    },

    /// Tried to execute a prepared statement that is not prepared on this node
    #[error("Tried to execute a prepared statement that is not prepared on this node (id: {statement_id:?})")]
    Unprepared {
        /// Id of the unprepared statement
        statement_id: Bytes,
    },

    /// Other error code not specifically handled by the execution core
    #[error("Other error not specifically handled by the driver (code: {0})")]
    Other(i32),
}

/// One page of a continuous-paging result stream.
///
/// Pages carry a 1-based, strictly increasing sequence number assigned by the
/// server; the last page of a stream is flagged `is_last`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Raw, undecoded rows of this page.
    pub rows: Vec<Bytes>,
    /// 1-based position of this page in the stream.
    pub sequence: u64,
    /// True for the final page of the stream.
    pub is_last: bool,
    /// Opaque server-side paging state token, if the server provided one.
    pub paging_state: Option<Bytes>,
}

impl Page {
    /// A zero-row terminal page, used to synthesize a void success when a
    /// retry policy decides to ignore an error.
    pub(crate) fn empty_last() -> Page {
        Page {
            rows: Vec::new(),
            sequence: 1,
            is_last: true,
            paging_state: None,
        }
    }
}

/// The non-error payload of a RESULT response.
#[derive(Debug, Clone)]
pub enum ResultResponse {
    /// A page of rows from a continuous-paging read.
    Rows(Page),
    /// A result carrying no data.
    Void,
    /// Confirmation of a PREPARE request.
    Prepared(Arc<PreparedStatement>),
}

/// A decoded response frame, as handed to the execution core by the transport.
#[derive(Debug, Clone)]
pub enum Response {
    /// RESULT response.
    Result(ResultResponse),
    /// ERROR response.
    Error {
        /// Error classified by its protocol error code.
        error: DbError,
        /// Accompanying human-readable message from the server.
        reason: String,
    },
}

impl Response {
    /// Short name of the response kind, for diagnostics.
    pub fn to_response_kind(&self) -> &'static str {
        match self {
            Response::Result(ResultResponse::Rows(_)) => "RESULT:Rows",
            Response::Result(ResultResponse::Void) => "RESULT:Void",
            Response::Result(ResultResponse::Prepared(_)) => "RESULT:Prepared",
            Response::Error { .. } => "ERROR",
        }
    }
}

/// An outgoing request, owned by the logical request for its whole lifetime.
///
/// Requests are immutable values; a retry that substitutes a consistency level
/// re-creates the request instead of mutating it in place.
#[derive(Debug, Clone)]
pub enum Request {
    /// Execute an unprepared statement with continuous paging.
    Query {
        /// The statement to run.
        statement: Arc<Statement>,
        /// Consistency level for this and subsequent attempts.
        consistency: Consistency,
    },
    /// Execute a prepared statement with continuous paging.
    Execute {
        /// The previously prepared statement.
        prepared: Arc<PreparedStatement>,
        /// Consistency level for this and subsequent attempts.
        consistency: Consistency,
    },
    /// Prepare a statement on the target connection.
    Prepare {
        /// Statement text to prepare.
        query: String,
    },
    /// Out-of-band cancellation of a continuous-paging stream.
    CancelPaging {
        /// Stream id of the request being cancelled.
        stream_id: StreamId,
    },
}

impl Request {
    /// Consistency level the request will be executed with, if it carries one.
    pub fn consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query { consistency, .. } | Request::Execute { consistency, .. } => {
                Some(*consistency)
            }
            Request::Prepare { .. } | Request::CancelPaging { .. } => None,
        }
    }

    /// Re-creates the request with a different consistency level.
    /// Control messages are returned unchanged.
    pub fn with_consistency(&self, new_consistency: Consistency) -> Request {
        match self {
            Request::Query { statement, .. } => Request::Query {
                statement: Arc::clone(statement),
                consistency: new_consistency,
            },
            Request::Execute { prepared, .. } => Request::Execute {
                prepared: Arc::clone(prepared),
                consistency: new_consistency,
            },
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Consistency, Request};
    use crate::statement::Statement;

    #[test]
    fn with_consistency_recreates_the_request() {
        let statement = Arc::new(Statement::new("SELECT v FROM t"));
        let request = Request::Query {
            statement,
            consistency: Consistency::LocalQuorum,
        };

        let downgraded = request.with_consistency(Consistency::One);
        assert_eq!(downgraded.consistency(), Some(Consistency::One));
        // The original is untouched.
        assert_eq!(request.consistency(), Some(Consistency::LocalQuorum));
    }

    #[test]
    fn control_messages_carry_no_consistency() {
        let cancel = Request::CancelPaging { stream_id: 7 };
        assert_eq!(cancel.consistency(), None);
        assert_eq!(cancel.with_consistency(Consistency::All).consistency(), None);
    }
}
