use crate::errors::RequestAttemptError;
use crate::frame::{Consistency, WriteType};
use crate::statement::Statement;

/// What to do after an attempt failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same host. None means that the same consistency should be
    /// used as before.
    RetrySameHost(Option<Consistency>),
    /// Retry on the next host of the query plan. None means that the same
    /// consistency should be used as before.
    RetryNextHost(Option<Consistency>),
    /// Deliver the original error to the caller.
    Rethrow,
    /// Swallow the error and deliver an empty, void success instead.
    Ignore,
}

/// Pure decision functions consulted when an attempt fails.
///
/// `retry_count` is the number of retries this policy has already caused for
/// the logical request, distinct from the transport-level attempt counter.
/// Read timeout, write timeout and unavailable are always consulted
/// regardless of the statement's idempotence: the policy itself encodes the
/// safety judgment for those well-defined server-side outcomes. The generic
/// [`RetryPolicy::on_request_error`] path is only reached for idempotent
/// statements.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// The coordinator did not get enough read acknowledgements in time.
    fn on_read_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retry_count: u32,
    ) -> RetryDecision;

    /// The coordinator did not get enough write acknowledgements in time.
    fn on_write_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retry_count: u32,
    ) -> RetryDecision;

    /// The coordinator believes not enough replicas are alive.
    fn on_unavailable(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retry_count: u32,
    ) -> RetryDecision;

    /// A request-level error with no dedicated handler: overloaded or
    /// misbehaving coordinator, client-side timeout, connection error.
    fn on_request_error(
        &self,
        statement: &Statement,
        consistency: Consistency,
        error: &RequestAttemptError,
        retry_count: u32,
    ) -> RetryDecision;
}
