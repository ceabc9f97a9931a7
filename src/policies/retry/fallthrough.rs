use crate::errors::RequestAttemptError;
use crate::frame::{Consistency, WriteType};
use crate::statement::Statement;

use super::{RetryDecision, RetryPolicy};

/// Retry policy that never retries: every error is delivered to the caller
/// as-is. Useful when the application wants full control over error handling.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    /// Creates a new instance of [FallthroughRetryPolicy].
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _received: i32,
        _data_present: bool,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _write_type: &WriteType,
        _required: i32,
        _received: i32,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_request_error(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _error: &RequestAttemptError,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
