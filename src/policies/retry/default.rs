use crate::errors::RequestAttemptError;
use crate::frame::{Consistency, WriteType};
use crate::statement::Statement;

use super::{RetryDecision, RetryPolicy};

/// Default retry policy - retries when there is a high chance that a retry
/// might help.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    /// Creates a new instance of [DefaultRetryPolicy].
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    // Retry at most once and only if there were actually enough replies
    // to satisfy consistency but they were all just checksums
    // (data_present == false). This happens when the coordinator picked
    // replicas that were overloaded or dying; by the time we retry, the node
    // will have detected them as dead and the retried read should get data.
    fn on_read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count == 0 && received >= required && !data_present {
            RetryDecision::RetrySameHost(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    // Retry at most once and only for a batch-log write: the coordinator
    // probably had not detected the replicas as dead yet.
    fn on_write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        _received: i32,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count == 0 && *write_type == WriteType::BatchLog {
            RetryDecision::RetrySameHost(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    // The current coordinator believes that not enough replicas are alive.
    // Maybe it has network problems itself - try a different one. At most one
    // retry: it is unlikely that two nodes have network problems at once.
    fn on_unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count == 0 {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    // There is some problem on this coordinator; the caller only routes here
    // for idempotent statements, so trying the next host is safe.
    fn on_request_error(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _error: &RequestAttemptError,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::RetryNextHost(None)
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultRetryPolicy, RetryDecision, RetryPolicy};
    use crate::errors::RequestAttemptError;
    use crate::frame::{Consistency, WriteType};
    use crate::statement::Statement;
    use crate::test_utils::setup_tracing;

    const CL: Consistency = Consistency::Two;

    fn statement() -> Statement {
        Statement::new("SELECT v FROM t")
    }

    #[test]
    fn read_timeout_retries_same_host_once_without_data() {
        setup_tracing();
        let policy = DefaultRetryPolicy::new();

        // Enough responses and data_present == false - coordinator received
        // only checksums.
        assert_eq!(
            policy.on_read_timeout(&statement(), CL, 2, 2, false, 0),
            RetryDecision::RetrySameHost(None)
        );
        // Second retry is never granted.
        assert_eq!(
            policy.on_read_timeout(&statement(), CL, 2, 2, false, 1),
            RetryDecision::Rethrow
        );
        // Enough responses but the data was present - the coordinator
        // probably timed out waiting for read-repair acknowledgement.
        assert_eq!(
            policy.on_read_timeout(&statement(), CL, 2, 2, true, 0),
            RetryDecision::Rethrow
        );
        // Not enough responses.
        assert_eq!(
            policy.on_read_timeout(&statement(), CL, 2, 1, false, 0),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn write_timeout_retries_batch_log_once() {
        setup_tracing();
        let policy = DefaultRetryPolicy::new();

        assert_eq!(
            policy.on_write_timeout(&statement(), CL, &WriteType::BatchLog, 2, 1, 0),
            RetryDecision::RetrySameHost(None)
        );
        assert_eq!(
            policy.on_write_timeout(&statement(), CL, &WriteType::BatchLog, 2, 1, 1),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_write_timeout(&statement(), CL, &WriteType::Simple, 2, 1, 0),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn unavailable_retries_next_host_once() {
        setup_tracing();
        let policy = DefaultRetryPolicy::new();

        assert_eq!(
            policy.on_unavailable(&statement(), CL, 2, 1, 0),
            RetryDecision::RetryNextHost(None)
        );
        assert_eq!(
            policy.on_unavailable(&statement(), CL, 2, 1, 1),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn request_error_tries_next_host() {
        setup_tracing();
        let policy = DefaultRetryPolicy::new();

        let error = RequestAttemptError::ClientTimeout;
        assert_eq!(
            policy.on_request_error(&statement(), CL, &error, 0),
            RetryDecision::RetryNextHost(None)
        );
        // The generic path has no retry cap of its own; the host failover
        // loop bounds it by plan exhaustion.
        assert_eq!(
            policy.on_request_error(&statement(), CL, &error, 3),
            RetryDecision::RetryNextHost(None)
        );
    }
}
