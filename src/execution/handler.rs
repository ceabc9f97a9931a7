//! The heart of the crate: drives one continuous-paging request from the
//! first write to the last page.
//!
//! A [`ContinuousRequestHandler`] owns everything a logical request needs:
//! the request value, the lifecycle state machine, the page queue, the query
//! plan and the per-host error log. The transport calls back into it through
//! per-attempt callback objects; the consumer drains the page queue through
//! the pager views.
//!
//! Retry decisions are only evaluated for the first response. Once a page has
//! been delivered the client holds state-dependent data and re-executing
//! would be unsound, so every later error is surfaced directly.

use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::cluster::{Host, Node};
use crate::errors::{RequestAttemptError, RequestError};
use crate::execution::page_queue::{OfferOutcome, PageQueue};
use crate::execution::state::{CancelOutcome, Phase, RequestState};
use crate::frame::{
    Consistency, DbError, Page, Request, Response, ResultResponse, StreamId,
};
use crate::network::{Connection, ResponseCallback};
use crate::policies::load_balancing::{LoadBalancingPolicy, QueryPlan};
use crate::policies::retry::{RetryDecision, RetryPolicy};
use crate::statement::{PreparedCache, Statement};

/// Sentinel for "no attempt has delivered a page yet".
const NO_WINNER: u64 = u64::MAX;

/// The connection lease of the outstanding attempt.
struct AttemptLease {
    attempt: u32,
    node: Arc<Node>,
    connection: Arc<dyn Connection>,
    stream: Option<StreamId>,
}

pub(crate) struct ContinuousRequestHandler {
    statement: Arc<Statement>,
    /// The outgoing request. Replaced, never mutated, when a retry decision
    /// overrides the consistency level.
    request: Mutex<Request>,
    state: RequestState,
    queue: Arc<PageQueue>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    prepared_cache: Arc<PreparedCache>,
    plan: Mutex<Option<QueryPlan>>,
    current: Mutex<Option<AttemptLease>>,
    /// Per-host errors collected while failing over, for the final
    /// "no host available" diagnostic.
    attempt_errors: Mutex<Vec<(Host, RequestAttemptError)>>,
    /// Retries granted by the retry policy. Distinct from the attempt tag,
    /// which also advances on transparent re-prepare.
    retry_count: AtomicU32,
    /// Attempt tag of the attempt whose pages are being streamed, once the
    /// first page arrived. Events from any other tag are stale.
    winning_attempt: AtomicU64,
}

impl ContinuousRequestHandler {
    pub(crate) fn new(
        statement: Arc<Statement>,
        request: Request,
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        retry_policy: Arc<dyn RetryPolicy>,
        prepared_cache: Arc<PreparedCache>,
        queue: Arc<PageQueue>,
    ) -> Arc<ContinuousRequestHandler> {
        Arc::new(ContinuousRequestHandler {
            statement,
            request: Mutex::new(request),
            state: RequestState::new(),
            queue,
            load_balancing,
            retry_policy,
            prepared_cache,
            plan: Mutex::new(None),
            current: Mutex::new(None),
            attempt_errors: Mutex::new(Vec::new()),
            retry_count: AtomicU32::new(0),
            winning_attempt: AtomicU64::new(NO_WINNER),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<PageQueue> {
        &self.queue
    }

    /// Builds the query plan and sends the first attempt.
    pub(crate) fn start(self: &Arc<Self>) {
        *self.plan.lock().unwrap() = Some(self.load_balancing.query_plan(&self.statement));
        self.send_request();
    }

    /// The host failover loop: tries each host of the current plan in turn
    /// until one accepts the write or the plan is exhausted.
    fn send_request(self: &Arc<Self>) {
        loop {
            if self.state.is_cancelled() {
                return;
            }
            let Some(attempt) = self.state.start_next() else {
                // Terminal; a racing callback already resolved the request.
                return;
            };
            let next = self.plan.lock().unwrap().as_mut().and_then(Iterator::next);
            match next {
                None => {
                    self.fail_no_host();
                    return;
                }
                Some(Err(plan_error)) => {
                    // A fault inside plan iteration is an invariant violation;
                    // fail instead of hanging the loop.
                    if self.state.finish() {
                        self.queue
                            .fail(RequestError::InternalError(plan_error.to_string()));
                    }
                    return;
                }
                Some(Ok(node)) => match self.try_host(&node, attempt) {
                    Ok(()) => return,
                    Err(error) => {
                        trace!(host = %node.host(), %error, "Host skipped, advancing to the next one");
                        self.record_attempt_error(node.host().clone(), error);
                    }
                },
            }
        }
    }

    /// Borrows a connection from the node's pool and sends the request on it.
    fn try_host(self: &Arc<Self>, node: &Arc<Node>, attempt: u32) -> Result<(), RequestAttemptError> {
        let connection = node.pool().borrow()?;
        self.try_write_on(node, &connection, attempt).map_err(|error| {
            node.pool().release(&connection);
            error
        })
    }

    /// Registers the lease and puts the request on the wire. On synchronous
    /// write failure nothing was sent and the lease is rolled back.
    fn try_write_on(
        self: &Arc<Self>,
        node: &Arc<Node>,
        connection: &Arc<dyn Connection>,
        attempt: u32,
    ) -> Result<(), RequestAttemptError> {
        *self.current.lock().unwrap() = Some(AttemptLease {
            attempt,
            node: Arc::clone(node),
            connection: Arc::clone(connection),
            stream: None,
        });
        let request = self.request.lock().unwrap().clone();
        let callback: Arc<dyn ResponseCallback> = Arc::new(AttemptCallback {
            handler: Arc::clone(self),
            attempt,
            node: Arc::clone(node),
            connection: Arc::clone(connection),
        });
        match connection.write(request, callback) {
            Ok(stream) => {
                // The callback may already have fired and replaced or cleared
                // the lease; only fill in the stream id of our own attempt.
                let mut current = self.current.lock().unwrap();
                if let Some(lease) = current.as_mut() {
                    if lease.attempt == attempt && lease.stream.is_none() {
                        lease.stream = Some(stream);
                    }
                }
                Ok(())
            }
            Err(error) => {
                let mut current = self.current.lock().unwrap();
                if current.as_ref().is_some_and(|lease| lease.attempt == attempt) {
                    *current = None;
                }
                Err(error.into())
            }
        }
    }

    fn record_attempt_error(&self, host: Host, error: RequestAttemptError) {
        self.attempt_errors.lock().unwrap().push((host, error));
    }

    fn fail_no_host(&self) {
        if self.state.finish() {
            let errors = mem::take(&mut *self.attempt_errors.lock().unwrap());
            debug!(hosts_tried = errors.len(), "Query plan exhausted");
            self.queue.fail(RequestError::NoHostAvailable(errors));
        }
    }

    /// Delivers a terminal error, conditioned on `attempt` still being the
    /// outstanding attempt.
    fn fail_attempt(&self, attempt: u32, error: RequestError) {
        if self.state.complete(attempt) {
            self.queue.fail(error);
        }
    }

    /// Whether an event tagged `attempt` belongs to the live attempt. Stale
    /// events come from attempts abandoned by a retry or a client timeout.
    fn is_current_attempt(&self, attempt: u32) -> bool {
        match self.state.load() {
            Phase::Initial => false,
            Phase::InProgress { attempt: current } => current == attempt,
            Phase::Complete | Phase::CancelledWhileInProgress | Phase::CancelledWhileComplete => {
                self.winning_attempt.load(Ordering::Acquire) == u64::from(attempt)
            }
        }
    }

    fn streaming_started(&self) -> bool {
        self.winning_attempt.load(Ordering::Acquire) != NO_WINNER
    }

    /// Returns the connection to the pool and clears the lease if it still
    /// points at this connection.
    fn release_connection(&self, node: &Arc<Node>, connection: &Arc<dyn Connection>) {
        {
            let mut current = self.current.lock().unwrap();
            if current
                .as_ref()
                .is_some_and(|lease| Arc::ptr_eq(&lease.connection, connection))
            {
                *current = None;
            }
        }
        node.pool().release(connection);
    }

    fn current_consistency(&self) -> Consistency {
        self.request
            .lock()
            .unwrap()
            .consistency()
            .unwrap_or(self.statement.consistency)
    }

    // --- transport events, forwarded by AttemptCallback ---

    fn on_response(self: &Arc<Self>, callback: &AttemptCallback, response: Response) {
        match response {
            Response::Result(ResultResponse::Rows(page)) => self.on_page(callback, page),
            Response::Error { error, reason } => self.on_db_error(callback, error, reason),
            other => self.on_attempt_error(
                callback,
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
            ),
        }
    }

    fn on_page(self: &Arc<Self>, callback: &AttemptCallback, page: Page) {
        let is_last = page.is_last;
        if !self.is_current_attempt(callback.attempt) {
            // A stream abandoned after a client-side timeout. Its connection
            // becomes reusable only once the server truly stops sending.
            trace!(
                sequence = page.sequence,
                attempt = callback.attempt,
                "Dropping page from an abandoned attempt"
            );
            if is_last {
                self.release_connection(&callback.node, &callback.connection);
            }
            return;
        }
        if !self.streaming_started() {
            // First page: from here on retries are off the table and events
            // from other attempt tags are stale.
            self.winning_attempt
                .store(u64::from(callback.attempt), Ordering::Release);
        }
        if is_last {
            // End of the attempt; a racing cancel may already have won, in
            // which case the queue is terminal and discards the page.
            let _ = self.state.complete(callback.attempt);
        }
        match self.queue.offer(page, Some(&callback.connection)) {
            OfferOutcome::SequenceMismatch { expected, got } => {
                warn!(expected, got, "Server sent a page out of order");
                let _ = self.state.complete(callback.attempt);
                self.release_connection(&callback.node, &callback.connection);
                self.queue
                    .fail(RequestError::PageSequenceMismatch { expected, got });
            }
            OfferOutcome::Delivered | OfferOutcome::Discarded if is_last => {
                // End of stream, even when the consumer already walked away.
                self.release_connection(&callback.node, &callback.connection);
            }
            _ => {}
        }
    }

    fn on_db_error(self: &Arc<Self>, callback: &AttemptCallback, error: DbError, reason: String) {
        if !self.is_current_attempt(callback.attempt) {
            // An ERROR response ends the abandoned stream.
            self.release_connection(&callback.node, &callback.connection);
            return;
        }
        if self.streaming_started() {
            // Mid-stream errors end the attempt and are never retried.
            if error == DbError::ServerError {
                callback.connection.mark_defunct();
            }
            let _ = self.state.complete(callback.attempt);
            self.release_connection(&callback.node, &callback.connection);
            self.queue
                .fail(RequestAttemptError::DbError(error, reason).into());
            return;
        }
        if let DbError::Unprepared { statement_id } = error {
            // Keep the connection: the re-prepare must happen on it.
            self.on_unprepared(callback, statement_id);
            return;
        }
        if error == DbError::ServerError {
            callback.connection.mark_defunct();
        }
        self.release_connection(&callback.node, &callback.connection);

        let attempt = callback.attempt;
        let consistency = self.current_consistency();
        let retry_count = self.retry_count.load(Ordering::Acquire);
        let decision = match &error {
            DbError::ReadTimeout {
                received,
                required,
                data_present,
                ..
            } => self.retry_policy.on_read_timeout(
                &self.statement,
                consistency,
                *required,
                *received,
                *data_present,
                retry_count,
            ),
            DbError::WriteTimeout { .. } => {
                // A write timeout makes no sense for a read-only stream; the
                // server and client disagree about what was sent.
                self.fail_attempt(
                    attempt,
                    RequestError::InternalError(format!(
                        "write timeout reported for a continuous-paging read: {error}"
                    )),
                );
                return;
            }
            DbError::Unavailable {
                required, alive, ..
            } => self.retry_policy.on_unavailable(
                &self.statement,
                consistency,
                *required,
                *alive,
                retry_count,
            ),
            DbError::IsBootstrapping => {
                // Never useful to retry on a bootstrapping host; go straight
                // to the next candidate without consulting the policy.
                self.record_attempt_error(
                    callback.node.host().clone(),
                    RequestAttemptError::DbError(error.clone(), reason),
                );
                self.send_request();
                return;
            }
            DbError::Overloaded | DbError::ServerError if self.statement.is_idempotent => {
                self.retry_policy.on_request_error(
                    &self.statement,
                    consistency,
                    &RequestAttemptError::DbError(error.clone(), reason.clone()),
                    retry_count,
                )
            }
            _ => RetryDecision::Rethrow,
        };
        self.process_retry_decision(
            attempt,
            Some(Arc::clone(&callback.node)),
            decision,
            RequestAttemptError::DbError(error, reason),
        );
    }

    fn on_attempt_error(self: &Arc<Self>, callback: &AttemptCallback, error: RequestAttemptError) {
        if !self.is_current_attempt(callback.attempt) {
            self.release_connection(&callback.node, &callback.connection);
            return;
        }
        if self.streaming_started() {
            let _ = self.state.complete(callback.attempt);
            self.release_connection(&callback.node, &callback.connection);
            self.queue.fail(error.into());
            return;
        }
        self.release_connection(&callback.node, &callback.connection);
        let decision = if self.statement.is_idempotent {
            self.retry_policy.on_request_error(
                &self.statement,
                self.current_consistency(),
                &error,
                self.retry_count.load(Ordering::Acquire),
            )
        } else {
            RetryDecision::Rethrow
        };
        self.process_retry_decision(
            callback.attempt,
            Some(Arc::clone(&callback.node)),
            decision,
            error,
        );
    }

    fn on_client_timeout(self: &Arc<Self>, callback: &AttemptCallback) {
        if !self.is_current_attempt(callback.attempt) || self.streaming_started() {
            // The per-page wait has its own timeout; a stale transport timer
            // carries no information.
            return;
        }
        // The connection is deliberately not released: the server may still
        // answer on this stream, and releasing would let the stream id be
        // reused by an unrelated request.
        {
            let mut current = self.current.lock().unwrap();
            if current
                .as_ref()
                .is_some_and(|lease| lease.attempt == callback.attempt)
            {
                *current = None;
            }
        }
        debug!(
            host = %callback.node.host(),
            attempt = callback.attempt,
            "Request timed out before the first response"
        );
        let error = RequestAttemptError::ClientTimeout;
        let decision = if self.statement.is_idempotent {
            self.retry_policy.on_request_error(
                &self.statement,
                self.current_consistency(),
                &error,
                self.retry_count.load(Ordering::Acquire),
            )
        } else {
            RetryDecision::Rethrow
        };
        self.process_retry_decision(
            callback.attempt,
            Some(Arc::clone(&callback.node)),
            decision,
            error,
        );
    }

    fn process_retry_decision(
        self: &Arc<Self>,
        attempt: u32,
        last_node: Option<Arc<Node>>,
        decision: RetryDecision,
        error: RequestAttemptError,
    ) {
        match decision {
            RetryDecision::RetrySameHost(consistency) => {
                // Recorded up front: if the retry fails over after all, the
                // final diagnostic still names this host's error.
                if let Some(node) = &last_node {
                    self.record_attempt_error(node.host().clone(), error);
                }
                self.retry(attempt, consistency, last_node)
            }
            RetryDecision::RetryNextHost(consistency) => {
                if let Some(node) = &last_node {
                    self.record_attempt_error(node.host().clone(), error);
                }
                self.retry(attempt, consistency, None)
            }
            RetryDecision::Rethrow => self.fail_attempt(attempt, error.into()),
            RetryDecision::Ignore => {
                if self.state.complete(attempt) {
                    self.winning_attempt
                        .store(u64::from(attempt), Ordering::Release);
                    let _ = self.queue.offer(Page::empty_last(), None);
                }
            }
        }
    }

    /// Claims the retry and re-sends: on the same host when the policy asked
    /// for it, otherwise on the next host of the query plan. A same-host
    /// attempt that cannot be sent falls back to failover as well.
    fn retry(
        self: &Arc<Self>,
        attempt: u32,
        new_consistency: Option<Consistency>,
        same_host: Option<Arc<Node>>,
    ) {
        let Some(next_attempt) = self.state.claim_retry(attempt) else {
            // A racing cancel or completion won; nothing left to do.
            return;
        };
        let retries = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            retries,
            new_consistency = new_consistency.map(tracing::field::display),
            "Retrying the request"
        );
        if let Some(consistency) = new_consistency {
            let mut request = self.request.lock().unwrap();
            *request = request.with_consistency(consistency);
        }
        if let Some(node) = same_host {
            match self.try_host(&node, next_attempt) {
                Ok(()) => return,
                Err(retry_error) => {
                    trace!(host = %node.host(), %retry_error, "Same-host retry failed, falling back to failover");
                    self.record_attempt_error(node.host().clone(), retry_error);
                }
            }
        }
        self.send_request();
    }

    /// Recovers from an UNPREPARED response: re-prepares the statement on the
    /// same connection and re-issues the original request, invisibly to the
    /// caller. A prepared id the local cache does not know, or a keyspace
    /// mismatch, cannot be recovered and fails fast.
    fn on_unprepared(self: &Arc<Self>, callback: &AttemptCallback, statement_id: Bytes) {
        let Some(prepared) = self.prepared_cache.lookup(&statement_id) else {
            self.release_connection(&callback.node, &callback.connection);
            self.fail_attempt(callback.attempt, RequestError::UnknownPreparedId(statement_id));
            return;
        };
        let connection_keyspace = callback.connection.keyspace();
        if prepared.keyspace.is_some() && prepared.keyspace != connection_keyspace {
            // A caller programming error (statement reused in the wrong
            // keyspace), not a transient condition; never retried.
            self.release_connection(&callback.node, &callback.connection);
            self.fail_attempt(
                callback.attempt,
                RequestError::KeyspaceMismatch {
                    statement_keyspace: prepared.keyspace.clone(),
                    connection_keyspace,
                },
            );
            return;
        }
        debug!(host = %callback.node.host(), "Statement not prepared on host, re-preparing");
        let prepare_callback: Arc<dyn ResponseCallback> = Arc::new(PrepareCallback {
            handler: Arc::clone(self),
            attempt: callback.attempt,
            node: Arc::clone(&callback.node),
            connection: Arc::clone(&callback.connection),
        });
        let prepare = Request::Prepare {
            query: prepared.statement.contents.clone(),
        };
        if let Err(error) = callback.connection.write(prepare, prepare_callback) {
            self.record_attempt_error(callback.node.host().clone(), error.into());
            self.release_connection(&callback.node, &callback.connection);
            self.send_request();
        }
    }

    fn on_prepared(self: &Arc<Self>, callback: &PrepareCallback, response: Response) {
        match response {
            Response::Result(ResultResponse::Prepared(prepared)) => {
                self.prepared_cache.insert(prepared);
                // Re-issue the original request as a fresh attempt so that
                // stale callbacks of the failed one are rejected by tag.
                let Some(next_attempt) = self.state.claim_retry(callback.attempt) else {
                    return;
                };
                if let Err(error) =
                    self.try_write_on(&callback.node, &callback.connection, next_attempt)
                {
                    self.record_attempt_error(callback.node.host().clone(), error);
                    callback.node.pool().release(&callback.connection);
                    self.send_request();
                }
            }
            Response::Error { error, reason } => {
                // Prepare failed on this host; move on to the next one.
                debug!(host = %callback.node.host(), %error, "Re-prepare failed, advancing to the next host");
                self.record_attempt_error(
                    callback.node.host().clone(),
                    RequestAttemptError::DbError(error, reason),
                );
                self.release_connection(&callback.node, &callback.connection);
                self.send_request();
            }
            other => self.on_prepare_error(
                callback,
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
            ),
        }
    }

    fn on_prepare_error(self: &Arc<Self>, callback: &PrepareCallback, error: RequestAttemptError) {
        self.record_attempt_error(callback.node.host().clone(), error);
        self.release_connection(&callback.node, &callback.connection);
        self.send_request();
    }

    /// Cancels the request. Idempotent; at most one cancel protocol message
    /// is ever sent, and it goes out on a fresh borrow because the original
    /// stream cannot carry out-of-band messages.
    pub(crate) fn cancel(&self) {
        let outcome = self.state.cancel();
        match outcome {
            CancelOutcome::AlreadyCancelled => {}
            CancelOutcome::CancelledIdle => self.queue.cancel(),
            CancelOutcome::CancelledInFlight { attempt } => {
                debug!(attempt, "Cancelling an in-flight request");
                self.queue.cancel();
                let target = self
                    .current
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|lease| (Arc::clone(&lease.node), lease.stream));
                if let Some((node, Some(stream))) = target {
                    self.send_cancel_message(&node, stream);
                }
            }
        }
    }

    fn send_cancel_message(&self, node: &Arc<Node>, stream: StreamId) {
        let connection = match node.pool().borrow() {
            Ok(connection) => connection,
            Err(error) => {
                warn!(host = %node.host(), %error, "Could not borrow a connection to send the cancel message");
                return;
            }
        };
        let callback: Arc<dyn ResponseCallback> = Arc::new(DiscardCallback);
        let result = connection.write(Request::CancelPaging { stream_id: stream }, callback);
        if let Err(error) = &result {
            warn!(host = %node.host(), %error, "Failed to send the cancel message");
        }
        // The cancel message needs no answer; the borrow is returned at once.
        node.pool().release(&connection);
    }
}

/// Per-attempt callback registered with the transport. Carries its own
/// attempt tag and connection so that events from abandoned attempts can be
/// told apart from live ones and their connections cleaned up independently.
struct AttemptCallback {
    handler: Arc<ContinuousRequestHandler>,
    attempt: u32,
    node: Arc<Node>,
    connection: Arc<dyn Connection>,
}

impl ResponseCallback for AttemptCallback {
    fn on_response(&self, _stream: StreamId, response: Response) {
        self.handler.on_response(self, response);
    }

    fn on_exception(&self, _stream: StreamId, error: RequestAttemptError) {
        self.handler.on_attempt_error(self, error);
    }

    fn on_timeout(&self, _stream: StreamId) {
        self.handler.on_client_timeout(self);
    }
}

/// Callback of the transparent PREPARE round-trip of UNPREPARED recovery.
struct PrepareCallback {
    handler: Arc<ContinuousRequestHandler>,
    /// Tag of the attempt that received UNPREPARED; the re-issued request
    /// claims the next tag from it.
    attempt: u32,
    node: Arc<Node>,
    connection: Arc<dyn Connection>,
}

impl ResponseCallback for PrepareCallback {
    fn on_response(&self, _stream: StreamId, response: Response) {
        self.handler.on_prepared(self, response);
    }

    fn on_exception(&self, _stream: StreamId, error: RequestAttemptError) {
        self.handler.on_prepare_error(self, error);
    }

    fn on_timeout(&self, _stream: StreamId) {
        self.handler
            .on_prepare_error(self, RequestAttemptError::ClientTimeout);
    }
}

/// Callback for fire-and-forget control messages.
struct DiscardCallback;

impl ResponseCallback for DiscardCallback {
    fn on_response(&self, _stream: StreamId, _response: Response) {}

    fn on_exception(&self, _stream: StreamId, _error: RequestAttemptError) {}

    fn on_timeout(&self, _stream: StreamId) {}
}
