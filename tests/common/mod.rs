//! Test doubles for driving the execution core without a real cluster:
//! scripted connections, pools, query plans and retry policies, plus a
//! deterministic inline executor.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use pageflow::cluster::{Host, Node};
use pageflow::errors::{PoolError, RequestAttemptError, WriteError};
use pageflow::execution::executor::{Executor, Task};
use pageflow::frame::{DbError, Page, Request, Response, ResultResponse, StreamId};
use pageflow::network::{Connection, ConnectionPool, ResponseCallback};
use pageflow::policies::load_balancing::{LoadBalancingPolicy, QueryPlan};
use pageflow::policies::retry::{RetryDecision, RetryPolicy};
use pageflow::statement::Statement;

pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Runs immediate tasks inline and parks scheduled ones until fired, so tests
/// control time explicitly.
#[derive(Default)]
pub struct ManualExecutor {
    scheduled: Mutex<Vec<Task>>,
}

impl ManualExecutor {
    pub fn arc() -> Arc<ManualExecutor> {
        Arc::new(ManualExecutor::default())
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        task();
    }

    fn schedule(&self, _delay: Duration, task: Task) {
        self.scheduled.lock().unwrap().push(task);
    }
}

/// What a [`FakeConnection`] does with the next write it receives.
pub enum Reaction {
    /// Accept the write and deliver these responses, in order.
    Respond(Vec<Response>),
    /// Accept the write and invoke the exception callback.
    Exception(RequestAttemptError),
    /// Accept the write and invoke the timeout callback.
    Timeout,
    /// Fail the write synchronously; nothing is sent.
    RefuseWrite(WriteError),
    /// Accept the write and never answer.
    Silence,
}

/// A connection whose responses are scripted per write. Callbacks are invoked
/// inline through the connection's executor, mirroring the real transport's
/// "callbacks on the connection's own thread" contract deterministically.
pub struct FakeConnection {
    keyspace: Option<String>,
    reactions: Mutex<VecDeque<Reaction>>,
    pub written: Mutex<Vec<Request>>,
    next_stream: AtomicI16,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub defunct: AtomicBool,
    executor: Arc<ManualExecutor>,
}

impl FakeConnection {
    pub fn new(keyspace: Option<&str>) -> Arc<FakeConnection> {
        Arc::new(FakeConnection {
            keyspace: keyspace.map(str::to_string),
            reactions: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            next_stream: AtomicI16::new(1),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            defunct: AtomicBool::new(false),
            executor: ManualExecutor::arc(),
        })
    }

    pub fn react(self: &Arc<Self>, reaction: Reaction) -> Arc<FakeConnection> {
        self.reactions.lock().unwrap().push_back(reaction);
        Arc::clone(self)
    }

    /// Kinds of the requests written so far, e.g. `["Execute", "Prepare"]`.
    pub fn written_kinds(&self) -> Vec<&'static str> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|request| match request {
                Request::Query { .. } => "Query",
                Request::Execute { .. } => "Execute",
                Request::Prepare { .. } => "Prepare",
                Request::CancelPaging { .. } => "CancelPaging",
            })
            .collect()
    }

    pub fn cancel_messages(&self) -> usize {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|request| matches!(request, Request::CancelPaging { .. }))
            .count()
    }
}

impl Connection for FakeConnection {
    fn keyspace(&self) -> Option<String> {
        self.keyspace.clone()
    }

    fn write(
        &self,
        request: Request,
        callback: Arc<dyn ResponseCallback>,
    ) -> Result<StreamId, WriteError> {
        self.written.lock().unwrap().push(request);
        let reaction = self
            .reactions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reaction::Silence);
        let stream = self.next_stream.fetch_add(1, Ordering::SeqCst);
        match reaction {
            Reaction::RefuseWrite(error) => Err(error),
            reaction => {
                self.executor.execute(Box::new(move || match reaction {
                    Reaction::Respond(responses) => {
                        for response in responses {
                            callback.on_response(stream, response);
                        }
                    }
                    Reaction::Exception(error) => callback.on_exception(stream, error),
                    Reaction::Timeout => callback.on_timeout(stream),
                    Reaction::Silence | Reaction::RefuseWrite(_) => {}
                }));
                Ok(stream)
            }
        }
    }

    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor) as Arc<dyn Executor>
    }

    fn pause_reads(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_reads(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::SeqCst);
    }
}

/// A pool that serves a scripted sequence of borrow outcomes, then falls back
/// to a default connection (or an error when there is none).
pub struct FakePool {
    scripted: Mutex<VecDeque<Result<Arc<FakeConnection>, PoolError>>>,
    default: Option<Arc<FakeConnection>>,
    pub borrows: AtomicUsize,
    pub releases: AtomicUsize,
}

impl FakePool {
    pub fn serving(connection: &Arc<FakeConnection>) -> Arc<FakePool> {
        Arc::new(FakePool {
            scripted: Mutex::new(VecDeque::new()),
            default: Some(Arc::clone(connection)),
            borrows: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn empty() -> Arc<FakePool> {
        Arc::new(FakePool {
            scripted: Mutex::new(VecDeque::new()),
            default: None,
            borrows: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn script_borrow(
        self: &Arc<Self>,
        outcome: Result<Arc<FakeConnection>, PoolError>,
    ) -> Arc<FakePool> {
        self.scripted.lock().unwrap().push_back(outcome);
        Arc::clone(self)
    }
}

impl ConnectionPool for FakePool {
    fn borrow(&self) -> Result<Arc<dyn Connection>, PoolError> {
        self.borrows.fetch_add(1, Ordering::SeqCst);
        let next = self.scripted.lock().unwrap().pop_front();
        let connection = match next {
            Some(outcome) => outcome?,
            None => self
                .default
                .as_ref()
                .ok_or(PoolError::NoConnectionAvailable)?
                .clone(),
        };
        Ok(connection as Arc<dyn Connection>)
    }

    fn release(&self, _connection: &Arc<dyn Connection>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        false
    }
}

pub fn node(port: u16, pool: Arc<FakePool>) -> Arc<Node> {
    Arc::new(Node::new(
        Host {
            id: Uuid::new_v4(),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
        },
        pool as Arc<dyn ConnectionPool>,
    ))
}

/// Load balancing policy that always yields the same nodes in order.
#[derive(Debug)]
pub struct StaticPolicy {
    nodes: Vec<Arc<Node>>,
}

impl StaticPolicy {
    pub fn new(nodes: Vec<Arc<Node>>) -> Arc<StaticPolicy> {
        Arc::new(StaticPolicy { nodes })
    }
}

impl LoadBalancingPolicy for StaticPolicy {
    fn query_plan(&self, _statement: &Statement) -> QueryPlan {
        Box::new(self.nodes.clone().into_iter().map(Ok))
    }
}

/// Load balancing policy whose plan iterator faults on the first item.
#[derive(Debug)]
pub struct BrokenPlanPolicy;

impl LoadBalancingPolicy for BrokenPlanPolicy {
    fn query_plan(&self, _statement: &Statement) -> QueryPlan {
        Box::new(std::iter::once(Err(pageflow::errors::PlanError(
            "plan iterator fault".to_string(),
        ))))
    }
}

/// Retry policy that pops scripted decisions (default [`RetryDecision::Rethrow`])
/// and counts how often each handler was consulted.
#[derive(Debug, Default)]
pub struct ScriptedRetryPolicy {
    decisions: Mutex<VecDeque<RetryDecision>>,
    pub read_timeouts: AtomicUsize,
    pub write_timeouts: AtomicUsize,
    pub unavailables: AtomicUsize,
    pub request_errors: AtomicUsize,
    pub seen_retry_counts: Mutex<Vec<u32>>,
}

impl ScriptedRetryPolicy {
    pub fn deciding(decisions: Vec<RetryDecision>) -> Arc<ScriptedRetryPolicy> {
        Arc::new(ScriptedRetryPolicy {
            decisions: Mutex::new(decisions.into()),
            ..ScriptedRetryPolicy::default()
        })
    }

    pub fn consultations(&self) -> usize {
        self.read_timeouts.load(Ordering::SeqCst)
            + self.write_timeouts.load(Ordering::SeqCst)
            + self.unavailables.load(Ordering::SeqCst)
            + self.request_errors.load(Ordering::SeqCst)
    }

    fn next_decision(&self, retry_count: u32) -> RetryDecision {
        self.seen_retry_counts.lock().unwrap().push(retry_count);
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RetryDecision::Rethrow)
    }
}

impl RetryPolicy for ScriptedRetryPolicy {
    fn on_read_timeout(
        &self,
        _statement: &Statement,
        _consistency: pageflow::frame::Consistency,
        _required: i32,
        _received: i32,
        _data_present: bool,
        retry_count: u32,
    ) -> RetryDecision {
        self.read_timeouts.fetch_add(1, Ordering::SeqCst);
        self.next_decision(retry_count)
    }

    fn on_write_timeout(
        &self,
        _statement: &Statement,
        _consistency: pageflow::frame::Consistency,
        _write_type: &pageflow::frame::WriteType,
        _required: i32,
        _received: i32,
        retry_count: u32,
    ) -> RetryDecision {
        self.write_timeouts.fetch_add(1, Ordering::SeqCst);
        self.next_decision(retry_count)
    }

    fn on_unavailable(
        &self,
        _statement: &Statement,
        _consistency: pageflow::frame::Consistency,
        _required: i32,
        _alive: i32,
        retry_count: u32,
    ) -> RetryDecision {
        self.unavailables.fetch_add(1, Ordering::SeqCst);
        self.next_decision(retry_count)
    }

    fn on_request_error(
        &self,
        _statement: &Statement,
        _consistency: pageflow::frame::Consistency,
        _error: &RequestAttemptError,
        retry_count: u32,
    ) -> RetryDecision {
        self.request_errors.fetch_add(1, Ordering::SeqCst);
        self.next_decision(retry_count)
    }
}

pub fn rows(count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| Bytes::from(format!("row-{i}")))
        .collect()
}

pub fn rows_page(sequence: u64, row_count: usize, is_last: bool) -> Response {
    Response::Result(ResultResponse::Rows(Page {
        rows: rows(row_count),
        sequence,
        is_last,
        paging_state: (!is_last).then(|| Bytes::from_static(b"ps")),
    }))
}

pub fn db_error(error: DbError) -> Response {
    Response::Error {
        error,
        reason: "scripted server error".to_string(),
    }
}
