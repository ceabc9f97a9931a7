//! The bounded page buffer between the transport thread and the consumer.
//!
//! The transport pushes pages as the server produces them; the consumer
//! drains them at its own pace. The queue bounds memory and, when the
//! consumer falls behind, disables socket reads on the producing connection
//! so the server-side flow control throttles the stream.
//!
//! The producer/consumer handoff is a single tagged state: either there are
//! queued pages, or there is (at most) one pending consumer promise, never a
//! meaningful mix. Keeping both in one variant makes the invariant
//! enforceable by the type itself.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use tracing::trace;

use crate::errors::RequestError;
use crate::execution::executor::Executor;
use crate::frame::Page;
use crate::network::Connection;

pub(crate) type PageResult = Result<Page, RequestError>;

/// What happened to an offered page.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OfferOutcome {
    /// The page was queued or handed straight to a waiting consumer.
    Delivered,
    /// The queue is already terminal; the page was silently dropped.
    /// Residual pages after a cancellation or failure end up here.
    Discarded,
    /// The page arrived out of order. The request must fail; pages are never
    /// reordered silently.
    SequenceMismatch {
        /// Sequence number the queue expected next.
        expected: u64,
        /// Sequence number the server actually sent.
        got: u64,
    },
}

/// Result of a dequeue attempt.
pub(crate) enum Take {
    /// A page (or terminal outcome) was immediately available.
    Ready(PageResult),
    /// The queue was empty; the consumer must await this receiver.
    Pending(oneshot::Receiver<PageResult>),
}

enum Handoff {
    Empty,
    Queued(VecDeque<Page>),
    Waiting(oneshot::Sender<PageResult>),
}

enum Terminal {
    Finished,
    Failed(RequestError),
    Cancelled,
}

struct Inner {
    handoff: Handoff,
    /// Highest sequence number accepted from the transport.
    pages_received: u64,
    /// Highest sequence number handed to the consumer.
    pages_delivered: u64,
    terminal: Option<Terminal>,
    /// Connection whose reads we disabled; present iff reads are paused.
    resume_target: Option<Arc<dyn Connection>>,
}

pub(crate) struct PageQueue {
    inner: Mutex<Inner>,
    max_enqueued: usize,
    page_timeout: Duration,
    executor: Arc<dyn Executor>,
}

impl PageQueue {
    pub(crate) fn new(
        max_enqueued: usize,
        page_timeout: Duration,
        executor: Arc<dyn Executor>,
    ) -> PageQueue {
        PageQueue {
            inner: Mutex::new(Inner {
                handoff: Handoff::Empty,
                pages_received: 0,
                pages_delivered: 0,
                terminal: None,
                resume_target: None,
            }),
            max_enqueued,
            page_timeout,
            executor,
        }
    }

    /// Accepts a page from the transport thread.
    ///
    /// If a consumer is already waiting the page is handed over directly;
    /// otherwise it is appended to the bounded queue. Reaching the configured
    /// maximum occupancy disables socket reads on `connection` (exactly once
    /// per pause/resume cycle).
    pub(crate) fn offer(
        &self,
        page: Page,
        connection: Option<&Arc<dyn Connection>>,
    ) -> OfferOutcome {
        let pause_target;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                trace!(
                    sequence = page.sequence,
                    "Discarding page received after a terminal state"
                );
                return OfferOutcome::Discarded;
            }
            let expected = inner.pages_received + 1;
            if page.sequence != expected {
                return OfferOutcome::SequenceMismatch {
                    expected,
                    got: page.sequence,
                };
            }
            inner.pages_received = expected;
            if page.is_last {
                inner.terminal = Some(Terminal::Finished);
            }

            pause_target = match mem::replace(&mut inner.handoff, Handoff::Empty) {
                Handoff::Waiting(sender) => {
                    inner.pages_delivered = expected;
                    // The consumer may have stopped waiting; then the page is
                    // simply dropped along with the channel.
                    let _ = sender.send(Ok(page));
                    None
                }
                Handoff::Empty => {
                    let mut pages = VecDeque::with_capacity(self.max_enqueued);
                    pages.push_back(page);
                    let hit_limit = pages.len() >= self.max_enqueued;
                    inner.handoff = Handoff::Queued(pages);
                    self.pause_if_needed(&mut inner, hit_limit, connection)
                }
                Handoff::Queued(mut pages) => {
                    pages.push_back(page);
                    let hit_limit = pages.len() >= self.max_enqueued;
                    inner.handoff = Handoff::Queued(pages);
                    self.pause_if_needed(&mut inner, hit_limit, connection)
                }
            };
        }
        if let Some(connection) = pause_target {
            connection.pause_reads();
        }
        OfferOutcome::Delivered
    }

    fn pause_if_needed(
        &self,
        inner: &mut Inner,
        hit_limit: bool,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn Connection>> {
        if !hit_limit || inner.resume_target.is_some() {
            return None;
        }
        let connection = Arc::clone(connection?);
        inner.resume_target = Some(Arc::clone(&connection));
        Some(connection)
    }

    /// Dequeues the next page, or registers the consumer as waiting.
    ///
    /// At most one take may be outstanding at a time; a second concurrent
    /// take fails fast instead of corrupting the handoff. A per-page timeout
    /// is armed for the second page onward; the first response is governed by
    /// the connection's request timeout instead.
    pub(crate) fn dequeue_or_wait(self: &Arc<Self>) -> Take {
        let resume_target;
        let mut arm_timer = None;
        let take = {
            let mut inner = self.inner.lock().unwrap();
            let popped = match mem::replace(&mut inner.handoff, Handoff::Empty) {
                Handoff::Waiting(sender) => {
                    inner.handoff = Handoff::Waiting(sender);
                    return Take::Ready(Err(RequestError::IllegalState(
                        "take() called while a previous take() is still pending",
                    )));
                }
                Handoff::Empty => None,
                Handoff::Queued(mut pages) => {
                    let page = pages.pop_front();
                    if !pages.is_empty() {
                        inner.handoff = Handoff::Queued(pages);
                    }
                    page
                }
            };
            resume_target = match &popped {
                // Dropping from the maximum to one below re-enables reads.
                Some(_) if self.queued_len(&inner) + 1 == self.max_enqueued => {
                    inner.resume_target.take()
                }
                _ => None,
            };
            match popped {
                Some(page) => {
                    inner.pages_delivered += 1;
                    Take::Ready(Ok(page))
                }
                None => match &inner.terminal {
                    Some(Terminal::Failed(error)) => Take::Ready(Err(error.clone())),
                    Some(Terminal::Cancelled) => Take::Ready(Err(RequestError::Cancelled)),
                    Some(Terminal::Finished) => Take::Ready(Err(RequestError::NoMorePages)),
                    None => {
                        let (sender, receiver) = oneshot::channel();
                        inner.handoff = Handoff::Waiting(sender);
                        let expected = inner.pages_delivered + 1;
                        if expected >= 2 {
                            arm_timer = Some(expected);
                        }
                        Take::Pending(receiver)
                    }
                },
            }
        };
        if let Some(connection) = resume_target {
            connection.resume_reads();
        }
        if let Some(expected) = arm_timer {
            let queue = Arc::clone(self);
            self.executor.schedule(
                self.page_timeout,
                Box::new(move || queue.on_take_timeout(expected)),
            );
        }
        take
    }

    fn queued_len(&self, inner: &Inner) -> usize {
        match &inner.handoff {
            Handoff::Queued(pages) => pages.len(),
            _ => 0,
        }
    }

    /// Awaits the next page.
    pub(crate) async fn take(self: &Arc<Self>) -> PageResult {
        match self.dequeue_or_wait() {
            Take::Ready(result) => result,
            Take::Pending(receiver) => receiver.await.unwrap_or(Err(RequestError::Cancelled)),
        }
    }

    /// Blocks the calling thread until the next page is available.
    pub(crate) fn take_blocking(self: &Arc<Self>) -> PageResult {
        match self.dequeue_or_wait() {
            Take::Ready(result) => result,
            Take::Pending(receiver) => {
                futures::executor::block_on(receiver).unwrap_or(Err(RequestError::Cancelled))
            }
        }
    }

    /// Fired by the timer armed in [`PageQueue::dequeue_or_wait`]. A no-op if
    /// the expected page arrived (or the queue went terminal) in the meantime.
    fn on_take_timeout(&self, expected: u64) {
        let error = RequestError::PageTimeout {
            page: expected,
            timeout: self.page_timeout,
        };
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() || inner.pages_delivered + 1 != expected {
                return;
            }
            match mem::replace(&mut inner.handoff, Handoff::Empty) {
                Handoff::Waiting(sender) => {
                    inner.terminal = Some(Terminal::Failed(error.clone()));
                    Some(sender)
                }
                other => {
                    inner.handoff = other;
                    None
                }
            }
        };
        if let Some(sender) = pending {
            trace!(page = expected, "Page wait timed out");
            let _ = sender.send(Err(error));
        }
    }

    /// Moves the queue to the failed state. Pages already queued are drained
    /// by the consumer first; the error is delivered after them. A waiting
    /// consumer receives the error immediately.
    pub(crate) fn fail(&self, error: RequestError) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Failed(error.clone()));
            match mem::replace(&mut inner.handoff, Handoff::Empty) {
                Handoff::Waiting(sender) => Some(sender),
                other => {
                    inner.handoff = other;
                    None
                }
            }
        };
        if let Some(sender) = pending {
            let _ = sender.send(Err(error));
        }
    }

    /// Moves the queue to the cancelled state: unblocks a waiting consumer,
    /// drops undelivered pages and makes all further consumption fail fast.
    pub(crate) fn cancel(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.terminal = Some(Terminal::Cancelled);
            match mem::replace(&mut inner.handoff, Handoff::Empty) {
                Handoff::Waiting(sender) => Some(sender),
                _ => None,
            }
        };
        if let Some(sender) = pending {
            let _ = sender.send(Err(RequestError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::executor::block_on;

    use super::{OfferOutcome, PageQueue, Take};
    use crate::errors::{RequestError, WriteError};
    use crate::execution::executor::{Executor, Task};
    use crate::frame::{Page, Request, Response, StreamId};
    use crate::network::{Connection, ResponseCallback};
    use crate::test_utils::setup_tracing;

    // Runs immediate tasks inline and parks scheduled ones until fired.
    #[derive(Default)]
    struct ManualExecutor {
        scheduled: Mutex<Vec<Task>>,
    }

    impl ManualExecutor {
        fn fire_all(&self) {
            let tasks: Vec<Task> = self.scheduled.lock().unwrap().drain(..).collect();
            for task in tasks {
                task();
            }
        }

        fn scheduled_count(&self) -> usize {
            self.scheduled.lock().unwrap().len()
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

    #[derive(Default)]
    struct CountingConnection {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl Connection for CountingConnection {
        fn keyspace(&self) -> Option<String> {
            None
        }

        fn write(
            &self,
            _request: Request,
            _callback: Arc<dyn ResponseCallback>,
        ) -> Result<StreamId, WriteError> {
            unimplemented!("flow-control test double never writes")
        }

        fn executor(&self) -> Arc<dyn Executor> {
            Arc::new(ManualExecutor::default())
        }

        fn pause_reads(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_reads(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }

        fn mark_defunct(&self) {}
    }

    fn page(sequence: u64, is_last: bool) -> Page {
        Page {
            rows: vec![Bytes::from_static(b"row")],
            sequence,
            is_last,
            paging_state: None,
        }
    }

    fn queue_with(max_enqueued: usize) -> (Arc<PageQueue>, Arc<ManualExecutor>) {
        let executor = Arc::new(ManualExecutor::default());
        let queue = Arc::new(PageQueue::new(
            max_enqueued,
            Duration::from_millis(30),
            Arc::clone(&executor) as Arc<dyn Executor>,
        ));
        (queue, executor)
    }

    fn take_ready(queue: &Arc<PageQueue>) -> Result<Page, RequestError> {
        match queue.dequeue_or_wait() {
            Take::Ready(result) => result,
            Take::Pending(_) => panic!("expected a ready page"),
        }
    }

    #[test]
    fn filling_to_the_limit_pauses_reads_exactly_once() {
        setup_tracing();
        let (queue, _) = queue_with(4);
        let connection = Arc::new(CountingConnection::default());
        let connection_dyn: Arc<dyn Connection> = Arc::clone(&connection) as _;

        for sequence in 1..=4 {
            assert_eq!(
                queue.offer(page(sequence, false), Some(&connection_dyn)),
                OfferOutcome::Delivered
            );
        }
        assert_eq!(connection.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(connection.resumes.load(Ordering::SeqCst), 0);

        // Dropping to one below the maximum re-enables reads, exactly once.
        let first = take_ready(&queue).unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(connection.resumes.load(Ordering::SeqCst), 1);
        let _ = take_ready(&queue).unwrap();
        assert_eq!(connection.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiting_consumer_receives_the_page_directly() {
        setup_tracing();
        let (queue, executor) = queue_with(4);

        let receiver = match queue.dequeue_or_wait() {
            Take::Pending(receiver) => receiver,
            Take::Ready(_) => panic!("queue should be empty"),
        };
        // Expecting the first page: the request timeout, not the page
        // timeout, governs this wait.
        assert_eq!(executor.scheduled_count(), 0);

        assert_eq!(queue.offer(page(1, false), None), OfferOutcome::Delivered);
        let delivered = block_on(receiver).unwrap().unwrap();
        assert_eq!(delivered.sequence, 1);
    }

    #[test]
    fn out_of_order_page_is_reported_not_reordered() {
        setup_tracing();
        let (queue, _) = queue_with(4);
        assert_eq!(queue.offer(page(1, false), None), OfferOutcome::Delivered);
        assert_eq!(
            queue.offer(page(3, false), None),
            OfferOutcome::SequenceMismatch {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn page_timeout_is_armed_from_the_second_page_onward() {
        setup_tracing();
        let (queue, executor) = queue_with(4);
        assert_eq!(queue.offer(page(1, false), None), OfferOutcome::Delivered);
        let _ = take_ready(&queue).unwrap();

        let receiver = match queue.dequeue_or_wait() {
            Take::Pending(receiver) => receiver,
            Take::Ready(_) => panic!("queue should be empty"),
        };
        assert_eq!(executor.scheduled_count(), 1);

        // The page arrives before the timer fires; the timeout must no-op.
        assert_eq!(queue.offer(page(2, false), None), OfferOutcome::Delivered);
        executor.fire_all();
        let delivered = block_on(receiver).unwrap().unwrap();
        assert_eq!(delivered.sequence, 2);

        // The queue is still healthy afterwards.
        assert_eq!(queue.offer(page(3, true), None), OfferOutcome::Delivered);
    }

    #[test]
    fn page_timeout_fails_the_wait_when_no_page_arrived() {
        setup_tracing();
        let (queue, executor) = queue_with(4);
        assert_eq!(queue.offer(page(1, false), None), OfferOutcome::Delivered);
        let _ = take_ready(&queue).unwrap();

        let receiver = match queue.dequeue_or_wait() {
            Take::Pending(receiver) => receiver,
            Take::Ready(_) => panic!("queue should be empty"),
        };
        executor.fire_all();
        assert_matches!(
            block_on(receiver).unwrap(),
            Err(RequestError::PageTimeout { page: 2, .. })
        );

        // Late pages for the timed-out stream are silently dropped.
        assert_eq!(queue.offer(page(2, false), None), OfferOutcome::Discarded);
    }

    #[test]
    fn second_concurrent_take_fails_fast() {
        setup_tracing();
        let (queue, _) = queue_with(4);
        let _pending = match queue.dequeue_or_wait() {
            Take::Pending(receiver) => receiver,
            Take::Ready(_) => panic!("queue should be empty"),
        };
        assert_matches!(
            take_ready(&queue),
            Err(RequestError::IllegalState(_))
        );
    }

    #[test]
    fn failure_is_delivered_after_queued_pages_drain() {
        setup_tracing();
        let (queue, _) = queue_with(4);
        assert_eq!(queue.offer(page(1, false), None), OfferOutcome::Delivered);
        assert_eq!(queue.offer(page(2, false), None), OfferOutcome::Delivered);
        queue.fail(RequestError::InternalError("boom".to_string()));

        assert_eq!(take_ready(&queue).unwrap().sequence, 1);
        assert_eq!(take_ready(&queue).unwrap().sequence, 2);
        assert_matches!(take_ready(&queue), Err(RequestError::InternalError(_)));
    }

    #[test]
    fn last_page_finishes_the_stream() {
        setup_tracing();
        let (queue, _) = queue_with(4);
        assert_eq!(queue.offer(page(1, true), None), OfferOutcome::Delivered);
        let delivered = take_ready(&queue).unwrap();
        assert!(delivered.is_last);
        assert_matches!(take_ready(&queue), Err(RequestError::NoMorePages));
        // Anything the server pushes afterwards is dropped.
        assert_eq!(queue.offer(page(2, false), None), OfferOutcome::Discarded);
    }

    #[test]
    #[ntest::timeout(1000)]
    fn cancel_unblocks_a_waiting_consumer() {
        setup_tracing();
        let (queue, _) = queue_with(4);
        let receiver = match queue.dequeue_or_wait() {
            Take::Pending(receiver) => receiver,
            Take::Ready(_) => panic!("queue should be empty"),
        };
        queue.cancel();
        assert_matches!(block_on(receiver).unwrap(), Err(RequestError::Cancelled));
        // Further consumption fails fast instead of hanging.
        assert_matches!(take_ready(&queue), Err(RequestError::Cancelled));
    }
}
