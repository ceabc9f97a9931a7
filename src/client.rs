//! The top-level entry point for executing continuous-paging requests.

use std::sync::Arc;

use tracing::debug;

use crate::errors::RequestError;
use crate::execution::executor::Executor;
use crate::execution::handler::ContinuousRequestHandler;
use crate::execution::page_queue::PageQueue;
use crate::execution::pager::{ContinuousPager, ContinuousRowIter};
use crate::frame::Request;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;
use crate::statement::{PreparedCache, PreparedStatement, Statement};

/// Executes statements with continuous paging against a cluster.
///
/// The client owns the pluggable policies and the prepared statement cache;
/// connections and topology are supplied per request through the load
/// balancing policy's query plans. One client serves any number of
/// concurrent requests; each request gets its own lifecycle state and page
/// queue, never shared or reused.
pub struct Client {
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    prepared_cache: Arc<PreparedCache>,
    executor: Arc<dyn Executor>,
}

impl Client {
    /// Creates a client with the given policies. `executor` is where page
    /// timeouts are scheduled.
    pub fn new(
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        retry_policy: Arc<dyn RetryPolicy>,
        executor: Arc<dyn Executor>,
    ) -> Client {
        Client {
            load_balancing,
            retry_policy,
            prepared_cache: Arc::new(PreparedCache::new()),
            executor,
        }
    }

    /// The prepared statement cache consulted for UNPREPARED recovery.
    /// Statements prepared out of band should be registered here.
    pub fn prepared_cache(&self) -> &Arc<PreparedCache> {
        &self.prepared_cache
    }

    /// Runs an unprepared statement with continuous paging and waits for the
    /// first page.
    pub async fn execute_continuous(
        &self,
        statement: Statement,
    ) -> Result<ContinuousPager, RequestError> {
        let statement = Arc::new(statement);
        let request = Request::Query {
            statement: Arc::clone(&statement),
            consistency: statement.consistency,
        };
        let handler = self.spawn_handler(statement, request);
        let page = handler.queue().take().await?;
        Ok(ContinuousPager::new(handler, page))
    }

    /// Runs a prepared statement with continuous paging and waits for the
    /// first page.
    pub async fn execute_prepared_continuous(
        &self,
        prepared: Arc<PreparedStatement>,
    ) -> Result<ContinuousPager, RequestError> {
        let statement = Arc::new(prepared.statement.clone());
        let request = Request::Execute {
            prepared,
            consistency: statement.consistency,
        };
        let handler = self.spawn_handler(statement, request);
        let page = handler.queue().take().await?;
        Ok(ContinuousPager::new(handler, page))
    }

    /// Blocking variant of [`Client::execute_continuous`], returning a row
    /// iterator. Must not be called from an async context.
    pub fn execute_continuous_blocking(
        &self,
        statement: Statement,
    ) -> Result<ContinuousRowIter, RequestError> {
        let statement = Arc::new(statement);
        let request = Request::Query {
            statement: Arc::clone(&statement),
            consistency: statement.consistency,
        };
        let handler = self.spawn_handler(statement, request);
        let page = handler.queue().take_blocking()?;
        Ok(ContinuousRowIter::new(handler, page))
    }

    /// Blocking variant of [`Client::execute_prepared_continuous`].
    pub fn execute_prepared_continuous_blocking(
        &self,
        prepared: Arc<PreparedStatement>,
    ) -> Result<ContinuousRowIter, RequestError> {
        let statement = Arc::new(prepared.statement.clone());
        let request = Request::Execute {
            prepared,
            consistency: statement.consistency,
        };
        let handler = self.spawn_handler(statement, request);
        let page = handler.queue().take_blocking()?;
        Ok(ContinuousRowIter::new(handler, page))
    }

    fn spawn_handler(
        &self,
        statement: Arc<Statement>,
        request: Request,
    ) -> Arc<ContinuousRequestHandler> {
        debug!(
            statement = %statement.contents,
            page_size = statement.paging.page_size,
            "Starting a continuous-paging request"
        );
        let queue = Arc::new(PageQueue::new(
            statement.paging.max_enqueued_pages,
            statement.paging.read_timeout,
            Arc::clone(&self.executor),
        ));
        let handler = ContinuousRequestHandler::new(
            statement,
            request,
            Arc::clone(&self.load_balancing),
            Arc::clone(&self.retry_policy),
            Arc::clone(&self.prepared_cache),
            queue,
        );
        handler.start();
        handler
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("load_balancing", &self.load_balancing)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}
