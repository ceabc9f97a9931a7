//! Request-execution core for a continuous-paging database driver.
//!
//! This crate implements the part of a wire-protocol client that sends a
//! query to one of several candidate server nodes, interprets the response
//! stream, decides whether to retry or fail over on error, and buffers the
//! server-pushed sequence of result pages behind a bounded, backpressured
//! queue consumed either synchronously or asynchronously.
//!
//! Connection establishment, pooling, host selection and wire framing are
//! external collaborators, reached through the traits in [`network`] and
//! [`policies`]; this crate supplies the concurrency-critical middle: the
//! exactly-once request lifecycle, host failover, retry classification,
//! transparent re-prepare, cancellation and page flow control.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # async fn run(
//! #     load_balancing: Arc<dyn pageflow::policies::load_balancing::LoadBalancingPolicy>,
//! # ) -> Result<(), pageflow::errors::RequestError> {
//! use pageflow::client::Client;
//! use pageflow::execution::executor::TokioExecutor;
//! use pageflow::policies::retry::DefaultRetryPolicy;
//! use pageflow::statement::Statement;
//!
//! let client = Client::new(
//!     load_balancing,
//!     Arc::new(DefaultRetryPolicy::new()),
//!     Arc::new(TokioExecutor::current()),
//! );
//!
//! let statement = Statement::new("SELECT v FROM ks.t").with_idempotence(true);
//! let mut pager = client.execute_continuous(statement).await?;
//! loop {
//!     for row in pager.rows() {
//!         // decode the row bytes with an external codec
//!         let _ = row;
//!     }
//!     if pager.is_last() {
//!         break;
//!     }
//!     pager = pager.next_page().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod errors;
pub mod execution;
pub mod frame;
pub mod network;
pub mod policies;
pub mod statement;

#[cfg(test)]
pub(crate) mod test_utils;
