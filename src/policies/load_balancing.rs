//! Load balancing interface.
//!
//! Host selection itself is an external concern; the execution core only
//! consumes the ordered, lazily produced sequence of candidate hosts that a
//! policy emits for a statement.

use std::sync::Arc;

use crate::cluster::Node;
use crate::errors::PlanError;
use crate::statement::Statement;

/// An ordered, lazily evaluated sequence of candidate hosts for one request.
///
/// Items are `Result`s so that a fault inside plan iteration surfaces as an
/// error instead of hanging the failover loop.
pub type QueryPlan = Box<dyn Iterator<Item = Result<Arc<Node>, PlanError>> + Send>;

/// Produces query plans for statements.
pub trait LoadBalancingPolicy: std::fmt::Debug + Send + Sync {
    /// Returns the ordered sequence of candidate hosts for `statement`.
    fn query_plan(&self, statement: &Statement) -> QueryPlan;
}
