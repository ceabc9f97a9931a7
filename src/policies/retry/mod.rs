//! Request retry configuration.
//!
//! To decide when to retry a request the execution core consults an object
//! implementing the [`RetryPolicy`] trait.

mod default;
mod fallthrough;
mod retry_policy;

pub use default::DefaultRetryPolicy;
pub use fallthrough::FallthroughRetryPolicy;
pub use retry_policy::{RetryDecision, RetryPolicy};
