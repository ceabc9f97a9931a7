//! Pluggable policies consumed by the execution core.

pub mod load_balancing;
pub mod retry;
