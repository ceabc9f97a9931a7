//! Request execution: lifecycle state, failover, retries and paging.

pub mod executor;
pub(crate) mod handler;
pub(crate) mod page_queue;
pub mod pager;
pub mod state;
