//! Transport-facing interfaces: connections and connection pools.
//!
//! Connection establishment, pooling and wire framing live outside this
//! crate; the execution core only depends on the traits defined here.

mod connection;
mod pool;

pub use connection::{Connection, ResponseCallback};
pub use pool::ConnectionPool;
