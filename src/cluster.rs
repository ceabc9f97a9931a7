//! Hosts and their connection pools, as seen by the execution core.
//!
//! Topology discovery and pool management are external collaborators; this
//! module only defines the identity of a server node and the handle through
//! which a query plan lends its pool to the failover loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::network::ConnectionPool;

/// Identifies a server node. Ordering among hosts is supplied externally by
/// the load balancing policy and is consumed, never computed, by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    /// Cluster-wide unique id of the node.
    pub id: Uuid,
    /// Address the node is reachable at.
    pub address: SocketAddr,
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.id)
    }
}

/// A host together with its connection pool. Query plans yield these.
pub struct Node {
    host: Host,
    pool: Arc<dyn ConnectionPool>,
}

impl Node {
    /// Binds a host to its connection pool.
    pub fn new(host: Host, pool: Arc<dyn ConnectionPool>) -> Node {
        Node { host, pool }
    }

    /// The host this node represents.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The pool connections to this host are borrowed from.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("host", &self.host).finish()
    }
}
