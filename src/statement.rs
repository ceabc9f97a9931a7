//! Statements and their continuous-paging configuration.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use crate::frame::Consistency;

/// Default consistency used when a statement does not set one.
pub const DEFAULT_CONSISTENCY: Consistency = Consistency::LocalQuorum;

/// Unit in which the continuous-paging page size is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUnit {
    /// Page size is a number of rows.
    Rows,
    /// Page size is a number of bytes.
    Bytes,
}

/// Options of a continuous-paging read, sent to the server with the request.
///
/// The server enforces `max_pages` and `max_pages_per_second`; the client only
/// transports them. `max_enqueued_pages` and `read_timeout` are client-side:
/// they bound the page queue and the wait for each page respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousPagingOptions {
    /// Size of a single page.
    pub page_size: u32,
    /// Unit of `page_size`.
    pub page_unit: PageUnit,
    /// Maximum number of pages the server will send in total. 0 means no limit.
    pub max_pages: u32,
    /// Maximum rate of pages per second. 0 means no limit.
    pub max_pages_per_second: u32,
    /// How many pages may sit in the client-side queue before socket reads
    /// are disabled for the connection.
    pub max_enqueued_pages: usize,
    /// How long the consumer waits for each page (from the second page onward;
    /// the first response is governed by the connection's request timeout).
    pub read_timeout: Duration,
}

impl Default for ContinuousPagingOptions {
    fn default() -> ContinuousPagingOptions {
        ContinuousPagingOptions {
            page_size: 5000,
            page_unit: PageUnit::Rows,
            max_pages: 0,
            max_pages_per_second: 0,
            max_enqueued_pages: 4,
            read_timeout: Duration::from_secs(12),
        }
    }
}

/// A statement to be executed with continuous paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// The statement text.
    pub contents: String,
    /// Consistency the statement will be executed with.
    pub consistency: Consistency,
    /// Whether re-executing this statement is safe. Only idempotent statements
    /// are eligible for the generic request-error retry path.
    pub is_idempotent: bool,
    /// Continuous-paging configuration of this statement.
    pub paging: ContinuousPagingOptions,
}

impl Statement {
    /// Creates a new statement with default configuration.
    pub fn new(contents: impl Into<String>) -> Statement {
        Statement {
            contents: contents.into(),
            consistency: DEFAULT_CONSISTENCY,
            is_idempotent: false,
            paging: ContinuousPagingOptions::default(),
        }
    }

    /// Sets the consistency level.
    pub fn with_consistency(mut self, consistency: Consistency) -> Statement {
        self.consistency = consistency;
        self
    }

    /// Marks the statement as idempotent.
    pub fn with_idempotence(mut self, is_idempotent: bool) -> Statement {
        self.is_idempotent = is_idempotent;
        self
    }

    /// Sets the continuous-paging options.
    pub fn with_paging_options(mut self, paging: ContinuousPagingOptions) -> Statement {
        self.paging = paging;
        self
    }
}

/// A statement previously prepared on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Server-assigned id of the prepared statement.
    pub id: Bytes,
    /// The statement this was prepared from.
    pub statement: Statement,
    /// Keyspace the statement was prepared in, if any.
    pub keyspace: Option<String>,
}

/// Registry of prepared statements known to the client, keyed by prepared id.
///
/// When a host replies `Unprepared`, the execution core looks the statement up
/// here and transparently re-prepares it on the same connection. The cache is
/// passed explicitly so it can be constructed per test.
#[derive(Debug, Default)]
pub struct PreparedCache {
    statements: DashMap<Bytes, Arc<PreparedStatement>>,
}

impl PreparedCache {
    /// Creates an empty cache.
    pub fn new() -> PreparedCache {
        PreparedCache::default()
    }

    /// Registers a prepared statement under its id.
    pub fn insert(&self, prepared: Arc<PreparedStatement>) {
        self.statements.insert(prepared.id.clone(), prepared);
    }

    /// Looks a prepared statement up by its id.
    pub fn lookup(&self, id: &Bytes) -> Option<Arc<PreparedStatement>> {
        self.statements.get(id).map(|entry| Arc::clone(entry.value()))
    }
}
