//! Consumer-facing views over a continuous-paging result stream.
//!
//! [`ContinuousPager`] is the asynchronous view: one value per delivered
//! page, consumed by value to move to the next one. [`ContinuousRowIter`]
//! wraps the same stream in a blocking row iterator for synchronous callers.
//! Both drive the same underlying page queue and are single-consumer by
//! construction.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::RequestError;
use crate::execution::handler::ContinuousRequestHandler;
use crate::frame::Page;

/// One delivered page of an asynchronously consumed result stream.
///
/// `next_page` consumes `self`: a page can be advanced past exactly once,
/// which makes double-fetching the same position a compile error rather than
/// a runtime one.
pub struct ContinuousPager {
    handler: Arc<ContinuousRequestHandler>,
    page: Page,
}

impl ContinuousPager {
    pub(crate) fn new(handler: Arc<ContinuousRequestHandler>, page: Page) -> ContinuousPager {
        ContinuousPager { handler, page }
    }

    /// Raw rows of the current page.
    pub fn rows(&self) -> &[Bytes] {
        &self.page.rows
    }

    /// 1-based position of the current page in the stream.
    pub fn sequence(&self) -> u64 {
        self.page.sequence
    }

    /// Whether this is the final page. Check before calling
    /// [`ContinuousPager::next_page`].
    pub fn is_last(&self) -> bool {
        self.page.is_last
    }

    /// Waits for the next page of the stream.
    ///
    /// Fails immediately with [`RequestError::NoMorePages`] when called on
    /// the last page.
    pub async fn next_page(self) -> Result<ContinuousPager, RequestError> {
        if self.page.is_last {
            return Err(RequestError::NoMorePages);
        }
        let page = self.handler.queue().take().await?;
        Ok(ContinuousPager {
            handler: self.handler,
            page,
        })
    }

    /// Cancels the request. Pages still in flight are discarded; see
    /// [`crate::client::Client`] docs for the full cancellation contract.
    pub fn cancel(&self) {
        self.handler.cancel();
    }
}

impl fmt::Debug for ContinuousPager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousPager")
            .field("sequence", &self.page.sequence)
            .field("is_last", &self.page.is_last)
            .field("rows", &self.page.rows.len())
            .finish()
    }
}

/// Blocking row iterator over a continuous-paging result stream.
///
/// Yields each row of the current page, then blocks for the next page. The
/// iterator ends cleanly (yields `None`) after the last page and after a
/// cancellation; any other terminal error is yielded once as an `Err` item.
/// Not meant for concurrent use from multiple threads, matching the
/// single-consumer contract of the underlying stream.
pub struct ContinuousRowIter {
    handler: Arc<ContinuousRequestHandler>,
    page: Option<Page>,
    row: usize,
    done: bool,
}

impl ContinuousRowIter {
    pub(crate) fn new(handler: Arc<ContinuousRequestHandler>, page: Page) -> ContinuousRowIter {
        ContinuousRowIter {
            handler,
            page: Some(page),
            row: 0,
            done: false,
        }
    }

    /// Cancels the request; iteration ends after the rows already delivered.
    pub fn cancel(&self) {
        self.handler.cancel();
    }
}

impl Iterator for ContinuousRowIter {
    type Item = Result<Bytes, RequestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(page) = &self.page {
                if self.row < page.rows.len() {
                    let row = page.rows[self.row].clone();
                    self.row += 1;
                    return Some(Ok(row));
                }
                if page.is_last {
                    self.done = true;
                    return None;
                }
                self.page = None;
            }
            match self.handler.queue().take_blocking() {
                Ok(page) => {
                    self.page = Some(page);
                    self.row = 0;
                }
                Err(RequestError::Cancelled) | Err(RequestError::NoMorePages) => {
                    self.done = true;
                    return None;
                }
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

impl fmt::Debug for ContinuousRowIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousRowIter")
            .field("sequence", &self.page.as_ref().map(|page| page.sequence))
            .field("row", &self.row)
            .field("done", &self.done)
            .finish()
    }
}
