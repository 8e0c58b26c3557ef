//! Server-side paging for collections too large for the local projection.
//!
//! Every fetch takes a ticket from a monotonically increasing sequence. A
//! response is only delivered if no newer fetch was issued in the meantime,
//! so a slow answer to an old query never overwrites a newer one.

use crate::core::{Entity, Result};
use crate::projection::total_pages;
use crate::remote::{PageQuery, RemoteCollectionSource};
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct ServerPage {
    /// Ticket of the fetch that produced this page.
    pub sequence: u64,
    pub query: PageQuery,
    pub rows: Vec<Entity>,
    pub total_count: usize,
    pub total_pages: usize,
}

pub struct ServerPager {
    remote: Arc<dyn RemoteCollectionSource>,
    sequence: AtomicU64,
}

impl ServerPager {
    pub fn new(remote: Arc<dyn RemoteCollectionSource>) -> Self {
        Self {
            remote,
            sequence: AtomicU64::new(0),
        }
    }

    /// Ticket of the most recently issued fetch.
    pub fn latest(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Fetch one page. Resolves to `Ok(None)` when a newer fetch was issued
    /// while this one was in flight; its result or error is dropped.
    pub async fn fetch(&self, query: PageQuery) -> Result<Option<ServerPage>> {
        let ticket = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.remote.fetch_page(&query).await;

        if self.latest() != ticket {
            debug!("discarding superseded page fetch #{}", ticket);
            return Ok(None);
        }

        let page = result?;
        Ok(Some(ServerPage {
            sequence: ticket,
            total_pages: total_pages(page.total_count, query.page_size),
            query,
            rows: page.rows,
            total_count: page.total_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityDraft;
    use crate::remote::{InMemoryRemote, RemoteError, RemoteOp};
    use chrono::Utc;
    use std::time::Duration;

    fn remote_with(count: usize) -> InMemoryRemote {
        let remote = InMemoryRemote::new("categories");
        let now = Utc::now();
        remote.seed(
            (0..count)
                .map(|i| Entity::new(format!("c{i:02}"), EntityDraft::named(&format!("Item {i:02}")).build(), now))
                .collect(),
        );
        remote
    }

    #[tokio::test]
    async fn test_fetch_reports_totals() {
        let pager = ServerPager::new(Arc::new(remote_with(23)));
        let page = pager.fetch(PageQuery::all(2, 10)).await.unwrap().unwrap();

        assert_eq!(page.sequence, 1);
        assert_eq!(page.rows.len(), 3);
        assert_eq!(page.total_count, 23);
        assert_eq!(page.total_pages, 3);
    }

    #[tokio::test]
    async fn test_superseded_fetch_is_dropped() {
        let remote = remote_with(5);
        remote.set_latency(Duration::from_millis(30));
        let pager = ServerPager::new(Arc::new(remote));

        let (first, second) = tokio::join!(
            pager.fetch(PageQuery::all(0, 2)),
            pager.fetch(PageQuery::all(1, 2))
        );

        assert_eq!(first.unwrap(), None);
        let second = second.unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.query.page_index, 1);
    }

    #[tokio::test]
    async fn test_latest_fetch_surfaces_errors() {
        let remote = remote_with(1);
        remote.fail_next(RemoteOp::FetchPage, RemoteError::Network("down".into()));
        let pager = ServerPager::new(Arc::new(remote));

        assert!(pager.fetch(PageQuery::all(0, 10)).await.is_err());
        assert!(pager.fetch(PageQuery::all(0, 10)).await.unwrap().is_some());
    }
}
