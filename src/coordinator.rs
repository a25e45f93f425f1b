//! Read-through fetching of record pages.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::instrument;

use crate::cache::RecordCache;
use crate::error::Error;
use crate::error::GatewayError;
use crate::error::Result;
use crate::filter::Clock;
use crate::filter::FilterDescriptor;
use crate::gateway::RowQuery;
use crate::record::sort_for_display;
use crate::record::Record;
use crate::totals::RecordPredicate;
use crate::traits::Gateway;
use crate::traits::Row;
use crate::types::CacheEntry;
use crate::types::CacheKey;
use crate::types::FetchOutcome;
use crate::types::Page;
use crate::types::PageSource;
use crate::types::ResourceKind;
use crate::types::UserId;
use crate::types::ViewGuard;

/// What a view wants to display: whose records, under which filter, which 1-based page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub user_id:   UserId,
    pub filter:    FilterDescriptor,
    pub page:      u32,
    pub page_size: u32,
}

impl FetchRequest {
    pub fn new<U: Into<UserId>>(user_id: U, filter: FilterDescriptor, page_size: u32) -> Self {
        Self {
            user_id: user_id.into(),
            filter,
            page: 1,
            page_size,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn cache_key(&self, kind: ResourceKind) -> CacheKey {
        CacheKey {
            user_id: self.user_id.clone(),
            kind,
            filter: self.filter.clone(),
            page: self.page,
        }
    }

    /// Row offsets of the requested page, end exclusive.
    pub fn offsets(&self) -> std::ops::Range<u64> {
        let size = u64::from(self.page_size);
        let start = u64::from(self.page.saturating_sub(1)) * size;
        start..start + size
    }

    fn validate(&self) -> Result<()> {
        if self.page == 0 || self.page_size == 0 {
            return Err(Error::InvalidPage);
        }
        self.filter.window().validate()?;
        Ok(())
    }
}

/// Await a gateway call for no longer than `limit`.
pub(crate) async fn timed<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(outcome) => Ok(outcome?),
        Err(_) => Err(Error::Timeout(limit)),
    }
}

fn decode<R: Record>(rows: Vec<Row>) -> Result<Vec<R>> {
    rows.into_iter().map(R::from_row).collect()
}

/// Serves pages from the [`RecordCache`] and falls back to the gateway on a miss.
///
/// Date windows are pushed down to the gateway together with the page range. Free-text search is not: with a search
/// active the whole window is loaded and filtered here, so the total count always describes the same record set as the
/// page.
pub struct FetchCoordinator<G: Gateway> {
    gateway: Arc<G>,
    cache:   Arc<RecordCache>,
    timeout: Duration,
    clock:   Clock,
}

impl<G: Gateway> Clone for FetchCoordinator<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            cache:   self.cache.clone(),
            timeout: self.timeout,
            clock:   self.clock,
        }
    }
}

impl<G: Gateway> FetchCoordinator<G> {
    pub fn new(gateway: Arc<G>, cache: Arc<RecordCache>, timeout: Duration, clock: Clock) -> Self {
        Self {
            gateway,
            cache,
            timeout,
            clock,
        }
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(level = "debug", skip_all, fields(kind = %R::KIND, user = %request.user_id, filter = %request.filter, page = request.page))]
    pub async fn fetch<R: Record>(&self, request: &FetchRequest, guard: &ViewGuard) -> Result<FetchOutcome<R>> {
        request.validate()?;
        let key = request.cache_key(R::KIND);

        if let Some(entry) = self.cache.get(&key).await {
            if let Some(records) = R::from_set(entry.records) {
                return Ok(FetchOutcome::Loaded(Page {
                    records,
                    total_count: entry.total_count,
                    page: request.page,
                    page_size: request.page_size,
                    source: PageSource::Cache,
                }));
            }
        }

        self.load(request, key, guard).await
    }

    /// Same as [`fetch`](Self::fetch) but never answers from the cache.
    #[instrument(level = "debug", skip_all, fields(kind = %R::KIND, user = %request.user_id, filter = %request.filter, page = request.page))]
    pub async fn refetch<R: Record>(&self, request: &FetchRequest, guard: &ViewGuard) -> Result<FetchOutcome<R>> {
        request.validate()?;
        self.load(request, request.cache_key(R::KIND), guard).await
    }

    /// Every record of the kind owned by `user_id`, newest first. Bypasses the page cache.
    pub async fn fetch_history<R: Record>(&self, user_id: &UserId) -> Result<Vec<R>> {
        let query = RowQuery::new(user_id.clone(), Default::default());
        let rows = timed(self.timeout, self.gateway.query(R::KIND, &query)).await?;
        let mut records = decode::<R>(rows.rows)?;
        sort_for_display(&mut records);
        debug!("Loaded {} {} record(s) of {user_id}", records.len(), R::KIND);
        Ok(records)
    }

    async fn load<R: Record>(&self, request: &FetchRequest, key: CacheKey, guard: &ViewGuard) -> Result<FetchOutcome<R>> {
        let generation = self.cache.generation(&request.user_id, R::KIND);
        let (records, total_count) = self.query_page::<R>(request).await?;

        if !guard.is_live() {
            debug!("View is gone, discarding {key}");
            return Ok(FetchOutcome::Discarded);
        }

        self.cache
            .put_if_current(
                key,
                CacheEntry {
                    records: R::into_set(records.clone()),
                    total_count,
                },
                generation,
            )
            .await;

        Ok(FetchOutcome::Loaded(Page {
            records,
            total_count,
            page: request.page,
            page_size: request.page_size,
            source: PageSource::Gateway,
        }))
    }

    async fn query_page<R: Record>(&self, request: &FetchRequest) -> Result<(Vec<R>, u64)> {
        let bounds = request.filter.bounds(self.clock.today());
        let query = RowQuery::new(request.user_id.clone(), bounds);

        match request.filter.search() {
            None => {
                let rows = timed(
                    self.timeout,
                    self.gateway.query(R::KIND, &query.with_range(request.offsets())),
                )
                .await?;
                let mut records = decode::<R>(rows.rows)?;
                sort_for_display(&mut records);
                Ok((records, rows.total_count))
            }
            Some(search) => {
                let rows = timed(self.timeout, self.gateway.query(R::KIND, &query)).await?;
                let predicate = RecordPredicate::search(search);
                let mut matching: Vec<R> = decode::<R>(rows.rows)?
                    .into_iter()
                    .filter(|record| predicate.matches(record))
                    .collect();
                sort_for_display(&mut matching);

                let total_count = matching.len() as u64;
                let range = request.offsets();
                let records = matching
                    .into_iter()
                    .skip(range.start as usize)
                    .take(request.page_size as usize)
                    .collect();
                Ok((records, total_count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offsets() {
        let request = FetchRequest::new("u1", FilterDescriptor::all_time(), 10);
        assert_eq!(request.offsets(), 0..10);
        assert_eq!(request.clone().with_page(3).offsets(), 20..30);
        assert!(request.clone().with_page(0).validate().is_err());
        assert!(FetchRequest::new("u1", FilterDescriptor::all_time(), 0).validate().is_err());
    }

    #[tokio::test]
    async fn timeout_is_reported_as_such() {
        let limit = Duration::from_millis(10);
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, GatewayError>(())
        };
        assert!(matches!(timed(limit, slow).await, Err(Error::Timeout(d)) if d == limit));

        let failing = async { Err::<(), _>(GatewayError::Unauthenticated) };
        assert!(matches!(timed(limit, failing).await, Err(Error::Unauthenticated)));
    }
}
