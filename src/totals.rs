//! Exact sums over record sets and the whole-history cache that feeds the dashboard.

use std::sync::Arc;

use chrono::NaiveDate;
use fieldx::fxstruct;
use moka::future::Cache;
use tracing::debug;
use tracing::instrument;

use crate::amount::Amount;
use crate::cache::Generation;
use crate::cache::Generations;
use crate::coordinator::FetchCoordinator;
use crate::error::Result;
use crate::filter::display_date;
use crate::filter::Clock;
use crate::filter::DateBounds;
use crate::filter::FilterDescriptor;
use crate::filter::TimeWindow;
use crate::record::FuelRecord;
use crate::record::MaintenanceRecord;
use crate::record::Record;
use crate::record::RecordSet;
use crate::traits::Gateway;
use crate::types::ResourceKind;
use crate::types::UserId;

/// Client-side record filter: a date range, a free-text search, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPredicate {
    bounds: DateBounds,
    search: Option<String>,
}

impl RecordPredicate {
    /// Accepts everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn dates(bounds: DateBounds) -> Self {
        Self { bounds, search: None }
    }

    pub fn search<S: AsRef<str>>(text: S) -> Self {
        let text = text.as_ref().trim().to_lowercase();
        Self {
            bounds: DateBounds::default(),
            search: (!text.is_empty()).then_some(text),
        }
    }

    pub fn from_filter(filter: &FilterDescriptor, today: NaiveDate) -> Self {
        Self {
            bounds: filter.bounds(today),
            search: filter.search().map(str::to_owned),
        }
    }

    pub fn matches<R: Record>(&self, record: &R) -> bool {
        self.bounds.contains(record.date()) && self.search.as_deref().is_none_or(|needle| text_match(record, needle))
    }
}

/// Substring match over the text fields, both date renditions and the amount as displayed. `needle` must already be
/// lowercased.
fn text_match<R: Record>(record: &R, needle: &str) -> bool {
    record
        .text_fields()
        .into_iter()
        .any(|field| field.to_lowercase().contains(needle))
        || record.date().to_string().contains(needle)
        || display_date(record.date()).contains(needle)
        || record.amount().to_string().contains(needle)
}

/// Exact sum of the amounts of the records accepted by `predicate`. Empty input sums to zero.
pub fn total<'a, R, I>(records: I, predicate: &RecordPredicate) -> Amount
where
    R: Record + 'a,
    I: IntoIterator<Item = &'a R>,
{
    records
        .into_iter()
        .filter(|record| predicate.matches(*record))
        .map(|record| record.amount())
        .sum()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TotalsKey {
    user_id: UserId,
    kind:    ResourceKind,
    window:  TimeWindow,
}

/// Whole-history record sets per (user, kind) and the window totals computed from them.
///
/// Evicted together with the page cache. Stale history loads are dropped the same way [`RecordCache`] drops them.
///
/// [`RecordCache`]: crate::cache::RecordCache
#[fxstruct(sync, rc, no_new, default(off), builder)]
pub struct TotalsCache {
    #[fieldx(private, lazy, get(clone), builder(off))]
    histories: Arc<Cache<(UserId, ResourceKind), RecordSet>>,

    #[fieldx(private, lazy, get(clone), builder(off))]
    totals: Arc<Cache<TotalsKey, Amount>>,

    #[fieldx(private, lazy, lock, get_mut, builder(off))]
    generations: Generations,
}

impl TotalsCache {
    fn build_histories(&self) -> Arc<Cache<(UserId, ResourceKind), RecordSet>> {
        Arc::new(Cache::<(UserId, ResourceKind), RecordSet>::builder().name("histories").build())
    }

    fn build_totals(&self) -> Arc<Cache<TotalsKey, Amount>> {
        Arc::new(Cache::<TotalsKey, Amount>::builder().name("totals").build())
    }

    fn build_generations(&self) -> Generations {
        Generations::default()
    }

    pub fn generation(&self, user_id: &UserId, kind: ResourceKind) -> Generation {
        self.generations_mut().current(user_id, kind)
    }

    pub async fn history<R: Record>(&self, user_id: &UserId) -> Option<Vec<R>> {
        let set = self.histories().get(&(user_id.clone(), R::KIND)).await?;
        R::from_set(set)
    }

    /// Keep a freshly loaded history unless the resource was evicted after `generation` was taken.
    pub async fn put_history<R: Record>(&self, user_id: &UserId, records: Vec<R>, generation: Generation) -> bool {
        let key = (user_id.clone(), R::KIND);
        if self.generation(user_id, R::KIND) != generation {
            debug!("Dropping outdated {} history of {user_id}", R::KIND);
            return false;
        }
        self.histories().insert(key.clone(), R::into_set(records)).await;
        if self.generation(user_id, R::KIND) != generation {
            self.histories().invalidate(&key).await;
            return false;
        }
        true
    }

    pub async fn window_total(&self, user_id: &UserId, kind: ResourceKind, window: TimeWindow) -> Option<Amount> {
        self.totals()
            .get(&TotalsKey {
                user_id: user_id.clone(),
                kind,
                window,
            })
            .await
    }

    async fn put_window_total(&self, user_id: &UserId, kind: ResourceKind, window: TimeWindow, amount: Amount) {
        self.totals()
            .insert(
                TotalsKey {
                    user_id: user_id.clone(),
                    kind,
                    window,
                },
                amount,
            )
            .await;
    }

    pub async fn evict_resource(&self, user_id: &UserId, kind: ResourceKind) {
        self.generations_mut().bump(user_id, kind);
        self.sweep(user_id, kind).await;
        debug!("Evicted totals of {user_id}/{kind}");
    }

    async fn sweep(&self, user_id: &UserId, kind: ResourceKind) {
        self.histories().invalidate(&(user_id.clone(), kind)).await;

        let totals = self.totals();
        let keys: Vec<Arc<TotalsKey>> = totals
            .iter()
            .filter_map(|(key, _)| (key.kind == kind && &key.user_id == user_id).then_some(key))
            .collect();
        for key in keys {
            totals.invalidate(key.as_ref()).await;
        }
    }

    pub async fn clear(&self) {
        self.generations_mut().bump_all();
        let owners: Vec<(UserId, ResourceKind)> = self.histories().iter().map(|(key, _)| (*key).clone()).collect();
        let totals: Vec<(UserId, ResourceKind)> = self
            .totals()
            .iter()
            .map(|(key, _)| (key.user_id.clone(), key.kind))
            .collect();
        for (user_id, kind) in owners.into_iter().chain(totals) {
            self.sweep(&user_id, kind).await;
        }
        debug!("Cleared totals");
    }
}

/// Dashboard figures, all computed from whole-history caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dashboard {
    pub fuel_window:           TimeWindow,
    pub fuel_total:            Amount,
    pub maintenance_last_year: Amount,
    pub maintenance_all_time:  Amount,
}

/// Computes totals on top of a [`TotalsCache`], fetching each history from the gateway at most once until evicted.
pub struct TotalsEngine<G: Gateway> {
    coordinator: FetchCoordinator<G>,
    cache:       Arc<TotalsCache>,
    clock:       Clock,
}

impl<G: Gateway> Clone for TotalsEngine<G> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            cache:       self.cache.clone(),
            clock:       self.clock,
        }
    }
}

impl<G: Gateway> TotalsEngine<G> {
    pub fn new(coordinator: FetchCoordinator<G>, cache: Arc<TotalsCache>, clock: Clock) -> Self {
        Self {
            coordinator,
            cache,
            clock,
        }
    }

    /// Every record of the kind the user owns, newest first.
    pub async fn history<R: Record>(&self, user_id: &UserId) -> Result<Vec<R>> {
        if let Some(records) = self.cache.history::<R>(user_id).await {
            return Ok(records);
        }

        let generation = self.cache.generation(user_id, R::KIND);
        let records = self.coordinator.fetch_history::<R>(user_id).await?;
        self.cache.put_history(user_id, records.clone(), generation).await;
        Ok(records)
    }

    #[instrument(level = "debug", skip(self), fields(kind = %R::KIND))]
    pub async fn window_total<R: Record>(&self, user_id: &UserId, window: TimeWindow) -> Result<Amount> {
        if let Some(amount) = self.cache.window_total(user_id, R::KIND, window).await {
            return Ok(amount);
        }

        let generation = self.cache.generation(user_id, R::KIND);
        let history = self.history::<R>(user_id).await?;
        let amount = total(&history, &RecordPredicate::dates(window.bounds(self.clock.today())));
        if self.cache.generation(user_id, R::KIND) == generation {
            self.cache.put_window_total(user_id, R::KIND, window, amount).await;
        }
        Ok(amount)
    }

    /// Total of the records matching an arbitrary filter, search included. Not cached beyond the history itself.
    pub async fn filtered_total<R: Record>(&self, user_id: &UserId, filter: &FilterDescriptor) -> Result<Amount> {
        let history = self.history::<R>(user_id).await?;
        Ok(total(&history, &RecordPredicate::from_filter(filter, self.clock.today())))
    }

    pub async fn dashboard(&self, user_id: &UserId, fuel_window: TimeWindow) -> Result<Dashboard> {
        Ok(Dashboard {
            fuel_window,
            fuel_total: self.window_total::<FuelRecord>(user_id, fuel_window).await?,
            maintenance_last_year: self
                .window_total::<MaintenanceRecord>(user_id, TimeWindow::ONE_YEAR)
                .await?,
            maintenance_all_time: self
                .window_total::<MaintenanceRecord>(user_id, TimeWindow::AllTime)
                .await?,
        })
    }
}
