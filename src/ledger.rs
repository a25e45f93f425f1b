use std::sync::Arc;

use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::amount::Amount;
use crate::cache::RecordCache;
use crate::config::LedgerConfig;
use crate::coordinator::timed;
use crate::coordinator::FetchCoordinator;
use crate::coordinator::FetchRequest;
use crate::error::Error;
use crate::error::Result;
use crate::filter::Clock;
use crate::filter::FilterDescriptor;
use crate::filter::TimeWindow;
use crate::invalidator::MutationInvalidator;
use crate::record::Record;
use crate::totals::Dashboard;
use crate::totals::TotalsCache;
use crate::totals::TotalsEngine;
use crate::traits::Gateway;
use crate::traits::NoopObserver;
use crate::traits::Observer;
use crate::types::FetchOutcome;
use crate::types::Identity;
use crate::types::Notice;
use crate::types::RecordId;
use crate::types::UserId;
use crate::types::ViewGuard;
use crate::view::ResourceView;

const NOTICE_CAPACITY: usize = 32;

/// The signed-in user's session: one gateway, the caches in front of it, and the identity everything is scoped by.
///
/// ```ignore
/// let ledger = Ledger::builder().gateway(gateway).build()?;
/// ledger.start().await?;
///
/// let view = ledger.open_view::<FuelRecord>(TimeWindow::ONE_MONTH.into(), observer).await?;
/// let page = view.load().await?;
///
/// ledger.create::<FuelRecord>(FuelDraft { amount: "42.10".parse()?, date }).await?;
/// // The view's listener evicts and re-fetches; `observer` receives the fresh page.
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    fallible(off, error(Error)),
    builder(
        doc("Builder object of [`Ledger`].", "", "See [`Ledger::builder()`] method."),
        method_doc("Implement builder pattern for [`Ledger`]."),
    )
)]
pub struct Ledger<G>
where
    G: Gateway,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    gateway: Arc<G>,

    #[fieldx(get(clone), default(LedgerConfig::default()))]
    config: LedgerConfig,

    /// Where "today" comes from when resolving relative time windows.
    #[fieldx(get(copy), default(Clock::System))]
    clock: Clock,

    #[fieldx(inner_mut, get(clone), set, builder(off), default(None))]
    identity: Option<Identity>,

    #[fieldx(lazy, fallible, private, get(clone), builder(off))]
    records: Arc<RecordCache>,

    #[fieldx(lazy, fallible, private, get(clone), builder(off))]
    totals_cache: Arc<TotalsCache>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    notices: broadcast::Sender<Notice>,

    /// The signed-in user, for views and listeners to notice logouts.
    #[fieldx(lazy, private, get(clone), builder(off))]
    session: watch::Sender<Option<UserId>>,
}

impl<G> Ledger<G>
where
    G: Gateway,
{
    fn build_records(&self) -> Result<Arc<RecordCache>> {
        Ok(RecordCache::builder()
            .name("records")
            .max_capacity(self.config().cache_capacity())
            .build()?)
    }

    fn build_totals_cache(&self) -> Result<Arc<TotalsCache>> {
        Ok(TotalsCache::builder().build()?)
    }

    fn build_notices(&self) -> broadcast::Sender<Notice> {
        broadcast::channel(NOTICE_CAPACITY).0
    }

    fn build_session(&self) -> watch::Sender<Option<UserId>> {
        watch::Sender::new(None)
    }

    /// Ask the gateway who is signed in and bind the session to that user. A different user than before starts
    /// with empty caches.
    #[instrument(level = "debug", skip(self))]
    pub async fn start(&self) -> Result<Identity> {
        let identity = match timed(self.config().gateway_timeout(), self.gateway().current_user()).await {
            Ok(identity) => identity,
            Err(Error::Unauthenticated) => {
                if let Some(expired) = self.identity() {
                    warn!("Session of {} is no longer valid", expired.user_id);
                }
                self.bind(None);
                self.clear_caches().await?;
                return Err(Error::Unauthenticated);
            }
            Err(err) => return Err(err),
        };

        if self
            .identity()
            .is_some_and(|current| current.user_id != identity.user_id)
        {
            self.bind(None);
            self.clear_caches().await?;
        }

        info!("Session started for {} <{}>", identity.user_id, identity.email);
        self.bind(Some(identity.clone()));
        Ok(identity)
    }

    /// Forget the user and everything cached on their behalf. Live views of the session stop listening.
    pub async fn logout(&self) -> Result<()> {
        if let Some(identity) = self.identity() {
            info!("Session of {} ended", identity.user_id);
        }
        self.bind(None);
        self.clear_caches().await
    }

    fn bind(&self, identity: Option<Identity>) {
        self.session()
            .send_replace(identity.as_ref().map(|identity| identity.user_id.clone()));
        self.set_identity(identity);
    }

    /// Follows the signed-in user.
    pub(crate) fn sessions(&self) -> watch::Receiver<Option<UserId>> {
        self.session().subscribe()
    }

    /// Fails unless `user_id` is the one signed in.
    pub fn ensure_user(&self, user_id: &UserId) -> Result<()> {
        if self.user_id()? == *user_id {
            Ok(())
        }
        else {
            Err(Error::Unauthenticated)
        }
    }

    async fn clear_caches(&self) -> Result<()> {
        self.records()?.clear().await;
        self.totals_cache()?.clear().await;
        Ok(())
    }

    pub fn user_id(&self) -> Result<UserId> {
        self.identity()
            .map(|identity| identity.user_id)
            .ok_or(Error::Unauthenticated)
    }

    pub fn coordinator(&self) -> Result<FetchCoordinator<G>> {
        Ok(FetchCoordinator::new(
            self.gateway(),
            self.records()?,
            self.config().gateway_timeout(),
            self.clock(),
        ))
    }

    pub fn invalidator(&self) -> Result<MutationInvalidator<G>> {
        Ok(MutationInvalidator::new(
            self.gateway(),
            self.records()?,
            self.totals_cache()?,
            self.notices(),
            self.config().gateway_timeout(),
        ))
    }

    pub fn totals(&self) -> Result<TotalsEngine<G>> {
        Ok(TotalsEngine::new(self.coordinator()?, self.totals_cache()?, self.clock()))
    }

    /// Mutation outcomes, as they happen.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices().subscribe()
    }

    /// First page of `filter` for the signed-in user, with the configured page size.
    pub fn request(&self, filter: FilterDescriptor) -> Result<FetchRequest> {
        Ok(FetchRequest::new(self.user_id()?, filter, self.config().page_size()))
    }

    /// One-off fetch outside of any view.
    pub async fn fetch<R: Record>(&self, filter: FilterDescriptor, page: u32) -> Result<FetchOutcome<R>> {
        let request = self.request(filter)?.with_page(page);
        self.coordinator()?.fetch::<R>(&request, &ViewGuard::new()).await
    }

    pub async fn create<R: Record>(&self, draft: R::Draft) -> Result<R> {
        self.invalidator()?.create::<R>(&self.user_id()?, draft).await
    }

    pub async fn update<R: Record>(&self, id: &RecordId, patch: R::Patch) -> Result<R> {
        self.invalidator()?.update::<R>(&self.user_id()?, id, patch).await
    }

    pub async fn delete<R: Record>(&self, id: &RecordId) -> Result<()> {
        self.invalidator()?.delete::<R>(&self.user_id()?, id).await
    }

    pub async fn window_total<R: Record>(&self, window: TimeWindow) -> Result<Amount> {
        self.totals()?.window_total::<R>(&self.user_id()?, window).await
    }

    pub async fn filtered_total<R: Record>(&self, filter: &FilterDescriptor) -> Result<Amount> {
        self.totals()?.filtered_total::<R>(&self.user_id()?, filter).await
    }

    pub async fn dashboard(&self, fuel_window: TimeWindow) -> Result<Dashboard> {
        self.totals()?.dashboard(&self.user_id()?, fuel_window).await
    }

    /// A view without live updates. `observer` only matters once [`ResourceView::start_live_updates`] is called.
    pub fn view<R: Record>(
        &self,
        filter: FilterDescriptor,
        observer: Arc<dyn Observer<R>>,
    ) -> Result<Arc<ResourceView<G, R>>> {
        let request = self.request(filter)?;
        Ok(child_build!(
            self,
            ResourceView<G, R> {
                observer: observer,
                request:  watch::Sender::new(request),
            }
        )?)
    }

    /// A view that follows the table's change feed right away.
    pub async fn open_view<R: Record>(
        &self,
        filter: FilterDescriptor,
        observer: Arc<dyn Observer<R>>,
    ) -> Result<Arc<ResourceView<G, R>>> {
        let view = self.view(filter, observer)?;
        view.start_live_updates().await?;
        Ok(view)
    }

    /// A view nobody observes; for reading pages on demand.
    pub fn plain_view<R: Record>(&self, filter: FilterDescriptor) -> Result<Arc<ResourceView<G, R>>> {
        self.view(filter, Arc::new(NoopObserver))
    }
}
