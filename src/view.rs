use std::fmt::Debug;
use std::sync::Arc;

use fieldx_plus::fx_plus;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::debug;

use crate::coordinator::FetchRequest;
use crate::error::Error;
use crate::error::Result;
use crate::filter::FilterDescriptor;
use crate::ledger::Ledger;
use crate::listener::wait_for_state;
use crate::listener::ListenerContext;
use crate::listener::ListenerState;
use crate::listener::LiveUpdateListener;
use crate::record::Record;
use crate::traits::Gateway;
use crate::traits::Observer;
use crate::types::FetchOutcome;
use crate::types::ViewGuard;

/// A list of records of one kind as some screen displays it.
///
/// The view owns the key it displays (filter and page), the liveness guard every fetch it issues is checked
/// against, and optionally a live update listener. Changing the filter or page is pushed to the listener right away,
/// so a refresh triggered by a change event always targets what is displayed now.
///
/// Closing or dropping the view kills the guard: responses still in flight are discarded, nothing gets cached on
/// their behalf, and the observer hears nothing more.
#[fx_plus(child(Ledger<G>, rc_strong), sync, rc, default(off))]
pub struct ResourceView<G, R>
where
    G: Gateway,
    R: Record,
{
    #[fieldx(get(clone))]
    observer: Arc<dyn Observer<R>>,

    #[fieldx(private, get, builder(vis(pub(crate))))]
    request: watch::Sender<FetchRequest>,

    #[fieldx(get(clone), builder(off), default(ViewGuard::new()))]
    guard: ViewGuard,

    #[fieldx(private, get, builder(off), default(Mutex::new(None)))]
    listener: Mutex<Option<LiveUpdateListener<G>>>,
}

impl<G, R> ResourceView<G, R>
where
    G: Gateway,
    R: Record,
{
    /// The key currently displayed.
    pub fn current_request(&self) -> FetchRequest {
        self.request().borrow().clone()
    }

    pub fn is_live(&self) -> bool {
        self.guard().is_live()
    }

    /// The current key, provided its user is still the one signed in.
    fn session_request(&self) -> Result<FetchRequest> {
        let request = self.current_request();
        self.parent().ensure_user(&request.user_id)?;
        Ok(request)
    }

    /// Page for the current key, from the cache when possible.
    pub async fn load(&self) -> Result<FetchOutcome<R>> {
        let request = self.session_request()?;
        self.parent().coordinator()?.fetch::<R>(&request, &self.guard()).await
    }

    /// Page for the current key, straight from the gateway.
    pub async fn reload(&self) -> Result<FetchOutcome<R>> {
        let request = self.session_request()?;
        self.parent().coordinator()?.refetch::<R>(&request, &self.guard()).await
    }

    /// Switch to another filter. Goes back to the first page.
    pub async fn set_filter(&self, filter: FilterDescriptor) -> Result<FetchOutcome<R>> {
        self.request().send_modify(|request| {
            request.filter = filter;
            request.page = 1;
        });
        self.load().await
    }

    pub async fn set_page(&self, page: u32) -> Result<FetchOutcome<R>> {
        if page == 0 {
            return Err(Error::InvalidPage);
        }
        self.request().send_modify(|request| request.page = page);
        self.load().await
    }

    /// Subscribe to the changes of the view's table. Does nothing if already listening. The listener stops on its own
    /// once the session's user signs out.
    pub async fn start_live_updates(&self) -> Result<()> {
        let request = self.session_request()?;
        let mut listener = self.listener().lock().await;
        if listener.as_ref().is_some_and(|l| l.is_running()) {
            return Ok(());
        }

        let ledger = self.parent();
        *listener = Some(LiveUpdateListener::spawn(ListenerContext {
            gateway:     ledger.gateway(),
            coordinator: ledger.coordinator()?,
            invalidator: ledger.invalidator()?,
            request:     self.request().subscribe(),
            user_id:     request.user_id,
            session:     ledger.sessions(),
            guard:       ViewGuard::new(),
            view:        self.guard(),
            observer:    self.observer(),
            policy:      ledger.config().reconnect_policy(),
        }));
        Ok(())
    }

    pub async fn stop_live_updates(&self) {
        let listener = self.listener().lock().await.take();
        if let Some(listener) = listener {
            listener.stop().await;
            debug!("Stopped live updates of {}", R::KIND);
        }
    }

    pub async fn listener_state(&self) -> ListenerState {
        self.listener()
            .lock()
            .await
            .as_ref()
            .map_or(ListenerState::Unsubscribed, |l| l.state())
    }

    /// Wait until the listener state satisfies `condition`. `None` when the view isn't listening.
    pub async fn wait_for_listener<F>(&self, condition: F) -> Option<ListenerState>
    where
        F: Fn(&ListenerState) -> bool,
    {
        let states = self.listener().lock().await.as_ref().map(|l| l.states())?;
        Some(wait_for_state(states, condition).await)
    }

    /// Tear the view down. In-flight fetches are discarded when they complete. Only this, or dropping the view, ends
    /// it; stopping live updates doesn't.
    pub async fn close(&self) {
        self.guard().kill();
        self.stop_live_updates().await;
    }
}

impl<G, R> Drop for ResourceView<G, R>
where
    G: Gateway,
    R: Record,
{
    fn drop(&mut self) {
        self.guard.kill();
        // The listener's own drop aborts its task and releases the subscription.
        drop(self.listener.get_mut().take());
    }
}

impl<G, R> Debug for ResourceView<G, R>
where
    G: Gateway,
    R: Record,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceView")
            .field("kind", &R::KIND)
            .field("request", &self.current_request())
            .field("live", &self.is_live())
            .finish()
    }
}
