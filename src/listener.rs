//! Per-view task turning backend change events into cache eviction and a fresh page.

use std::fmt;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::coordinator::timed;
use crate::coordinator::FetchCoordinator;
use crate::coordinator::FetchRequest;
use crate::error::Error;
use crate::gateway::ChangeEvent;
use crate::gateway::Subscription;
use crate::gateway::SubscriptionId;
use crate::invalidator::MutationInvalidator;
use crate::record::Record;
use crate::traits::Gateway;
use crate::traits::Observer;
use crate::types::FetchOutcome;
use crate::types::UserId;
use crate::types::ViewGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unsubscribed,
    Subscribed(SubscriptionId),
    /// Evicting and re-fetching after an event.
    Refreshing(SubscriptionId),
}

impl ListenerState {
    pub fn subscription(&self) -> Option<SubscriptionId> {
        match self {
            Self::Unsubscribed => None,
            Self::Subscribed(id) | Self::Refreshing(id) => Some(*id),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        !matches!(self, Self::Unsubscribed)
    }
}

impl Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubscribed => f.write_str("unsubscribed"),
            Self::Subscribed(id) => write!(f, "subscribed({id})"),
            Self::Refreshing(id) => write!(f, "refreshing({id})"),
        }
    }
}

/// How to re-establish a change feed the backend dropped. Delays double after every failed attempt, up to
/// `max_delay`. Zero attempts means a dropped feed is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts:      u32,
    pub initial_delay: Duration,
    pub max_delay:     Duration,
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts:      5,
            initial_delay: Duration::from_millis(500),
            max_delay:     Duration::from_secs(30),
        }
    }
}

/// Everything the listener task needs. The request receiver always yields what the view displays at the moment.
///
/// `guard` belongs to the listener and dies with it; `view` is the guard of the view it serves. Either one dead, or
/// `user_id` no longer signed in, and the task goes quiet.
pub(crate) struct ListenerContext<G, R>
where
    G: Gateway,
    R: Record,
{
    pub(crate) gateway:     Arc<G>,
    pub(crate) coordinator: FetchCoordinator<G>,
    pub(crate) invalidator: MutationInvalidator<G>,
    pub(crate) request:     watch::Receiver<FetchRequest>,
    pub(crate) user_id:     UserId,
    pub(crate) session:     watch::Receiver<Option<UserId>>,
    pub(crate) guard:       ViewGuard,
    pub(crate) view:        ViewGuard,
    pub(crate) observer:    Arc<dyn Observer<R>>,
    pub(crate) policy:      ReconnectPolicy,
}

/// The subscription held by a listener task. Released when the task ends, however it ends, aborts included.
struct Lease<G: Gateway> {
    gateway: Arc<G>,
    id:      Option<SubscriptionId>,
}

impl<G: Gateway> Lease<G> {
    fn new(gateway: Arc<G>) -> Self {
        Self { gateway, id: None }
    }

    fn hold(&mut self, id: SubscriptionId) {
        self.id = Some(id);
    }

    async fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.gateway.unsubscribe(id).await;
        }
    }
}

impl<G: Gateway> Drop for Lease<G> {
    fn drop(&mut self) {
        let Some(id) = self.id.take()
        else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let gateway = self.gateway.clone();
            runtime.spawn(async move { gateway.unsubscribe(id).await });
        }
    }
}

/// Resolves once `user_id` is no longer the signed-in user, or the session itself is gone.
async fn signed_out(mut session: watch::Receiver<Option<UserId>>, user_id: UserId) {
    if session
        .wait_for(|current| current.as_ref() != Some(&user_id))
        .await
        .is_err()
    {
        debug!("Session of {user_id} is gone");
    }
}

/// Handle of a running listener. Stopping it, or dropping it, guarantees the observer is not called anymore.
pub struct LiveUpdateListener<G: Gateway> {
    gateway: Arc<G>,
    guard:   ViewGuard,
    state:   watch::Receiver<ListenerState>,
    task:    Option<JoinHandle<()>>,
}

impl<G: Gateway> LiveUpdateListener<G> {
    /// Subscribe to the record kind's table and start reacting to its events.
    pub(crate) fn spawn<R: Record>(ctx: ListenerContext<G, R>) -> Self {
        let (state_tx, state) = watch::channel(ListenerState::Unsubscribed);
        let gateway = ctx.gateway.clone();
        let guard = ctx.guard.clone();
        let task = tokio::spawn(ctx.run(state_tx));
        Self {
            gateway,
            guard,
            state,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn states(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Resolves once the listener state satisfies `condition`, or with the final state if the task is gone.
    pub async fn wait_for<F>(&self, condition: F) -> ListenerState
    where
        F: Fn(&ListenerState) -> bool,
    {
        wait_for_state(self.states(), condition).await
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the task and release the subscription. The view the listener served stays usable.
    pub async fn stop(mut self) {
        self.guard.kill();
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancelled or finished, both are fine.
            let _ = task.await;
        }
        let subscription = self.state.borrow().subscription();
        if let Some(id) = subscription {
            self.gateway.unsubscribe(id).await;
        }
    }
}

pub(crate) async fn wait_for_state<F>(mut states: watch::Receiver<ListenerState>, condition: F) -> ListenerState
where
    F: Fn(&ListenerState) -> bool,
{
    if let Ok(reached) = states.wait_for(|s| condition(s)).await {
        return *reached;
    }
    let last = *states.borrow();
    last
}

impl<G: Gateway> Drop for LiveUpdateListener<G> {
    fn drop(&mut self) {
        self.guard.kill();
        // The task's lease releases the subscription once the task is cancelled.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<G, R> ListenerContext<G, R>
where
    G: Gateway,
    R: Record,
{
    async fn run(self, state: watch::Sender<ListenerState>) {
        let mut lease = Lease::new(self.gateway.clone());
        let ended = signed_out(self.session.clone(), self.user_id.clone());
        tokio::pin!(ended);

        let subscription = match self.subscribe(&mut lease).await {
            Some(subscription) => Some(subscription),
            None => self.reconnect(&mut lease).await,
        };
        let Some(mut subscription) = subscription
        else {
            self.give_up(&state).await;
            return;
        };
        state.send_replace(ListenerState::Subscribed(subscription.id()));
        info!("Listening to {} changes via {}", R::KIND, subscription.id());

        loop {
            let event = tokio::select! {
                event = subscription.next_event() => event,
                _ = &mut ended => {
                    info!("{} signed out, closing {}", self.user_id, subscription.id());
                    lease.release().await;
                    state.send_replace(ListenerState::Unsubscribed);
                    return;
                }
            };

            match event {
                Some(event) => {
                    self.log_event(&event);
                    self.refresh(&state, subscription.id()).await;
                }
                None => {
                    warn!("Change feed {} of {} ended", subscription.id(), R::KIND);
                    lease.release().await;
                    state.send_replace(ListenerState::Unsubscribed);
                    if !self.is_live() {
                        break;
                    }
                    self.observer
                        .on_warning(&format!("Lost live updates of {}, reconnecting", R::KIND.noun().to_lowercase()))
                        .await;

                    match self.reconnect(&mut lease).await {
                        Some(fresh) => {
                            subscription = fresh;
                            info!("Re-subscribed to {} via {}", R::KIND, subscription.id());
                            state.send_replace(ListenerState::Subscribed(subscription.id()));
                            // Events may have been missed in between.
                            self.refresh(&state, subscription.id()).await;
                        }
                        None => {
                            self.give_up(&state).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn is_live(&self) -> bool {
        self.guard.is_live() && self.view.is_live() && self.session.borrow().as_ref() == Some(&self.user_id)
    }

    async fn subscribe(&self, lease: &mut Lease<G>) -> Option<Subscription> {
        match timed(self.coordinator.timeout(), self.gateway.subscribe(R::KIND)).await {
            Ok(subscription) => {
                lease.hold(subscription.id());
                Some(subscription)
            }
            Err(err) => {
                warn!("Cannot subscribe to {}: {err}", R::KIND);
                None
            }
        }
    }

    async fn reconnect(&self, lease: &mut Lease<G>) -> Option<Subscription> {
        for attempt in 1..=self.policy.attempts {
            tokio::time::sleep(self.policy.delay(attempt)).await;
            if !self.is_live() {
                return None;
            }
            debug!("Reconnect attempt {attempt}/{} for {}", self.policy.attempts, R::KIND);
            if let Some(subscription) = self.subscribe(lease).await {
                return Some(subscription);
            }
        }
        None
    }

    async fn give_up(&self, state: &watch::Sender<ListenerState>) {
        state.send_replace(ListenerState::Unsubscribed);
        if self.is_live() {
            self.observer.on_error(Arc::new(Error::SubscriptionClosed)).await;
        }
    }

    fn log_event(&self, event: &ChangeEvent) {
        debug!(
            "{:?} on {} (owner: {})",
            event.op,
            event.table,
            event.owner().unwrap_or("unknown")
        );
    }

    async fn refresh(&self, state: &watch::Sender<ListenerState>, id: SubscriptionId) {
        if !self.is_live() {
            debug!("Skipping refresh of {} for a gone view or session", R::KIND);
            return;
        }
        state.send_replace(ListenerState::Refreshing(id));

        let request = self.request.borrow().clone();
        self.invalidator.invalidate(&request.user_id, R::KIND).await;

        match self.coordinator.refetch::<R>(&request, &self.view).await {
            Ok(FetchOutcome::Loaded(page)) => {
                if self.is_live() {
                    self.observer.on_refresh(&page).await;
                }
            }
            Ok(FetchOutcome::Discarded) => debug!("Refresh of {} discarded", R::KIND),
            Err(err) => {
                warn!("Refresh of {} failed: {err}", R::KIND);
                if self.is_live() {
                    self.observer.on_error(Arc::new(err)).await;
                }
            }
        }

        state.send_replace(ListenerState::Subscribed(id));
    }
}
