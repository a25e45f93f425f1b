//! Writes to the gateway and the cache eviction that follows them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::cache::RecordCache;
use crate::coordinator::timed;
use crate::error::Error;
use crate::error::Result;
use crate::record::draft_row;
use crate::record::patch_row;
use crate::record::Record;
use crate::totals::TotalsCache;
use crate::traits::Gateway;
use crate::types::Notice;
use crate::types::RecordId;
use crate::types::ResourceKind;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Create,
    Update,
    Delete,
}

impl Mutation {
    fn past_tense(&self) -> &'static str {
        match self {
            Self::Create => "added",
            Self::Update => "updated",
            Self::Delete => "deleted",
        }
    }
}

/// Wraps create, update and delete.
///
/// A successful write evicts every cached page and total of the affected (user, kind), whatever the filter; a failed
/// one leaves the caches alone, unless it timed out and may have landed after all. Either way a [`Notice`] goes out on
/// the broadcast channel.
pub struct MutationInvalidator<G: Gateway> {
    gateway: Arc<G>,
    records: Arc<RecordCache>,
    totals:  Arc<TotalsCache>,
    notices: broadcast::Sender<Notice>,
    timeout: Duration,
}

impl<G: Gateway> Clone for MutationInvalidator<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            records: self.records.clone(),
            totals:  self.totals.clone(),
            notices: self.notices.clone(),
            timeout: self.timeout,
        }
    }
}

impl<G: Gateway> MutationInvalidator<G> {
    pub fn new(
        gateway: Arc<G>,
        records: Arc<RecordCache>,
        totals: Arc<TotalsCache>,
        notices: broadcast::Sender<Notice>,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            records,
            totals,
            notices,
            timeout,
        }
    }

    #[instrument(level = "debug", skip_all, fields(kind = %R::KIND, user = %user_id))]
    pub async fn create<R: Record>(&self, user_id: &UserId, draft: R::Draft) -> Result<R> {
        let outcome = self.try_create::<R>(user_id, draft).await;
        self.report(R::KIND, Mutation::Create, outcome)
    }

    #[instrument(level = "debug", skip_all, fields(kind = %R::KIND, user = %user_id, id = %id))]
    pub async fn update<R: Record>(&self, user_id: &UserId, id: &RecordId, patch: R::Patch) -> Result<R> {
        let outcome = self.try_update::<R>(user_id, id, patch).await;
        self.report(R::KIND, Mutation::Update, outcome)
    }

    #[instrument(level = "debug", skip_all, fields(kind = %R::KIND, user = %user_id, id = %id))]
    pub async fn delete<R: Record>(&self, user_id: &UserId, id: &RecordId) -> Result<()> {
        let outcome = self.try_delete(R::KIND, user_id, id).await;
        self.report(R::KIND, Mutation::Delete, outcome)
    }

    async fn try_create<R: Record>(&self, user_id: &UserId, draft: R::Draft) -> Result<R> {
        R::validate_draft(&draft)?;
        let row = draft_row::<R>(user_id, &draft)?;
        let outcome = timed(self.timeout, self.gateway.insert(R::KIND, row)).await;
        let row = self.settle(user_id, R::KIND, outcome).await?;
        self.invalidate(user_id, R::KIND).await;
        R::from_row(row)
    }

    async fn try_update<R: Record>(&self, user_id: &UserId, id: &RecordId, patch: R::Patch) -> Result<R> {
        R::validate_patch(&patch)?;
        let row = patch_row::<R>(&patch)?;
        let outcome = timed(self.timeout, self.gateway.update(R::KIND, id, row)).await;
        let row = self.settle(user_id, R::KIND, outcome).await?;
        self.invalidate(user_id, R::KIND).await;
        R::from_row(row)
    }

    async fn try_delete(&self, kind: ResourceKind, user_id: &UserId, id: &RecordId) -> Result<()> {
        let outcome = timed(self.timeout, self.gateway.delete(kind, id)).await;
        self.settle(user_id, kind, outcome).await?;
        self.invalidate(user_id, kind).await;
        Ok(())
    }

    /// A write that timed out may still have reached the backend, so the caches can't be trusted either way.
    async fn settle<T>(&self, user_id: &UserId, kind: ResourceKind, outcome: Result<T>) -> Result<T> {
        if let Err(Error::Timeout(limit)) = &outcome {
            warn!("Write to {kind} of {user_id} got no answer within {limit:?}, evicting anyway");
            self.invalidate(user_id, kind).await;
        }
        outcome
    }

    /// Evict everything cached for (user, kind) from both the page cache and the totals cache. Idempotent.
    pub async fn invalidate(&self, user_id: &UserId, kind: ResourceKind) {
        let pages = self.records.evict_resource(user_id, kind).await;
        self.totals.evict_resource(user_id, kind).await;
        debug!("Invalidated {kind} of {user_id}: {pages} page(s)");
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn report<T>(&self, kind: ResourceKind, mutation: Mutation, outcome: Result<T>) -> Result<T> {
        let notice = match outcome {
            Ok(_) => Notice::Success(format!("{} record {}", kind.noun(), mutation.past_tense())),
            Err(ref err) => {
                warn!("{mutation:?} of {kind} failed: {err}");
                Notice::Error(err.to_string())
            }
        };
        // Nobody listening is fine.
        let _ = self.notices.send(notice);
        outcome
    }
}
