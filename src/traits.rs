use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::error::GatewayError;
use crate::gateway::RowPage;
use crate::gateway::RowQuery;
use crate::gateway::Subscription;
use crate::gateway::SubscriptionId;
use crate::record::Record;
use crate::types::Identity;
use crate::types::Page;
use crate::types::RecordId;
use crate::types::ResourceKind;

/// A table row in its transport form.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The remote data store: per-table CRUD, the identity of the signed-in user and a change feed.
///
/// Implementations are expected to enforce row ownership themselves; the cache layer only scopes its requests by
/// user.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    async fn current_user(&self) -> Result<Identity, GatewayError>;

    /// Rows matching the query and the number of rows matching it regardless of the requested range.
    async fn query(&self, table: ResourceKind, query: &RowQuery) -> Result<RowPage, GatewayError>;
    async fn insert(&self, table: ResourceKind, row: Row) -> Result<Row, GatewayError>;
    async fn update(&self, table: ResourceKind, id: &RecordId, patch: Row) -> Result<Row, GatewayError>;
    async fn delete(&self, table: ResourceKind, id: &RecordId) -> Result<(), GatewayError>;

    /// Start receiving insert/update/delete events of the table, no matter which client caused them.
    async fn subscribe(&self, table: ResourceKind) -> Result<Subscription, GatewayError>;
    /// Close a change feed. Unknown or already closed ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Receives what a view's live update listener produces.
#[async_trait]
pub trait Observer<R>: Send + Sync + 'static
where
    R: Record,
{
    /// A fresh page for the key the view currently displays.
    async fn on_refresh(&self, _page: &Page<R>) {}
    async fn on_error(&self, _error: Arc<Error>) {}
    async fn on_warning(&self, _message: &str) {}
}

/// Observer that ignores everything. For views that are only read on demand.
pub struct NoopObserver;

impl<R: Record> Observer<R> for NoopObserver {}
