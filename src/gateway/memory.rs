//! In-process [`Gateway`] keeping rows in memory.
//!
//! Behaves like the hosted backend as far as the cache layer can tell: ownership is enforced for the signed-in user,
//! rows come back newest first with the total count of the filtered set, and every write is pushed to the table's
//! subscribers. A couple of knobs exist for exercising failure paths: [`MemoryGateway::fail_next`] and
//! [`MemoryGateway::drop_subscriptions`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fieldx::fxstruct;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use super::ChangeEvent;
use super::ChangeOp;
use super::RowPage;
use super::RowQuery;
use super::Subscription;
use super::SubscriptionId;
use crate::error::GatewayError;
use crate::traits::Gateway;
use crate::traits::Row;
use crate::types::Identity;
use crate::types::RecordId;
use crate::types::ResourceKind;

type Subscriber = (ResourceKind, mpsc::UnboundedSender<ChangeEvent>);

#[fxstruct(sync, rc, no_new, default(off), builder)]
pub struct MemoryGateway {
    /// Artificial delay applied to every call.
    #[fieldx(get(copy), default(Duration::ZERO))]
    latency: Duration,

    #[fieldx(inner_mut, get(clone), set, builder(off), default(None))]
    identity: Option<Identity>,

    #[fieldx(inner_mut, get, get_mut, builder(off), default(HashMap::new()))]
    tables: HashMap<ResourceKind, Vec<Row>>,

    #[fieldx(inner_mut, get, get_mut, builder(off), default(HashMap::new()))]
    subscribers: HashMap<SubscriptionId, Subscriber>,

    #[fieldx(inner_mut, get(copy), set, builder(off), default(0))]
    last_subscription: u64,

    #[fieldx(inner_mut, get, get_mut, builder(off), default(VecDeque::new()))]
    failures: VecDeque<GatewayError>,
}

impl MemoryGateway {
    pub fn sign_in(&self, identity: Identity) {
        self.set_identity(Some(identity));
    }

    pub fn sign_out(&self) {
        self.set_identity(None);
    }

    /// Make the next call fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: GatewayError) {
        self.failures_mut().push_back(error);
    }

    /// Close every change stream as if the connection to the backend was lost.
    pub fn drop_subscriptions(&self) {
        let dropped = std::mem::take(&mut *self.subscribers_mut());
        debug!("Dropped {} subscription(s)", dropped.len());
    }

    pub fn subscriber_count(&self, table: ResourceKind) -> usize {
        self.subscribers().values().filter(|(t, _)| *t == table).count()
    }

    pub fn row_count(&self, table: ResourceKind) -> usize {
        self.tables().get(&table).map_or(0, Vec::len)
    }

    /// Write a row bypassing authentication, the way another user's client would. The row must carry its own
    /// `user_id`; an `id` is generated when missing.
    pub fn insert_external(&self, table: ResourceKind, mut row: Row) -> Row {
        row.entry("id")
            .or_insert_with(|| serde_json::Value::String(Uuid::new_v4().to_string()));
        self.tables_mut().entry(table).or_default().push(row.clone());
        self.publish(table, ChangeOp::Insert, Some(row.clone()));
        row
    }

    async fn enter(&self) -> Result<Identity, GatewayError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failures_mut().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        self.identity().ok_or(GatewayError::Unauthenticated)
    }

    fn publish(&self, table: ResourceKind, op: ChangeOp, row: Option<Row>) {
        let event = ChangeEvent { table, op, row };
        self.subscribers_mut().retain(|id, (t, tx)| {
            if *t != table {
                return true;
            }
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!("Subscriber {id} is gone");
            }
            delivered
        });
    }

    fn owned_by(row: &Row, identity: &Identity) -> bool {
        row.get("user_id").and_then(|v| v.as_str()) == Some(identity.user_id.as_str())
    }

    fn id_of(row: &Row) -> Option<&str> {
        row.get("id").and_then(|v| v.as_str())
    }

    fn date_of(row: &Row) -> Option<NaiveDate> {
        row.get("date").and_then(|v| v.as_str()).and_then(|d| d.parse().ok())
    }

    fn matches(row: &Row, query: &RowQuery) -> bool {
        if row.get("user_id").and_then(|v| v.as_str()) != Some(query.owner.as_str()) {
            return false;
        }
        let Some(date) = Self::date_of(row)
        else {
            return query.date_from.is_none() && query.date_to.is_none();
        };
        query.date_from.is_none_or(|from| date >= from) && query.date_to.is_none_or(|to| date <= to)
    }

    fn row_order(a: &Row, b: &Row) -> Ordering {
        Self::date_of(b)
            .cmp(&Self::date_of(a))
            .then_with(|| Self::id_of(a).cmp(&Self::id_of(b)))
    }

    fn find_owned(
        &self,
        table: ResourceKind,
        id: &RecordId,
        identity: &Identity,
    ) -> Result<(), GatewayError> {
        let tables = self.tables();
        let row = tables
            .get(&table)
            .and_then(|rows| rows.iter().find(|r| Self::id_of(r) == Some(id.as_str())))
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        if Self::owned_by(row, identity) {
            Ok(())
        }
        else {
            Err(GatewayError::Forbidden(format!("{table} row {id} belongs to another user")))
        }
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn current_user(&self) -> Result<Identity, GatewayError> {
        self.enter().await
    }

    async fn query(&self, table: ResourceKind, query: &RowQuery) -> Result<RowPage, GatewayError> {
        let identity = self.enter().await?;
        if identity.user_id != query.owner {
            return Err(GatewayError::Forbidden(format!(
                "cannot read {table} rows of {}",
                query.owner
            )));
        }

        let mut rows = self
            .tables()
            .get(&table)
            .map(|rows| rows.iter().filter(|r| Self::matches(r, query)).cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        rows.sort_by(Self::row_order);

        let total_count = rows.len() as u64;
        let rows = match query.range {
            Some(ref range) => rows
                .into_iter()
                .skip(usize::try_from(range.start).unwrap_or(usize::MAX))
                .take(usize::try_from(range.end.saturating_sub(range.start)).unwrap_or(usize::MAX))
                .collect(),
            None => rows,
        };

        Ok(RowPage { rows, total_count })
    }

    async fn insert(&self, table: ResourceKind, mut row: Row) -> Result<Row, GatewayError> {
        let identity = self.enter().await?;
        if !Self::owned_by(&row, &identity) {
            return Err(GatewayError::Forbidden(format!(
                "new {table} row must belong to {}",
                identity.user_id
            )));
        }

        row.insert("id".into(), serde_json::Value::String(Uuid::new_v4().to_string()));
        self.tables_mut().entry(table).or_default().push(row.clone());
        self.publish(table, ChangeOp::Insert, Some(row.clone()));
        Ok(row)
    }

    async fn update(&self, table: ResourceKind, id: &RecordId, patch: Row) -> Result<Row, GatewayError> {
        let identity = self.enter().await?;
        self.find_owned(table, id, &identity)?;

        let updated = {
            let mut tables = self.tables_mut();
            let row = tables
                .get_mut(&table)
                .and_then(|rows| rows.iter_mut().find(|r| Self::id_of(r) == Some(id.as_str())))
                .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
            for (field, value) in patch {
                if field != "id" && field != "user_id" {
                    row.insert(field, value);
                }
            }
            row.clone()
        };

        self.publish(table, ChangeOp::Update, Some(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, table: ResourceKind, id: &RecordId) -> Result<(), GatewayError> {
        let identity = self.enter().await?;
        self.find_owned(table, id, &identity)?;

        let removed = {
            let mut tables = self.tables_mut();
            let rows = tables.entry(table).or_default();
            rows.iter()
                .position(|r| Self::id_of(r) == Some(id.as_str()))
                .map(|idx| rows.remove(idx))
        };

        self.publish(table, ChangeOp::Delete, removed);
        Ok(())
    }

    async fn subscribe(&self, table: ResourceKind) -> Result<Subscription, GatewayError> {
        self.enter().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut subscribers = self.subscribers_mut();
            let id = SubscriptionId(self.last_subscription() + 1);
            self.set_last_subscription(id.0);
            subscribers.insert(id, (table, tx));
            id
        };
        debug!("New {table} subscription {id}");

        Ok(Subscription::new(id, table, UnboundedReceiverStream::new(rx)))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscribers_mut().remove(&id).is_some() {
            debug!("Subscription {id} closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn fuel_row(user: &str, date: &str, amount: &str) -> Row {
        row(json!({ "user_id": user, "date": date, "amount": amount }))
    }

    async fn gateway() -> std::sync::Arc<MemoryGateway> {
        let gw = MemoryGateway::builder().build().unwrap();
        gw.sign_in(Identity::new("u1", "u1@example.com"));
        gw
    }

    #[tokio::test]
    async fn query_scopes_orders_and_counts() {
        let gw = gateway().await;
        for date in ["2024-01-01", "2024-03-01", "2024-02-01"] {
            gw.insert(ResourceKind::Fuel, fuel_row("u1", date, "10.00")).await.unwrap();
        }
        gw.insert_external(ResourceKind::Fuel, fuel_row("u2", "2024-04-01", "99.00"));

        let query = RowQuery {
            owner:     "u1".into(),
            date_from: Some("2024-02-01".parse().unwrap()),
            date_to:   None,
            range:     Some(0..1),
        };
        let page = gw.query(ResourceKind::Fuel, &query).await.unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0]["date"], "2024-03-01");
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let gw = gateway().await;
        let foreign = gw.insert_external(ResourceKind::Fuel, fuel_row("u2", "2024-04-01", "1.00"));
        let id = RecordId::new(foreign["id"].as_str().unwrap());

        assert!(matches!(
            gw.delete(ResourceKind::Fuel, &id).await,
            Err(GatewayError::Forbidden(_))
        ));
        assert!(matches!(
            gw.insert(ResourceKind::Fuel, fuel_row("u2", "2024-04-01", "1.00")).await,
            Err(GatewayError::Forbidden(_))
        ));
        assert!(matches!(
            gw.delete(ResourceKind::Fuel, &RecordId::new("nope")).await,
            Err(GatewayError::NotFound(_))
        ));

        gw.sign_out();
        assert_eq!(gw.current_user().await, Err(GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn writes_are_published_to_table_subscribers() {
        let gw = gateway().await;
        let mut fuel = gw.subscribe(ResourceKind::Fuel).await.unwrap();
        let mut maintenance = gw.subscribe(ResourceKind::Maintenance).await.unwrap();

        let inserted = gw.insert(ResourceKind::Fuel, fuel_row("u1", "2024-01-01", "5")).await.unwrap();
        let event = fuel.next_event().await.unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.owner(), Some("u1"));

        let id = RecordId::new(inserted["id"].as_str().unwrap());
        gw.delete(ResourceKind::Fuel, &id).await.unwrap();
        assert_eq!(fuel.next_event().await.unwrap().op, ChangeOp::Delete);

        gw.drop_subscriptions();
        assert!(fuel.next_event().await.is_none());
        assert!(maintenance.next_event().await.is_none());
    }

    #[tokio::test]
    async fn injected_failures_come_first() {
        let gw = gateway().await;
        gw.fail_next(GatewayError::Backend("boom".into()));
        assert_eq!(
            gw.current_user().await,
            Err(GatewayError::Backend("boom".into()))
        );
        assert!(gw.current_user().await.is_ok());
    }
}
