//! Wire-level types exchanged with a [`Gateway`](crate::traits::Gateway).

pub mod memory;

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::ops::Range;
use std::pin::Pin;

use chrono::NaiveDate;
use tokio_stream::Stream;
use tokio_stream::StreamExt;

use crate::filter::DateBounds;
use crate::traits::Row;
use crate::types::ResourceKind;
use crate::types::UserId;

/// Owner-scoped, date-bounded, newest-first query. Free-text search is never part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub owner:     UserId,
    pub date_from: Option<NaiveDate>,
    pub date_to:   Option<NaiveDate>,
    /// Row offsets, end exclusive. `None` asks for every matching row.
    pub range:     Option<Range<u64>>,
}

impl RowQuery {
    pub fn new(owner: UserId, bounds: DateBounds) -> Self {
        Self {
            owner,
            date_from: bounds.from,
            date_to: bounds.to,
            range: None,
        }
    }

    pub fn with_range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows:        Vec<Row>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: ResourceKind,
    pub op:    ChangeOp,
    /// The new row for inserts and updates, the old one for deletes, when the backend provides it.
    pub row:   Option<Row>,
}

impl ChangeEvent {
    pub fn owner(&self) -> Option<&str> {
        self.row.as_ref()?.get("user_id")?.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send + 'static>>;

/// An open change feed. The stream ends when the backend drops the channel.
pub struct Subscription {
    id:     SubscriptionId,
    table:  ResourceKind,
    events: ChangeStream,
}

impl Subscription {
    pub fn new<S>(id: SubscriptionId, table: ResourceKind, events: S) -> Self
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        Self {
            id,
            table,
            events: Box::pin(events),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn table(&self) -> ResourceKind {
        self.table
    }

    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.next().await
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}
