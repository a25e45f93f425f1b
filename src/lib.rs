//! # carlog-cache
//!
//! Client-side data layer of a personal vehicle expense ledger: fuel purchases and maintenance events kept in a
//! remote relational backend, read through a page cache that stays fresh without polling.
//!
//! # The Basics
//!
//! The crate sits between presentation code and a [`Gateway`], the backend's client. It is built for this situation:
//!
//! - Every record belongs to exactly one user and is only ever read through that user's session.
//! - Screens show pages of records filtered by a time window and, optionally, a free-text search.
//! - The backend can push insert/update/delete events for a table.
//! - The backend is the single source of truth. There is no offline mode and no conflict resolution.
//!
//! The cache operates on the following principles:
//!
//! - Pages are cached per (user, kind, filter, page). Entries never expire; they are evicted.
//! - Any successful write evicts every page of the affected (user, kind), whatever the filter. Coarse but always
//!   correct.
//! - A change event does the same, then re-fetches the page the view currently shows.
//! - A response arriving for a view that is gone, or after an eviction it raced with, is never cached.
//! - Amounts are exact to the cent; totals never go through floating point.
//! - Implemented on top of the [moka](https://crates.io/crates/moka) cache. Fully async.
//!
//! # Session And Views
//!
//! A [`Ledger`] is the session. It owns the gateway, the caches and the identity of the signed-in user. Views are
//! its children: a [`ResourceView`] holds the filter and page it displays, a liveness guard, and optionally a live
//! update listener reporting fresh pages to an [`Observer`].
//!
//! ```ignore
//! let gateway = MemoryGateway::builder().build()?;
//! gateway.sign_in(Identity::new("u1", "driver@example.com"));
//!
//! let ledger = Ledger::builder().gateway(gateway.clone()).build()?;
//! ledger.start().await?;
//!
//! let view = ledger.open_view::<FuelRecord>(TimeWindow::ONE_MONTH.into(), Arc::new(MyObserver)).await?;
//! let page = view.load().await?.into_page();
//! let dashboard = ledger.dashboard(TimeWindow::ONE_YEAR).await?;
//! ```

pub mod amount;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod invalidator;
pub mod ledger;
pub mod listener;
pub mod record;
pub mod totals;
pub mod traits;
pub mod types;
pub mod view;

#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use ledger::Ledger;
#[doc(inline)]
pub use traits::Gateway;
#[doc(inline)]
pub use traits::Observer;
#[doc(inline)]
pub use view::ResourceView;

pub mod prelude {
    pub use crate::amount::Amount;
    pub use crate::cache::RecordCache;
    pub use crate::config::LedgerConfig;
    pub use crate::coordinator::FetchCoordinator;
    pub use crate::coordinator::FetchRequest;
    pub use crate::error::Error;
    pub use crate::error::GatewayError;
    pub use crate::filter::Clock;
    pub use crate::filter::FilterDescriptor;
    pub use crate::filter::TimeWindow;
    pub use crate::gateway::memory::MemoryGateway;
    pub use crate::invalidator::MutationInvalidator;
    pub use crate::ledger::Ledger;
    pub use crate::listener::ListenerState;
    pub use crate::record::*;
    pub use crate::totals::total;
    pub use crate::totals::Dashboard;
    pub use crate::totals::RecordPredicate;
    pub use crate::traits::Gateway;
    pub use crate::traits::NoopObserver;
    pub use crate::traits::Observer;
    pub use crate::types::*;
    pub use crate::view::ResourceView;
}
