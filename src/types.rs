use std::fmt;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::filter::FilterDescriptor;
use crate::record::RecordSet;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new<S: Into<String>>(id: S) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Stable identifier of the signed-in user, as issued by the auth service.
    UserId
);
string_id!(
    /// Opaque record identifier assigned by the backend.
    RecordId
);

/// The user as reported by the gateway's identity lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub email:   String,
}

impl Identity {
    pub fn new<U: Into<UserId>, E: Into<String>>(user_id: U, email: E) -> Self {
        Self {
            user_id: user_id.into(),
            email:   email.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Fuel,
    Maintenance,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Fuel, ResourceKind::Maintenance];

    /// Backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Fuel => "fuel_records",
            Self::Maintenance => "maintenance_records",
        }
    }

    /// Human readable noun used in notices.
    pub fn noun(&self) -> &'static str {
        match self {
            Self::Fuel => "Fuel",
            Self::Maintenance => "Maintenance",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Identity of a cached page. Entries are never shared between different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: UserId,
    pub kind:    ResourceKind,
    pub filter:  FilterDescriptor,
    pub page:    u32,
}

impl CacheKey {
    pub fn belongs_to(&self, user_id: &UserId, kind: ResourceKind) -> bool {
        self.kind == kind && &self.user_id == user_id
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}#{}", self.user_id, self.kind, self.filter, self.page)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records:     RecordSet,
    pub total_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Cache,
    Gateway,
}

/// One page of records, newest first.
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub records:     Vec<R>,
    /// Number of records matching the filter across all pages.
    pub total_count: u64,
    pub page:        u32,
    pub page_size:   u32,
    pub source:      PageSource,
}

impl<R> Page<R> {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn page_count(&self) -> u64 {
        self.total_count.div_ceil(u64::from(self.page_size.max(1)))
    }

    pub fn from_cache(&self) -> bool {
        self.source == PageSource::Cache
    }
}

/// What came out of a fetch issued on behalf of a view.
#[derive(Debug, Clone)]
pub enum FetchOutcome<R> {
    Loaded(Page<R>),
    /// The view went away before the response arrived; nothing was cached or delivered.
    Discarded,
}

impl<R> FetchOutcome<R> {
    pub fn into_page(self) -> Option<Page<R>> {
        match self {
            Self::Loaded(page) => Some(page),
            Self::Discarded => None,
        }
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded)
    }
}

/// Liveness token of a view. Responses arriving after [`ViewGuard::kill`] are dropped on the floor.
#[derive(Debug, Clone)]
pub struct ViewGuard(Arc<AtomicBool>);

impl ViewGuard {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for ViewGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Transient user-facing message produced by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Error(String),
}

impl Notice {
    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::Error(m) => m,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}
