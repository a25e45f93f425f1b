#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carlog_cache::gateway::RowPage;
use carlog_cache::gateway::RowQuery;
use carlog_cache::gateway::Subscription;
use carlog_cache::gateway::SubscriptionId;
use carlog_cache::prelude::*;
use carlog_cache::traits::Row;
use chrono::NaiveDate;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::sync::Semaphore;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const USER: &str = "u1";

pub fn today() -> NaiveDate {
    date("2025-01-10")
}

pub fn date(s: &str) -> NaiveDate {
    s.parse().expect("valid date")
}

/// Wraps a [`MemoryGateway`], counting queries and optionally holding them until released.
pub struct TestGateway {
    pub inner: Arc<MemoryGateway>,
    queries:   AtomicUsize,
    gated:     AtomicBool,
    gate:      Semaphore,
    entered:   Notify,
    /// Milliseconds every write waits after it has been applied.
    write_lag: AtomicU64,
}

impl TestGateway {
    pub fn new() -> Arc<Self> {
        let inner = MemoryGateway::builder().build().expect("memory gateway");
        inner.sign_in(Identity::new(USER, "driver@example.com"));
        Arc::new(Self {
            inner,
            queries: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            entered: Notify::new(),
            write_lag: AtomicU64::new(0),
        })
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Hold every following query until [`TestGateway::release`].
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(1_000);
    }

    /// Apply writes right away but answer them only after `lag`.
    pub fn slow_writes(&self, lag: Duration) {
        self.write_lag.store(lag.as_millis() as u64, Ordering::SeqCst);
    }

    async fn lag(&self) {
        let lag = self.write_lag.load(Ordering::SeqCst);
        if lag > 0 {
            tokio::time::sleep(Duration::from_millis(lag)).await;
        }
    }

    /// Resolves once a held query is waiting at the gate.
    pub async fn query_entered(&self) {
        self.entered.notified().await;
    }

    pub fn seed_fuel(&self, amount: &str, on: &str) -> Row {
        self.inner.insert_external(ResourceKind::Fuel, fuel_row(USER, amount, on))
    }

    pub fn seed_maintenance(&self, problem: &str, amount: &str, on: &str) -> Row {
        self.inner.insert_external(
            ResourceKind::Maintenance,
            row(json!({
                "user_id": USER,
                "problem": problem,
                "service_at": "Corner Garage",
                "amount": amount,
                "date": on,
            })),
        )
    }
}

#[async_trait]
impl Gateway for TestGateway {
    async fn current_user(&self) -> Result<Identity, GatewayError> {
        self.inner.current_user().await
    }

    async fn query(&self, table: ResourceKind, query: &RowQuery) -> Result<RowPage, GatewayError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate
                .acquire()
                .await
                .map_err(|_| GatewayError::Backend("gate closed".into()))?
                .forget();
        }
        self.inner.query(table, query).await
    }

    async fn insert(&self, table: ResourceKind, row: Row) -> Result<Row, GatewayError> {
        let written = self.inner.insert(table, row).await;
        self.lag().await;
        written
    }

    async fn update(&self, table: ResourceKind, id: &RecordId, patch: Row) -> Result<Row, GatewayError> {
        let written = self.inner.update(table, id, patch).await;
        self.lag().await;
        written
    }

    async fn delete(&self, table: ResourceKind, id: &RecordId) -> Result<(), GatewayError> {
        let written = self.inner.delete(table, id).await;
        self.lag().await;
        written
    }

    async fn subscribe(&self, table: ResourceKind) -> Result<Subscription, GatewayError> {
        self.inner.subscribe(table).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id).await
    }
}

pub fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

pub fn fuel_row(user: &str, amount: &str, on: &str) -> Row {
    row(json!({ "user_id": user, "amount": amount, "date": on }))
}

pub fn config(args: &[&str]) -> LedgerConfig {
    let mut all = vec!["carlog-test"];
    all.extend_from_slice(args);
    LedgerConfig::from_args(all).expect("test configuration")
}

/// A started session for [`USER`] where today is [`today()`].
pub async fn session(gateway: &Arc<TestGateway>, config: LedgerConfig) -> Arc<Ledger<TestGateway>> {
    let ledger = Ledger::<TestGateway>::builder()
        .gateway(gateway.clone())
        .config(config)
        .clock(Clock::Fixed(today()))
        .build()
        .expect("ledger");
    ledger.start().await.expect("session start");
    ledger
}

/// Forwards everything a view's listener reports into channels.
pub struct ChannelObserver<R: Record> {
    pages:    mpsc::UnboundedSender<Page<R>>,
    errors:   mpsc::UnboundedSender<Arc<Error>>,
    warnings: mpsc::UnboundedSender<String>,
}

pub struct ObserverInbox<R: Record> {
    pub pages:    mpsc::UnboundedReceiver<Page<R>>,
    pub errors:   mpsc::UnboundedReceiver<Arc<Error>>,
    pub warnings: mpsc::UnboundedReceiver<String>,
}

impl<R: Record> ChannelObserver<R> {
    pub fn new() -> (Arc<Self>, ObserverInbox<R>) {
        let (pages, pages_rx) = mpsc::unbounded_channel();
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let (warnings, warnings_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                pages,
                errors,
                warnings,
            }),
            ObserverInbox {
                pages:    pages_rx,
                errors:   errors_rx,
                warnings: warnings_rx,
            },
        )
    }
}

#[async_trait]
impl<R: Record> Observer<R> for ChannelObserver<R> {
    async fn on_refresh(&self, page: &Page<R>) {
        let _ = self.pages.send(page.clone());
    }

    async fn on_error(&self, error: Arc<Error>) {
        let _ = self.errors.send(error);
    }

    async fn on_warning(&self, message: &str) {
        let _ = self.warnings.send(message.to_string());
    }
}

pub const PATIENCE: Duration = Duration::from_secs(5);

/// Next item of `rx`, failing the test if nothing arrives in time.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(PATIENCE, rx.recv())
        .await
        .expect("timed out waiting for the observer")
        .expect("observer channel closed")
}

/// Asserts nothing arrives on `rx` for a little while.
pub async fn silence<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected delivery: {item:?}");
    }
}
