use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carlog_cache::config::init_tracing;
use carlog_cache::prelude::*;
use chrono::Months;

struct PrintingObserver;

#[async_trait]
impl Observer<FuelRecord> for PrintingObserver {
    async fn on_refresh(&self, page: &Page<FuelRecord>) {
        println!("-- refreshed: {} of {} record(s)", page.records.len(), page.total_count);
        for record in &page.records {
            println!("   {}  {:>10}", record.date, record.amount);
        }
    }

    async fn on_error(&self, error: Arc<Error>) {
        eprintln!("-- live updates failed: {error}");
    }

    async fn on_warning(&self, message: &str) {
        eprintln!("-- {message}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    let config = LedgerConfig::from_args(std::env::args())?;

    let gateway = MemoryGateway::builder().latency(Duration::from_millis(20)).build()?;
    gateway.sign_in(Identity::new("demo", "driver@example.com"));

    let ledger = Ledger::<MemoryGateway>::builder()
        .gateway(gateway.clone())
        .config(config)
        .build()?;
    let me = ledger.start().await?;
    println!("Signed in as {}", me.email);

    let today = Clock::System.today();
    for (months_ago, amount) in [(0, "48.20"), (1, "51.05"), (2, "46.90"), (7, "39.99")] {
        let date = today.checked_sub_months(Months::new(months_ago)).unwrap_or(today);
        ledger
            .create::<FuelRecord>(FuelDraft {
                amount: amount.parse()?,
                date,
            })
            .await?;
    }
    ledger
        .create::<MaintenanceRecord>(MaintenanceDraft {
            problem:    "Brake pads".into(),
            service_at: "Corner Garage".into(),
            amount:     "185.00".parse()?,
            date:       today,
        })
        .await?;

    let dashboard = ledger.dashboard(TimeWindow::THREE_MONTHS).await?;
    println!(
        "Fuel ({}): {}  Maintenance last year: {}  all time: {}",
        dashboard.fuel_window, dashboard.fuel_total, dashboard.maintenance_last_year, dashboard.maintenance_all_time
    );

    let view = ledger
        .open_view::<FuelRecord>(TimeWindow::SIX_MONTHS.into(), Arc::new(PrintingObserver))
        .await?;
    if let Some(page) = view.load().await?.into_page() {
        println!("Last six months: {} record(s), page 1 of {}", page.total_count, page.page_count());
    }
    view.wait_for_listener(|state| state.is_subscribed()).await;

    // Somebody else writes to the table; the view picks it up on its own.
    gateway.insert_external(
        ResourceKind::Fuel,
        serde_json::json!({ "user_id": "demo", "amount": "12.34", "date": today.to_string() })
            .as_object()
            .cloned()
            .unwrap_or_default(),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    view.close().await;
    ledger.logout().await?;
    Ok(())
}
