mod common;

use std::sync::Arc;

use carlog_cache::prelude::*;
use common::*;

fn fast_reconnect(attempts: &str) -> LedgerConfig {
    config(&[
        "--reconnect-attempts",
        attempts,
        "--reconnect-initial-delay-ms",
        "10",
        "--reconnect-max-delay-ms",
        "40",
    ])
}

async fn subscribed<R: Record>(view: &ResourceView<TestGateway, R>) -> ListenerState {
    let state = tokio::time::timeout(PATIENCE, view.wait_for_listener(|s| s.is_subscribed()))
        .await
        .expect("listener never subscribed")
        .expect("view is listening");
    assert!(state.is_subscribed(), "listener stopped: {state}");
    state
}

#[tokio::test]
async fn external_change_refreshes_the_view() -> TestResult {
    let gateway = TestGateway::new();
    gateway.seed_fuel("10.00", "2025-01-05");
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(TimeWindow::ONE_MONTH.into(), observer).await?;
    subscribed(&view).await;

    let page = view.load().await?.into_page().expect("loaded");
    assert_eq!(page.total_count, 1);
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 1);

    // Written by another client of the same user.
    let row = gateway.seed_fuel("25.00", "2025-01-08");

    let fresh = next(&mut inbox.pages).await;
    assert_eq!(fresh.source, PageSource::Gateway);
    assert_eq!(fresh.total_count, 2);
    assert_eq!(fresh.records[0].id.as_str(), row["id"]);

    // The refresh went into the cache.
    let page = view.load().await?.into_page().expect("loaded");
    assert!(page.from_cache());
    assert_eq!(page.total_count, 2);

    view.close().await;
    Ok(())
}

#[tokio::test]
async fn own_writes_also_arrive_as_events() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<MaintenanceRecord>::new();
    let view = ledger
        .open_view::<MaintenanceRecord>(FilterDescriptor::all_time(), observer)
        .await?;
    subscribed(&view).await;

    let created = ledger
        .create::<MaintenanceRecord>(MaintenanceDraft {
            problem:    "Timing belt".into(),
            service_at: "Corner Garage".into(),
            amount:     "310.00".parse()?,
            date:       today(),
        })
        .await?;

    let fresh = next(&mut inbox.pages).await;
    assert_eq!(fresh.records.len(), 1);
    assert_eq!(fresh.records[0].id, created.id);
    assert!(inbox.errors.try_recv().is_err());

    view.close().await;
    Ok(())
}

#[tokio::test]
async fn refresh_follows_the_current_filter() -> TestResult {
    let gateway = TestGateway::new();
    gateway.seed_fuel("10.00", "2024-05-01");
    gateway.seed_fuel("20.00", "2025-01-02");
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(TimeWindow::ONE_MONTH.into(), observer).await?;
    subscribed(&view).await;

    let page = view.set_filter(TimeWindow::Year(2024).into()).await?.into_page().expect("loaded");
    assert_eq!(page.total_count, 1);

    gateway.seed_fuel("30.00", "2024-08-15");

    let fresh = next(&mut inbox.pages).await;
    assert_eq!(fresh.total_count, 2);
    assert!(fresh.records.iter().all(|r| r.date.format("%Y").to_string() == "2024"));

    view.close().await;
    Ok(())
}

#[tokio::test]
async fn lost_feed_is_resubscribed() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, fast_reconnect("5")).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(FilterDescriptor::all_time(), observer).await?;
    let first = subscribed(&view).await.subscription();

    gateway.inner.drop_subscriptions();

    let warning = next(&mut inbox.warnings).await;
    assert_eq!(warning, "Lost live updates of fuel, reconnecting");

    // Whatever happened while disconnected is picked up right after re-subscribing.
    let page = next(&mut inbox.pages).await;
    assert_eq!(page.source, PageSource::Gateway);

    let second = subscribed(&view).await.subscription();
    assert!(second.is_some());
    assert_ne!(first, second);
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 1);

    gateway.seed_fuel("12.00", "2025-01-09");
    let page = next(&mut inbox.pages).await;
    assert_eq!(page.total_count, 1);

    view.close().await;
    Ok(())
}

#[tokio::test]
async fn listener_gives_up_after_failed_reconnects() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, fast_reconnect("1")).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(FilterDescriptor::all_time(), observer).await?;
    subscribed(&view).await;

    gateway
        .inner
        .fail_next(GatewayError::Backend("realtime service unavailable".into()));
    gateway.inner.drop_subscriptions();

    next(&mut inbox.warnings).await;
    let error = next(&mut inbox.errors).await;
    assert!(matches!(*error, Error::SubscriptionClosed));

    let state = view
        .wait_for_listener(|s| !s.is_subscribed())
        .await
        .expect("view is listening");
    assert_eq!(state, ListenerState::Unsubscribed);
    Ok(())
}

#[tokio::test]
async fn closed_view_hears_nothing() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(FilterDescriptor::all_time(), observer).await?;
    subscribed(&view).await;

    view.close().await;
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 0);
    assert_eq!(view.listener_state().await, ListenerState::Unsubscribed);

    gateway.seed_fuel("10.00", "2025-01-09");
    silence(&mut inbox.pages).await;
    silence(&mut inbox.errors).await;
    Ok(())
}

#[tokio::test]
async fn dropped_view_releases_its_subscription() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(FilterDescriptor::all_time(), observer).await?;
    subscribed(&view).await;

    drop(view);
    // Unsubscribing happens on a spawned task.
    for _ in 0..50 {
        if gateway.inner.subscriber_count(ResourceKind::Fuel) == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 0);

    gateway.seed_fuel("10.00", "2025-01-09");
    silence(&mut inbox.pages).await;
    Ok(())
}

#[tokio::test]
async fn starting_twice_keeps_one_subscription() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    let view = ledger.view::<FuelRecord>(FilterDescriptor::all_time(), Arc::new(NoopObserver))?;
    assert_eq!(view.wait_for_listener(|_| true).await, None);

    view.start_live_updates().await?;
    subscribed(&view).await;
    view.start_live_updates().await?;
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 1);

    view.stop_live_updates().await;
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 0);
    assert!(view.is_live());
    Ok(())
}

#[tokio::test]
async fn restarted_listener_delivers_again() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(FilterDescriptor::all_time(), observer).await?;
    subscribed(&view).await;

    view.stop_live_updates().await;
    assert!(view.load().await?.into_page().is_some());

    view.start_live_updates().await?;
    subscribed(&view).await;
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 1);

    gateway.seed_fuel("10.00", "2025-01-09");
    let page = next(&mut inbox.pages).await;
    assert_eq!(page.total_count, 1);

    view.close().await;
    Ok(())
}

#[tokio::test]
async fn logout_stops_listening() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    let (observer, mut inbox) = ChannelObserver::<FuelRecord>::new();
    let view = ledger.open_view::<FuelRecord>(FilterDescriptor::all_time(), observer).await?;
    subscribed(&view).await;

    ledger.logout().await?;
    let state = tokio::time::timeout(PATIENCE, view.wait_for_listener(|s| !s.is_subscribed()))
        .await?
        .expect("view is listening");
    assert_eq!(state, ListenerState::Unsubscribed);
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 0);

    gateway.seed_fuel("10.00", "2025-01-09");
    silence(&mut inbox.pages).await;
    silence(&mut inbox.errors).await;

    assert!(matches!(view.start_live_updates().await, Err(Error::Unauthenticated)));
    Ok(())
}

#[tokio::test]
async fn views_dropped_while_subscribing_leave_no_subscription() -> TestResult {
    let gateway = TestGateway::new();
    let ledger = session(&gateway, config(&[])).await;

    for _ in 0..20 {
        let view = ledger.view::<FuelRecord>(FilterDescriptor::all_time(), Arc::new(NoopObserver))?;
        view.start_live_updates().await?;
        tokio::task::yield_now().await;
        drop(view);
    }

    for _ in 0..50 {
        if gateway.inner.subscriber_count(ResourceKind::Fuel) == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.inner.subscriber_count(ResourceKind::Fuel), 0);
    Ok(())
}
