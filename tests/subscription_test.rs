//! Subscription engine integration tests
//!
//! These tests require a running MongoDB replica set (change streams need
//! one), e.g. `mongod --replSet rs0` followed by `rs.initiate()`. Set
//! `MONGODB_URI` to point somewhere else than localhost. Each test works in
//! its own database.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use everstream::subscription::ActionFn;
use everstream::{
    CloudEvent, ConsistencyGuarantee, EventStoreConfig, FilterComparison, InMemoryPositionStore,
    MongoEventStore, PositionStore, SubscriptionEngine, SubscriptionFilter, SubscriptionState,
    STREAM_POSITION_ATTRIBUTE,
};
use futures::FutureExt;
use mongodb::bson::Bson;

fn mongo_uri() -> String {
    std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn store() -> Result<MongoEventStore> {
    init_tracing();
    let database = format!("everstream_test_{}", uuid::Uuid::now_v7().simple());
    let config = EventStoreConfig {
        guarantee: ConsistencyGuarantee::transactional(),
        ..EventStoreConfig::default()
    };
    Ok(MongoEventStore::connect_with_config(&mongo_uri(), &database, config).await?)
}

fn name_defined(id: &str, name: &str) -> CloudEvent {
    CloudEvent::builder(id, "https://example.org/registry", "NameDefined")
        .subject("name")
        .data(serde_json::json!({ "name": name }))
        .build()
}

type Received = Arc<Mutex<Vec<CloudEvent>>>;

/// An action collecting every delivered event, failing its first
/// `failures_before_success` invocations.
fn collecting_action(
    received: &Received,
    failures_before_success: u32,
) -> impl everstream::EventAction + 'static {
    let received = Arc::clone(received);
    let invocations = Arc::new(AtomicU32::new(0));
    ActionFn(move |event: CloudEvent| {
        let received = Arc::clone(&received);
        let invocations = Arc::clone(&invocations);
        async move {
            if invocations.fetch_add(1, Ordering::SeqCst) < failures_before_success {
                return Err("transient handler failure".into());
            }
            received.lock().unwrap().push(event);
            Ok::<(), everstream::ActionError>(())
        }
        .boxed()
    })
}

async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
#[ignore = "requires a running MongoDB replica set"]
async fn delivers_in_order_despite_action_failures() -> Result<()> {
    let store = store().await?;
    let positions = Arc::new(InMemoryPositionStore::new());
    let engine = SubscriptionEngine::new(store.database(), store.subscription_config())
        .with_position_store(Arc::clone(&positions) as Arc<dyn everstream::PositionStore>);

    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let mut handle = engine
        .subscribe_from_now("retrying", collecting_action(&received, 4))
        .await?;
    handle.wait_until_running().await?;

    store
        .write(
            "name",
            [
                name_defined("e1", "A"),
                name_defined("e2", "B"),
                name_defined("e3", "C"),
            ],
        )
        .await?;

    assert!(
        eventually(Duration::from_secs(5), || received.lock().unwrap().len() >= 3).await,
        "expected 3 deliveries within 5 seconds"
    );

    let delivered = received.lock().unwrap().clone();
    let ids: Vec<&str> = delivered.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["e1", "e2", "e3"]);

    // The stored position is the third event's feed position.
    let third_position = delivered[2]
        .extension(STREAM_POSITION_ATTRIBUTE)
        .expect("delivered events carry their feed position")
        .clone();
    let stored = positions.read("retrying").await?.expect("position persisted");
    assert_eq!(
        Bson::Document(stored.as_document().clone()).into_relaxed_extjson(),
        third_position
    );

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running MongoDB replica set"]
async fn resumes_after_restart_from_the_persisted_position() -> Result<()> {
    let store = store().await?;
    let positions = Arc::new(InMemoryPositionStore::new());

    let first_run: Received = Arc::new(Mutex::new(Vec::new()));
    {
        let engine = SubscriptionEngine::new(store.database(), store.subscription_config())
            .with_position_store(Arc::clone(&positions) as Arc<dyn everstream::PositionStore>);
        let mut handle = engine
            .subscribe_from_now("projector", collecting_action(&first_run, 0))
            .await?;
        handle.wait_until_running().await?;

        store.write("name", [name_defined("e1", "A")]).await?;
        assert!(
            eventually(Duration::from_secs(5), || first_run.lock().unwrap().len() >= 1).await
        );
        engine.shutdown().await;
    }

    // Written while nothing is subscribed; must be delivered after restart.
    store.write("name", [name_defined("e2", "B")]).await?;

    let second_run: Received = Arc::new(Mutex::new(Vec::new()));
    let engine = SubscriptionEngine::new(store.database(), store.subscription_config())
        .with_position_store(Arc::clone(&positions) as Arc<dyn everstream::PositionStore>);
    let mut handle = engine
        .subscribe_from_now("projector", collecting_action(&second_run, 0))
        .await?;
    handle.wait_until_running().await?;
    store.write("name", [name_defined("e3", "C")]).await?;

    assert!(
        eventually(Duration::from_secs(5), || second_run.lock().unwrap().len() >= 2).await,
        "expected the gap event and the new event"
    );
    let ids: Vec<String> = second_run
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(ids, ["e2", "e3"]);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running MongoDB replica set"]
async fn cancel_stops_delivery_promptly() -> Result<()> {
    let store = store().await?;
    let engine = SubscriptionEngine::new(store.database(), store.subscription_config());

    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let mut handle = engine
        .subscribe_from_now("cancelled", collecting_action(&received, 0))
        .await?;
    handle.wait_until_running().await?;

    engine.cancel("cancelled").await?;
    assert_eq!(handle.state(), SubscriptionState::Stopped);

    store.write("name", [name_defined("e1", "A")]).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(received.lock().unwrap().is_empty());

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running MongoDB replica set"]
async fn filters_restrict_delivery_server_side() -> Result<()> {
    let store = store().await?;
    let engine = SubscriptionEngine::new(store.database(), store.subscription_config());

    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let filter = SubscriptionFilter::event_type(FilterComparison::Eq, "NameDefined");
    let mut handle = engine
        .subscribe(
            "only-names",
            Some(filter),
            everstream::StartAt::now(),
            collecting_action(&received, 0),
        )
        .await?;
    handle.wait_until_running().await?;

    let other = CloudEvent::builder("x1", "https://example.org/registry", "SomethingElse").build();
    store.write("other", [other]).await?;
    store.write("name", [name_defined("e1", "A")]).await?;

    assert!(
        eventually(Duration::from_secs(5), || received.lock().unwrap().len() >= 1).await
    );
    // Give the unwanted event a moment to show up if the filter leaked it.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ids: Vec<String> = received
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(ids, ["e1"]);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running MongoDB replica set"]
async fn shutdown_is_idempotent() -> Result<()> {
    let store = store().await?;
    let engine = SubscriptionEngine::new(store.database(), store.subscription_config());

    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let mut handle = engine
        .subscribe_from_now("short-lived", collecting_action(&received, 0))
        .await?;
    handle.wait_until_running().await?;

    engine.shutdown().await;
    engine.shutdown().await;

    assert!(engine
        .subscribe_from_now("late", collecting_action(&received, 0))
        .await
        .is_err());
    Ok(())
}
