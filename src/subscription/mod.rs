//! Resumable change subscriptions
//!
//! The subscription engine turns the change feed into named, position-aware
//! deliveries of CloudEvents. Each subscription runs on its own tokio worker
//! and delivers events serially: the user action is invoked for one event at
//! a time, retried with exponential backoff on failure, and the event's feed
//! position is persisted only after the action has returned successfully.
//!
//! # Delivery loop
//!
//! ```text
//! PositionStore ──read──┐
//!                       ▼
//! change feed ──► decode ──► action ──ok──► persist position
//!      ▲                       │
//!      └──── reopen on error   └─retry with backoff on error
//! ```
//!
//! Cancellation is observed at suspension points: between events, between
//! retry attempts and while waiting for the feed. An event already inside
//! the user action runs to completion, but its position is not persisted
//! once cancellation has been observed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use mongodb::Database;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::document::TimeRepresentation;
use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::{CloudEvent, EventFormat, JsonEventFormat};
use crate::feed::{ChangeFeed, StartAt, SubscriptionPosition};
use crate::filter::SubscriptionFilter;

pub mod position;

pub use position::{InMemoryPositionStore, MongoPositionStore, PositionStore};

/// Error type returned by subscription actions
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Handler invoked for every delivered event
///
/// Returning an error triggers a retry of the same event after a backoff
/// delay; the position is not advanced between attempts.
#[async_trait]
pub trait EventAction: Send + Sync {
    /// Handle one delivered event
    async fn handle(&self, event: CloudEvent) -> Result<(), ActionError>;
}

/// Adapter turning a closure into an [`EventAction`]
///
/// ```rust
/// use everstream::subscription::ActionFn;
/// use futures::FutureExt;
///
/// let action = ActionFn(|event: everstream::CloudEvent| {
///     async move {
///         println!("got {}", event.id);
///         Ok::<(), everstream::ActionError>(())
///     }
///     .boxed()
/// });
/// ```
pub struct ActionFn<F>(pub F);

#[async_trait]
impl<F> EventAction for ActionFn<F>
where
    F: Fn(CloudEvent) -> BoxFuture<'static, Result<(), ActionError>> + Send + Sync,
{
    async fn handle(&self, event: CloudEvent) -> Result<(), ActionError> {
        (self.0)(event).await
    }
}

/// Exponential backoff between retry attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Build a policy from its three parameters
    pub fn backoff(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// The delay before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Configuration for the subscription engine
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Collection the event store writes to
    pub events_collection: String,

    /// Time representation the store was configured with
    pub time_representation: TimeRepresentation,

    /// Backoff applied to failing actions and feed reconnects
    pub retry: RetryPolicy,

    /// Consecutive failed reconnects before the subscription is failed
    pub max_reconnect_attempts: u32,

    /// How long `cancel` and `shutdown` wait for in-flight work
    pub shutdown_grace: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            events_collection: "events".to_string(),
            time_representation: TimeRepresentation::Rfc3339String,
            retry: RetryPolicy::default(),
            max_reconnect_attempts: 10,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionState {
    /// The worker is resolving its start position
    Starting,
    /// The feed is open and events are being delivered
    Running,
    /// The subscription was permanently lost
    Failed(String),
    /// The subscription was cancelled or shut down
    Stopped,
}

/// Handle to a running subscription
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    /// The subscription id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current lifecycle state
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Wait until the feed is open and delivering
    ///
    /// Returns [`EventStoreError::SubscriptionFailed`] if the subscription
    /// failed or stopped before it ever ran.
    pub async fn wait_until_running(&mut self) -> EventStoreResult<()> {
        let state = self
            .state
            .wait_for(|s| !matches!(s, SubscriptionState::Starting))
            .await
            .map_err(|_| {
                EventStoreError::SubscriptionFailed("subscription worker is gone".to_string())
            })?;

        match &*state {
            SubscriptionState::Running => Ok(()),
            SubscriptionState::Failed(message) => {
                Err(EventStoreError::SubscriptionFailed(message.clone()))
            }
            SubscriptionState::Stopped => Err(EventStoreError::SubscriptionFailed(
                "subscription stopped before running".to_string(),
            )),
            SubscriptionState::Starting => unreachable!("wait_for excludes Starting"),
        }
    }
}

/// Predicate deciding which delivered events persist their position
pub type PersistencePredicate = Arc<dyn Fn(&CloudEvent) -> bool + Send + Sync>;

struct ActiveSubscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Position-aware subscription engine over the event collection
///
/// ```rust,no_run
/// use everstream::subscription::{ActionFn, SubscriptionConfig, SubscriptionEngine};
/// use futures::FutureExt;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
/// let database = client.database("events");
///
/// let engine = SubscriptionEngine::new(&database, SubscriptionConfig::default());
/// let mut handle = engine
///     .subscribe_from_now("audit", ActionFn(|event: everstream::CloudEvent| {
///         async move {
///             println!("{}", event.id);
///             Ok::<(), everstream::ActionError>(())
///         }
///         .boxed()
///     }))
///     .await?;
/// handle.wait_until_running().await?;
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionEngine {
    database: Database,
    config: SubscriptionConfig,
    format: Arc<dyn EventFormat>,
    positions: Option<Arc<dyn PositionStore>>,
    persist_when: PersistencePredicate,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
    shutdown: CancellationToken,
}

impl SubscriptionEngine {
    /// Create an engine over the configured event collection
    pub fn new(database: &Database, config: SubscriptionConfig) -> Self {
        Self {
            database: database.clone(),
            config,
            format: Arc::new(JsonEventFormat),
            positions: None,
            persist_when: Arc::new(|_| true),
            subscriptions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use a non-default event format for decoding feed documents
    pub fn with_event_format(mut self, format: Arc<dyn EventFormat>) -> Self {
        self.format = format;
        self
    }

    /// Persist and resume subscription positions through the given store
    pub fn with_position_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.positions = Some(store);
        self
    }

    /// Persist positions only for events matching the predicate
    ///
    /// The default persists after every delivered event.
    pub fn persist_position_when(
        mut self,
        predicate: impl Fn(&CloudEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.persist_when = Arc::new(predicate);
        self
    }

    /// Begin delivering events to `action`
    ///
    /// When a position store is configured and holds a position for this id,
    /// delivery resumes from it and `start_at` is ignored; otherwise the
    /// worker starts at `start_at` and, with a store configured, persists the
    /// feed's current position before the first delivery.
    pub async fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: impl EventAction + 'static,
    ) -> EventStoreResult<SubscriptionHandle> {
        let id = subscription_id.into();

        if self.shutdown.is_cancelled() {
            return Err(EventStoreError::SubscriptionFailed(
                "the subscription engine is shut down".to_string(),
            ));
        }

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&id) {
            return Err(EventStoreError::SubscriptionFailed(format!(
                "subscription {id} is already registered"
            )));
        }

        let token = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Starting);

        let worker = SubscriptionWorker {
            id: id.clone(),
            feed: ChangeFeed::new(
                self.database.collection(&self.config.events_collection),
                Arc::clone(&self.format),
                self.config.time_representation,
            ),
            filter,
            start_at,
            action: Box::new(action),
            positions: self.positions.clone(),
            persist_when: Arc::clone(&self.persist_when),
            retry: self.config.retry,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            token: token.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(worker.run());

        subscriptions.insert(id.clone(), ActiveSubscription { token, task });
        info!("Subscribed {} to the event feed", id);

        Ok(SubscriptionHandle {
            id,
            state: state_rx,
        })
    }

    /// Subscribe without a filter, starting at the current tail
    pub async fn subscribe_from_now(
        &self,
        subscription_id: impl Into<String>,
        action: impl EventAction + 'static,
    ) -> EventStoreResult<SubscriptionHandle> {
        self.subscribe(subscription_id, None, StartAt::now(), action)
            .await
    }

    /// Stop one subscription
    ///
    /// Returns once the worker has stopped, bounded by the shutdown grace
    /// period and at most one in-flight action. Cancelling an unknown id is
    /// a no-op.
    pub async fn cancel(&self, subscription_id: &str) -> EventStoreResult<()> {
        let Some(active) = self.subscriptions.lock().await.remove(subscription_id) else {
            return Ok(());
        };

        active.token.cancel();
        if timeout(self.config.shutdown_grace, active.task).await.is_err() {
            warn!(
                "Subscription {} did not stop within the grace period",
                subscription_id
            );
        }
        Ok(())
    }

    /// Stop all subscriptions and release the engine
    ///
    /// Idempotent; later `subscribe` calls are rejected.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained: Vec<(String, ActiveSubscription)> =
            self.subscriptions.lock().await.drain().collect();
        for (id, active) in drained {
            if timeout(self.config.shutdown_grace, active.task).await.is_err() {
                warn!("Subscription {} did not stop within the grace period", id);
            }
        }
        info!("Subscription engine shut down");
    }
}

struct SubscriptionWorker {
    id: String,
    feed: ChangeFeed,
    filter: Option<SubscriptionFilter>,
    start_at: StartAt,
    action: Box<dyn EventAction>,
    positions: Option<Arc<dyn PositionStore>>,
    persist_when: PersistencePredicate,
    retry: RetryPolicy,
    max_reconnect_attempts: u32,
    token: CancellationToken,
    state: watch::Sender<SubscriptionState>,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        match self.deliver().await {
            Ok(()) => {
                debug!("Subscription {} stopped", self.id);
                let _ = self.state.send(SubscriptionState::Stopped);
            }
            Err(e) => {
                error!("Subscription {} failed: {}", self.id, e);
                let _ = self.state.send(SubscriptionState::Failed(e.to_string()));
            }
        }
    }

    async fn deliver(&mut self) -> EventStoreResult<()> {
        let mut resume = self.starting_position().await?;
        let mut reconnect_attempt: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }

            let mut cursor = match self.feed.open(self.filter.as_ref(), resume.as_ref()).await {
                Ok(cursor) => {
                    reconnect_attempt = 0;
                    cursor
                }
                Err(e @ EventStoreError::SubscriptionFailed(_)) => return Err(e),
                Err(e) => {
                    reconnect_attempt += 1;
                    if reconnect_attempt > self.max_reconnect_attempts {
                        return Err(EventStoreError::SubscriptionFailed(format!(
                            "could not re-establish the change feed after {} attempts: {e}",
                            self.max_reconnect_attempts
                        )));
                    }
                    warn!(
                        "Subscription {}: change feed unavailable, retrying: {}",
                        self.id, e
                    );
                    if !self.wait(self.retry.delay(reconnect_attempt - 1)).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            // A fresh subscription starts at the feed's current position;
            // persisting it first makes the later resume gap-free.
            if resume.is_none() {
                if let Some(position) = cursor.position() {
                    self.persist(&position).await?;
                    resume = Some(position);
                }
            }

            let _ = self.state.send(SubscriptionState::Running);

            while cursor.is_alive() {
                tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    next = cursor.try_next() => match next {
                        Ok(Some((event, position))) => {
                            if !self.handle_with_retry(&event).await {
                                return Ok(());
                            }
                            if (self.persist_when)(&event) {
                                self.persist(&position).await?;
                            }
                            resume = Some(position);
                        }
                        Ok(None) => {}
                        Err(e @ EventStoreError::SubscriptionFailed(_)) => return Err(e),
                        Err(e) => {
                            warn!(
                                "Subscription {}: change feed error, reopening: {}",
                                self.id, e
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Invoke the action, retrying with backoff until it succeeds.
    ///
    /// Returns false when cancellation was observed, in which case the
    /// event's position must not be persisted.
    async fn handle_with_retry(&self, event: &CloudEvent) -> bool {
        let mut attempt: u32 = 0;
        loop {
            match self.action.handle(event.clone()).await {
                Ok(()) => return !self.token.is_cancelled(),
                Err(e) => {
                    warn!(
                        "Subscription {}: action failed for event {} (attempt {}): {}",
                        self.id,
                        event.id,
                        attempt + 1,
                        e
                    );
                    let delay = self.retry.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    if !self.wait(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn starting_position(&self) -> EventStoreResult<Option<SubscriptionPosition>> {
        if let Some(store) = &self.positions {
            if let Some(position) = store.read(&self.id).await? {
                debug!("Subscription {} resuming from its stored position", self.id);
                return Ok(Some(position));
            }
        }

        Ok(match &self.start_at {
            StartAt::Position(position) => Some(position.clone()),
            StartAt::Now => None,
        })
    }

    async fn persist(&self, position: &SubscriptionPosition) -> EventStoreResult<()> {
        if let Some(store) = &self.positions {
            store.save(&self.id, position).await?;
        }
        Ok(())
    }

    /// Sleep for `delay`, returning false when cancelled first
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_delays_grow_exponentially_up_to_the_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(1600));
        assert_eq!(policy.delay(5), Duration::from_secs(2));
        assert_eq!(policy.delay(60), Duration::from_secs(2));
    }

    #[test]
    fn custom_backoff_parameters_are_honored() {
        let policy = RetryPolicy::backoff(Duration::from_secs(5), Duration::from_secs(60), 2.0);

        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn closures_act_as_actions() {
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let action = ActionFn(|_event: CloudEvent| {
            async {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ActionError>(())
            }
            .boxed()
        });

        let event = CloudEvent::builder("e1", "/s", "T").build();
        action.handle(event.clone()).await.unwrap();
        action.handle(event).await.unwrap();

        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
