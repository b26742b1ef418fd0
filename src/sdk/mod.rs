//! Polling sync client for long-lived SDK processes.
//!
//! The client pulls the full flag set for its SDK key, keeps it as an
//! atomically-swapped in-memory snapshot, and evaluates flags locally with
//! the same engine the server uses. Evaluation never touches the network:
//! it reads whatever snapshot the last successful fetch produced.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::evaluation::{evaluate_with_default, EvaluationResult, FlagRecord};

/// Default interval between background re-fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected the SDK key")]
    Unauthorized,
}

/// Analytics payload emitted after each evaluation. Matches the event
/// ingestion endpoint's request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationEvent {
    pub flag_key: String,
    pub result: bool,
    pub user_id: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Transport seam for the bulk flag fetch.
#[async_trait]
pub trait FlagFetcher: Send + Sync + 'static {
    async fn fetch_flags(&self) -> Result<Vec<FlagRecord>, SdkError>;
}

/// Transport seam for analytics events. Implementations should be cheap;
/// the client already detaches and swallows failures.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn send(&self, event: EvaluationEvent) -> Result<(), SdkError>;
}

#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    pub environment: String,
    pub poll_interval: Duration,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        SyncClientConfig {
            environment: "production".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

type Snapshot = Arc<HashMap<String, FlagRecord>>;
type Subscriber = Box<dyn Fn(&HashMap<String, FlagRecord>) + Send + Sync>;

struct Inner {
    fetcher: Arc<dyn FlagFetcher>,
    events: Arc<dyn EventSink>,
    environment: String,
    /// `None` until the first successful fetch. Replaced wholesale on every
    /// refresh so readers never observe a partially-updated set.
    snapshot: RwLock<Option<Snapshot>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Inner {
    /// One fetch cycle. A failure leaves the last-known-good snapshot in
    /// place; the next interval tick retries.
    async fn refresh(&self) -> bool {
        match self.fetcher.fetch_flags().await {
            Ok(flags) => {
                let map: HashMap<String, FlagRecord> =
                    flags.into_iter().map(|f| (f.key.clone(), f)).collect();
                debug!(flags = map.len(), "flag snapshot refreshed");
                let snapshot = Arc::new(map);
                *self.snapshot.write().unwrap() = Some(snapshot.clone());

                let subscribers = self.subscribers.lock().unwrap();
                for notify in subscribers.iter() {
                    notify(&snapshot);
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "flag fetch failed, keeping last-known flag set");
                false
            }
        }
    }
}

/// Background-synced flag client. `destroy` (or drop) stops the refresh
/// loop; everything else is safe to call from any number of tasks.
pub struct SyncClient {
    inner: Arc<Inner>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Connects against a server over HTTP and starts the refresh loop.
    pub async fn connect(base_url: &str, sdk_key: &str, config: SyncClientConfig) -> Self {
        let http = reqwest::Client::new();
        let fetcher = Arc::new(HttpFlagFetcher {
            http: http.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            sdk_key: sdk_key.to_string(),
            environment: config.environment.clone(),
        });
        let events = Arc::new(HttpEventSink {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            sdk_key: sdk_key.to_string(),
        });
        Self::start(fetcher, events, config).await
    }

    /// Starts a client over explicit transports. The first fetch is awaited
    /// before this returns; if it fails, the client still comes up and
    /// serves caller defaults until a later fetch succeeds.
    pub async fn start(
        fetcher: Arc<dyn FlagFetcher>,
        events: Arc<dyn EventSink>,
        config: SyncClientConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            fetcher,
            events,
            environment: config.environment,
            snapshot: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        });

        inner.refresh().await;

        let loop_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                loop_inner.refresh().await;
            }
        });

        SyncClient {
            inner,
            refresh_task: Mutex::new(Some(handle)),
        }
    }

    /// Forces a fetch outside the polling schedule. Returns whether the
    /// fetch succeeded.
    pub async fn refresh_now(&self) -> bool {
        self.inner.refresh().await
    }

    /// True once a fetch has succeeded and evaluations run against real
    /// flag data.
    pub fn is_ready(&self) -> bool {
        self.inner.snapshot.read().unwrap().is_some()
    }

    /// Registers a callback invoked synchronously after every successful
    /// fetch, with the freshly-swapped flag set.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&HashMap<String, FlagRecord>) + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push(Box::new(callback));
    }

    /// Evaluates a flag against the current snapshot. Nonblocking: a key
    /// missing from the snapshot (or no snapshot yet) yields the caller's
    /// default, never an error.
    pub fn evaluate(
        &self,
        flag_key: &str,
        user_id: &str,
        default: Option<&Value>,
    ) -> EvaluationResult {
        let started = Instant::now();
        let snapshot = self.inner.snapshot.read().unwrap().clone();
        let result = match snapshot.as_ref().and_then(|flags| flags.get(flag_key)) {
            Some(flag) => evaluate_with_default(flag, user_id, default),
            None => EvaluationResult::not_found(default),
        };

        self.emit_event(EvaluationEvent {
            flag_key: flag_key.to_string(),
            result: result.enabled,
            user_id: user_id.to_string(),
            environment: self.inner.environment.clone(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
        });

        result
    }

    pub fn is_enabled(&self, flag_key: &str, user_id: &str, default: bool) -> bool {
        let result = self.evaluate(flag_key, user_id, Some(&Value::Bool(default)));
        match result.reason {
            crate::evaluation::EvalReason::FlagNotFound => default,
            _ => result.enabled,
        }
    }

    /// Stops the refresh loop and clears the snapshot. Safe to call more
    /// than once.
    pub fn destroy(&self) {
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
        *self.inner.snapshot.write().unwrap() = None;
        self.inner.subscribers.lock().unwrap().clear();
    }

    /// Detached, best-effort analytics. Failures are swallowed; evaluation
    /// latency never includes the send.
    fn emit_event(&self, event: EvaluationEvent) {
        let events = Arc::clone(&self.inner.events);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = events.send(event).await {
                    debug!(error = %e, "dropping analytics event");
                }
            });
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// HTTP TRANSPORTS

struct HttpFlagFetcher {
    http: reqwest::Client,
    base_url: String,
    sdk_key: String,
    environment: String,
}

#[async_trait]
impl FlagFetcher for HttpFlagFetcher {
    async fn fetch_flags(&self) -> Result<Vec<FlagRecord>, SdkError> {
        let response = self
            .http
            .get(format!("{}/sdk/flags", self.base_url))
            .header("x-sdk-key", &self.sdk_key)
            .query(&[("environment", self.environment.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SdkError::Unauthorized);
        }
        Ok(response.error_for_status()?.json().await?)
    }
}

struct HttpEventSink {
    http: reqwest::Client,
    base_url: String,
    sdk_key: String,
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, event: EvaluationEvent) -> Result<(), SdkError> {
        // The acknowledgement body is never inspected.
        self.http
            .post(format!("{}/sdk/events", self.base_url))
            .header("x-sdk-key", &self.sdk_key)
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{EvalReason, FlagKind, Targeting};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeFetcher {
        flags: Mutex<Vec<FlagRecord>>,
        failing: AtomicBool,
        fetches: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(flags: Vec<FlagRecord>) -> Arc<Self> {
            Arc::new(FakeFetcher {
                flags: Mutex::new(flags),
                failing: AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
            })
        }

        fn set_flags(&self, flags: Vec<FlagRecord>) {
            *self.flags.lock().unwrap() = flags;
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FlagFetcher for FakeFetcher {
        async fn fetch_flags(&self) -> Result<Vec<FlagRecord>, SdkError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SdkError::Unauthorized);
            }
            Ok(self.flags.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EvaluationEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, event: EvaluationEvent) -> Result<(), SdkError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn boolean_flag(key: &str, rollout: i32) -> FlagRecord {
        FlagRecord {
            key: key.to_string(),
            kind: FlagKind::Boolean,
            enabled: true,
            rollout_percentage: rollout,
            targeting: Targeting::default(),
            variants: vec![],
            default_variant_id: None,
            off_variant_id: None,
        }
    }

    fn test_config() -> SyncClientConfig {
        SyncClientConfig {
            environment: "production".to_string(),
            // Long enough that the interval never fires during a test;
            // tests drive refreshes through refresh_now.
            poll_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn first_fetch_completes_before_start_returns() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher.clone(), sink, test_config()).await;

        assert!(client.is_ready());
        let result = client.evaluate("new-ui", "user-1", None);
        assert!(result.enabled);
        client.destroy();
    }

    #[tokio::test]
    async fn evaluation_before_first_successful_fetch_returns_default() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        fetcher.set_failing(true);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher.clone(), sink, test_config()).await;

        assert!(!client.is_ready());
        let result = client.evaluate("new-ui", "user-1", Some(&json!("fallback")));
        assert_eq!(result.reason, EvalReason::FlagNotFound);
        assert_eq!(result.value, json!("fallback"));
        assert!(client.is_enabled("new-ui", "user-1", true));

        // Recovery on a later cycle.
        fetcher.set_failing(false);
        assert!(client.refresh_now().await);
        assert!(client.evaluate("new-ui", "user-1", None).enabled);
        client.destroy();
    }

    #[tokio::test]
    async fn missing_key_returns_callers_default() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher, sink, test_config()).await;

        let result = client.evaluate("unknown", "user-1", Some(&json!(true)));
        assert_eq!(result.reason, EvalReason::FlagNotFound);
        assert!(!result.enabled);
        assert_eq!(result.value, json!(true));
        assert!(!client.is_enabled("unknown", "user-1", false));
        client.destroy();
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot_wholesale() {
        let fetcher = FakeFetcher::new(vec![
            boolean_flag("keep-me", 100),
            boolean_flag("drop-me", 100),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher.clone(), sink, test_config()).await;

        assert!(client.evaluate("drop-me", "user-1", None).enabled);

        // Server-side deletion shows up as the key vanishing from the map.
        fetcher.set_flags(vec![boolean_flag("keep-me", 100)]);
        assert!(client.refresh_now().await);

        assert!(client.evaluate("keep-me", "user-1", None).enabled);
        assert_eq!(
            client.evaluate("drop-me", "user-1", None).reason,
            EvalReason::FlagNotFound
        );
        client.destroy();
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_known_good_set() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher.clone(), sink, test_config()).await;

        fetcher.set_failing(true);
        assert!(!client.refresh_now().await);

        // Still serving the snapshot from before the failure.
        assert!(client.is_ready());
        assert!(client.evaluate("new-ui", "user-1", None).enabled);
        client.destroy();
    }

    #[tokio::test]
    async fn subscribers_run_after_each_successful_fetch() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher.clone(), sink, test_config()).await;

        let notified = Arc::new(AtomicUsize::new(0));
        let seen_keys = Arc::new(Mutex::new(Vec::new()));
        let notified_clone = Arc::clone(&notified);
        let seen_clone = Arc::clone(&seen_keys);
        client.subscribe(move |flags| {
            notified_clone.fetch_add(1, Ordering::SeqCst);
            seen_clone
                .lock()
                .unwrap()
                .push(flags.keys().cloned().collect::<Vec<_>>());
        });

        assert!(client.refresh_now().await);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(seen_keys.lock().unwrap()[0], vec!["new-ui".to_string()]);

        // A failed fetch must not notify.
        fetcher.set_failing(true);
        assert!(!client.refresh_now().await);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        client.destroy();
    }

    #[tokio::test]
    async fn evaluations_emit_analytics_events() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher, sink.clone(), test_config()).await;

        client.evaluate("new-ui", "user-1", None);
        client.evaluate("unknown", "user-2", None);

        // The emit is detached; give the spawned sends a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].flag_key, "new-ui");
        assert!(events[0].result);
        assert_eq!(events[0].user_id, "user-1");
        assert_eq!(events[0].environment, "production");
        assert_eq!(events[1].flag_key, "unknown");
        assert!(!events[1].result);
        drop(events);
        client.destroy();
    }

    #[tokio::test]
    async fn background_poll_refreshes_on_interval() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let config = SyncClientConfig {
            environment: "production".to_string(),
            poll_interval: Duration::from_millis(20),
        };
        let client = SyncClient::start(fetcher.clone(), sink, config).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(
            fetcher.fetches.load(Ordering::SeqCst) >= 3,
            "polling loop should have fetched repeatedly"
        );
        client.destroy();
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_clears_state() {
        let fetcher = FakeFetcher::new(vec![boolean_flag("new-ui", 100)]);
        let sink = Arc::new(RecordingSink::default());
        let client = SyncClient::start(fetcher.clone(), sink, test_config()).await;

        client.destroy();
        client.destroy();

        assert!(!client.is_ready());
        let result = client.evaluate("new-ui", "user-1", None);
        assert_eq!(result.reason, EvalReason::FlagNotFound);

        let fetches_after_destroy = fetcher.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), fetches_after_destroy);
    }
}
