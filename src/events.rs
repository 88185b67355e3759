//! Exposure and custom events, and the batching pipeline that delivers them.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

use crate::{
    config::StatsigOptions,
    evaluator::{Decision, SecondaryExposure},
    fetcher::{Fetcher, LOG_EVENT_ENDPOINT, SDK_TYPE, SDK_VERSION},
    Error, StatsigUser,
};

/// Logged for every gate check.
pub const GATE_EXPOSURE_EVENT: &str = "statsig::gate_exposure";
/// Logged for every config and experiment evaluation.
pub const CONFIG_EXPOSURE_EVENT: &str = "statsig::config_exposure";
/// Logged when a layer parameter is read.
pub const LAYER_EXPOSURE_EVENT: &str = "statsig::layer_exposure";
/// Logged when a typed getter falls back to its default because the stored value does not fit.
pub const DEFAULT_VALUE_TYPE_MISMATCH_EVENT: &str = "statsig::default_value_type_mismatch";

/// An event as delivered to the `log_event` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Event name, e.g. `statsig::gate_exposure` or an application event.
    pub event_name: String,
    /// Milliseconds since epoch.
    pub time: u64,
    /// User the event is attributed to, without private attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<StatsigUser>,
    /// Optional event value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// String metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Nested gate exposures behind an exposure event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_exposures: Vec<SecondaryExposure>,
}

impl LogEvent {
    /// Create an event for `user`. Private attributes are stripped from the attached user.
    pub fn new(event_name: impl Into<String>, user: &StatsigUser) -> LogEvent {
        LogEvent {
            event_name: event_name.into(),
            time: Utc::now().timestamp_millis().max(0) as u64,
            user: Some(user.to_loggable()),
            value: None,
            metadata: HashMap::new(),
            secondary_exposures: Vec::new(),
        }
    }

    /// Attach a value.
    pub fn with_value(mut self, value: impl Into<Value>) -> LogEvent {
        self.value = Some(value.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> LogEvent {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn with_evaluation_metadata(self, decision: &Decision, is_manual: bool) -> LogEvent {
        let event = self
            .with_metadata("ruleID", decision.rule_id.as_str())
            .with_metadata("reason", decision.reason.as_str())
            .with_metadata("serverTime", decision.server_time.to_string())
            .with_metadata("configSyncTime", decision.config_sync_time.to_string())
            .with_metadata("initTime", decision.init_time.to_string());
        if is_manual {
            event.with_metadata("isManualExposure", "true")
        } else {
            event
        }
    }

    pub(crate) fn gate_exposure(user: &StatsigUser, decision: &Decision, is_manual: bool) -> LogEvent {
        let mut event = LogEvent::new(GATE_EXPOSURE_EVENT, user)
            .with_metadata("gate", decision.name.as_str())
            .with_metadata("gateValue", decision.value.to_string())
            .with_evaluation_metadata(decision, is_manual);
        event.secondary_exposures = decision.secondary_exposures.clone();
        event
    }

    pub(crate) fn config_exposure(user: &StatsigUser, decision: &Decision, is_manual: bool) -> LogEvent {
        let mut event = LogEvent::new(CONFIG_EXPOSURE_EVENT, user)
            .with_metadata("config", decision.name.as_str())
            .with_evaluation_metadata(decision, is_manual);
        event.secondary_exposures = decision.secondary_exposures.clone();
        event
    }

    /// Exposure of a single layer parameter. Parameters owned by the allocated experiment carry
    /// the experiment's exposures; all others only the layer's own.
    pub(crate) fn layer_exposure(
        user: &StatsigUser,
        decision: &Decision,
        parameter_name: &str,
        is_manual: bool,
    ) -> LogEvent {
        let is_explicit = decision
            .explicit_parameters
            .iter()
            .any(|p| p == parameter_name);
        let allocated_experiment = if is_explicit {
            decision.config_delegate.clone().unwrap_or_default()
        } else {
            String::new()
        };

        let mut event = LogEvent::new(LAYER_EXPOSURE_EVENT, user)
            .with_metadata("config", decision.name.as_str())
            .with_metadata("allocatedExperiment", allocated_experiment)
            .with_metadata("parameterName", parameter_name)
            .with_metadata("isExplicitParameter", is_explicit.to_string())
            .with_evaluation_metadata(decision, is_manual);
        event.secondary_exposures = if is_explicit {
            decision.secondary_exposures.clone()
        } else {
            decision.undelegated_secondary_exposures.clone()
        };
        event
    }

    pub(crate) fn default_value_type_mismatch(
        user: &StatsigUser,
        name: &str,
        parameter: &str,
        rule_id: &str,
        value_type: &str,
        default_value_type: &str,
    ) -> LogEvent {
        LogEvent::new(DEFAULT_VALUE_TYPE_MISMATCH_EVENT, user)
            .with_metadata("name", name)
            .with_metadata("parameter", parameter)
            .with_metadata("ruleID", rule_id)
            .with_metadata("valueType", value_type)
            .with_metadata("defaultValueType", default_value_type)
    }
}

/// Batches events and delivers them through a [`Fetcher`].
///
/// Events are flushed when the queue reaches `logging_max_buffer_size` (on the current Tokio
/// runtime, if any), every `logging_interval` once [`start`](LogEventProcessor::start) has been
/// called, and on [`flush`] /
/// [`shutdown`](LogEventProcessor::shutdown). Batches are delivered one at a time in the order
/// events were logged.
///
/// [`flush`]: LogEventProcessor::flush
pub struct LogEventProcessor {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    queue: Mutex<VecDeque<LogEvent>>,
    /// Serializes deliveries. Acquired before draining the queue so that batches leave in the
    /// order they were queued.
    delivery: tokio::sync::Mutex<()>,
    flush_requested: Notify,
    max_buffer_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    /// Local mode: events are accepted and discarded.
    disabled: bool,
    is_shutdown: AtomicBool,
    dropped_event_count: AtomicU64,
}

impl LogEventProcessor {
    /// Create a processor delivering through `fetcher`. No task is spawned until needed.
    pub fn new(fetcher: Arc<dyn Fetcher>, options: &StatsigOptions) -> LogEventProcessor {
        let (stop, _) = watch::channel(false);
        LogEventProcessor {
            inner: Arc::new(Inner {
                fetcher,
                queue: Mutex::new(VecDeque::new()),
                delivery: tokio::sync::Mutex::new(()),
                flush_requested: Notify::new(),
                max_buffer_size: options.clamped_logging_buffer_size(),
                flush_interval: options.logging_interval,
                max_retries: options.logging_max_retries,
                retry_backoff: options.logging_retry_backoff,
                disabled: options.local_mode,
                is_shutdown: AtomicBool::new(false),
                dropped_event_count: AtomicU64::new(0),
            }),
            stop,
            worker: Mutex::new(None),
        }
    }

    /// Start the periodic flush task. Must be called from within a Tokio runtime. Calling it
    /// again is a no-op.
    pub fn start(&self) {
        if self.inner.disabled || self.inner.is_shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut stop = self.stop.subscribe();
        *worker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.flush_interval) => {}
                    _ = inner.flush_requested.notified() => {}
                    _ = stop.changed() => break,
                }
                inner.flush().await;
            }
            log::debug!(target: "statsig", "event flush task stopped");
        }));
    }

    /// Queue an event. Never blocks on delivery.
    pub fn log(&self, event: LogEvent) {
        if self.inner.disabled {
            return;
        }
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            log::debug!(target: "statsig", event_name:display = event.event_name; "discarding event logged after shutdown");
            return;
        }

        let len = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_back(event);
            queue.len()
        };
        if len >= self.inner.max_buffer_size {
            self.request_flush();
        }
    }

    /// Wake the flush task, or flush on the current runtime if none was started.
    fn request_flush(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            self.inner.flush_requested.notify_one();
            return;
        }
        drop(worker);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move { inner.flush().await });
            }
            Err(_) => {
                log::debug!(target: "statsig", "no runtime to flush a full event queue on, waiting for the next flush");
            }
        }
    }

    /// Deliver all currently queued events.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stop accepting events and deliver everything queued, waiting at most `timeout`.
    ///
    /// Returns `false` if the timeout elapsed first. Delivery is not cancelled in that case and
    /// completes in the background.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.is_shutdown.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let inner = Arc::clone(&self.inner);
        // Spawned so that hitting the timeout leaves the delivery running instead of dropping it.
        let flush = tokio::spawn(async move {
            if let Some(worker) = worker {
                let _ = worker.await;
            }
            inner.flush().await;
        });

        match tokio::time::timeout(timeout, flush).await {
            Ok(_) => true,
            Err(_) => {
                log::warn!(target: "statsig", timeout_ms = timeout.as_millis() as u64; "event delivery did not finish before shutdown timeout");
                false
            }
        }
    }

    /// Number of events given up on after exhausting delivery retries.
    pub fn dropped_event_count(&self) -> u64 {
        self.inner.dropped_event_count.load(Ordering::SeqCst)
    }

    /// Number of events waiting for the next flush.
    pub fn queued_event_count(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Inner {
    async fn flush(&self) {
        let _delivery = self.delivery.lock().await;

        let events = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.drain(..).collect::<Vec<_>>()
        };

        for batch in events.chunks(self.max_buffer_size) {
            self.deliver(batch).await;
        }
    }

    async fn deliver(&self, batch: &[LogEvent]) {
        let payload = json!({
            "events": batch,
            "statsigMetadata": {
                "sdkType": SDK_TYPE,
                "sdkVersion": SDK_VERSION,
            },
        });

        let mut attempt = 0;
        loop {
            match self.fetcher.post(LOG_EVENT_ENDPOINT, payload.clone()).await {
                Ok(_) => {
                    log::debug!(target: "statsig", event_count = batch.len(); "delivered events");
                    return;
                }
                Err(err) if attempt < self.max_retries && !matches!(err, Error::Unauthorized) => {
                    attempt += 1;
                    log::debug!(target: "statsig", attempt, error:display = err; "event delivery failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(err) => {
                    self.dropped_event_count
                        .fetch_add(batch.len() as u64, Ordering::SeqCst);
                    log::warn!(target: "statsig", event_count = batch.len(), error:display = err; "dropping events after failed delivery");
                    return;
                }
            }
        }
    }
}
