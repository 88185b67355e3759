use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::{
    dynamic_config::{DynamicConfig, EventSink, FeatureGate, Layer},
    evaluator::{evaluate, Decision, Overrides},
    events::{LogEvent, LogEventProcessor},
    fetcher::{Fetcher, HttpFetcher},
    snapshot::Reason,
    spec::SpecKind,
    spec_store::SpecStore,
    Result, StatsigOptions, StatsigUser,
};

/// A server-side Statsig instance.
///
/// Lifecycle: [`new`](Server::new) → [`initialize`](Server::initialize) → evaluate →
/// [`shutdown`](Server::shutdown). Evaluation works at any point; before the first successful
/// sync every result carries [`Reason::Uninitialized`].
///
/// # Examples
/// ```no_run
/// # async fn run() -> statsig::Result<()> {
/// use statsig::{Server, StatsigOptions, StatsigUser};
///
/// let server = Server::new("secret-key", StatsigOptions::new())?;
/// server.initialize().await;
///
/// let user = StatsigUser::with_user_id("a-user");
/// if server.check_gate(&user, "new_checkout") {
///     // ...
/// }
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    store: Arc<SpecStore>,
    logger: Arc<LogEventProcessor>,
    overrides: RwLock<Overrides>,
    options: StatsigOptions,
    initialized: OnceCell<Reason>,
}

impl Server {
    /// Create a server talking to `options.api` with the given server secret key.
    ///
    /// Returns an error if `options.api` is not a valid URL.
    pub fn new(secret_key: impl Into<String>, options: StatsigOptions) -> Result<Server> {
        let fetcher = HttpFetcher::new(&options.api, secret_key)?;
        Ok(Server::with_fetcher(options, Arc::new(fetcher)))
    }

    /// Create a server that performs all network requests through `fetcher`.
    pub fn with_fetcher(options: StatsigOptions, fetcher: Arc<dyn Fetcher>) -> Server {
        Server {
            store: Arc::new(SpecStore::new(fetcher.clone(), &options)),
            logger: Arc::new(LogEventProcessor::new(fetcher, &options)),
            overrides: RwLock::new(Overrides::default()),
            options,
            initialized: OnceCell::new(),
        }
    }

    /// Load specs from the first available source and start background syncs.
    ///
    /// Must be called from within a Tokio runtime. Later calls return the reason of the first
    /// one without doing any work.
    pub async fn initialize(&self) -> Reason {
        *self
            .initialized
            .get_or_init(|| async {
                self.logger.start();
                let reason = self.store.init().await;
                log::info!(target: "statsig", reason; "initialized");
                reason
            })
            .await
    }

    /// Return `true` if the gate passes for `user`. Logs a gate exposure.
    pub fn check_gate(&self, user: &StatsigUser, gate_name: &str) -> bool {
        self.get_feature_gate(user, gate_name).value
    }

    /// Like [`check_gate`](Server::check_gate), without logging an exposure.
    pub fn check_gate_with_exposure_logging_disabled(&self, user: &StatsigUser, gate_name: &str) -> bool {
        self.get_feature_gate_with_exposure_logging_disabled(user, gate_name)
            .value
    }

    /// Evaluate a gate for `user`, with rule and provenance details. Logs a gate exposure.
    pub fn get_feature_gate(&self, user: &StatsigUser, gate_name: &str) -> FeatureGate {
        let (user, decision) = self.evaluate(user, gate_name, SpecKind::Gate);
        self.logger
            .log(LogEvent::gate_exposure(&user, &decision, false));
        FeatureGate::from(&decision)
    }

    /// Like [`get_feature_gate`](Server::get_feature_gate), without logging an exposure.
    pub fn get_feature_gate_with_exposure_logging_disabled(
        &self,
        user: &StatsigUser,
        gate_name: &str,
    ) -> FeatureGate {
        let (_, decision) = self.evaluate(user, gate_name, SpecKind::Gate);
        FeatureGate::from(&decision)
    }

    /// Log a gate exposure for an earlier check made with exposure logging disabled.
    pub fn manually_log_gate_exposure(&self, user: &StatsigUser, gate_name: &str) {
        let (user, decision) = self.evaluate(user, gate_name, SpecKind::Gate);
        self.logger
            .log(LogEvent::gate_exposure(&user, &decision, true));
    }

    /// Evaluate a dynamic config for `user`. Logs a config exposure.
    pub fn get_config(&self, user: &StatsigUser, config_name: &str) -> DynamicConfig {
        let (user, decision) = self.evaluate(user, config_name, SpecKind::Config);
        self.logger
            .log(LogEvent::config_exposure(&user, &decision, false));
        self.dynamic_config(user, &decision)
    }

    /// Like [`get_config`](Server::get_config), without logging an exposure.
    pub fn get_config_with_exposure_logging_disabled(
        &self,
        user: &StatsigUser,
        config_name: &str,
    ) -> DynamicConfig {
        let (user, decision) = self.evaluate(user, config_name, SpecKind::Config);
        self.dynamic_config(user, &decision)
    }

    /// Log a config exposure for an earlier evaluation made with exposure logging disabled.
    pub fn manually_log_config_exposure(&self, user: &StatsigUser, config_name: &str) {
        let (user, decision) = self.evaluate(user, config_name, SpecKind::Config);
        self.logger
            .log(LogEvent::config_exposure(&user, &decision, true));
    }

    /// Evaluate an experiment for `user`. Experiments are dynamic configs with group assignment.
    pub fn get_experiment(&self, user: &StatsigUser, experiment_name: &str) -> DynamicConfig {
        self.get_config(user, experiment_name)
    }

    /// Like [`get_experiment`](Server::get_experiment), without logging an exposure.
    pub fn get_experiment_with_exposure_logging_disabled(
        &self,
        user: &StatsigUser,
        experiment_name: &str,
    ) -> DynamicConfig {
        self.get_config_with_exposure_logging_disabled(user, experiment_name)
    }

    /// Log an experiment exposure for an earlier evaluation made with exposure logging disabled.
    pub fn manually_log_experiment_exposure(&self, user: &StatsigUser, experiment_name: &str) {
        self.manually_log_config_exposure(user, experiment_name)
    }

    /// Evaluate a layer for `user`. Exposures are logged per parameter, when parameters are read
    /// from the returned [`Layer`].
    pub fn get_layer(&self, user: &StatsigUser, layer_name: &str) -> Layer {
        let (user, decision) = self.evaluate(user, layer_name, SpecKind::Layer);
        Layer::new(decision, Some(self.event_sink(user)), true)
    }

    /// Like [`get_layer`](Server::get_layer), but reading parameters logs no exposures.
    pub fn get_layer_with_exposure_logging_disabled(&self, user: &StatsigUser, layer_name: &str) -> Layer {
        let (user, decision) = self.evaluate(user, layer_name, SpecKind::Layer);
        Layer::new(decision, Some(self.event_sink(user)), false)
    }

    /// Log the exposure of one layer parameter, e.g. after reading it from a layer obtained with
    /// exposure logging disabled.
    pub fn manually_log_layer_parameter_exposure(
        &self,
        user: &StatsigUser,
        layer_name: &str,
        parameter_name: &str,
    ) {
        let (user, decision) = self.evaluate(user, layer_name, SpecKind::Layer);
        Layer::new(decision, Some(self.event_sink(user)), false)
            .log_parameter_exposure(parameter_name, true);
    }

    /// Force `gate_name` to `value`, for a single user id or (with `None`) for everyone.
    pub fn override_gate(&self, gate_name: &str, value: bool, user_id: Option<&str>) {
        self.update_overrides(|o| o.set(SpecKind::Gate, gate_name, Value::Bool(value), user_id));
    }

    /// Force `config_name` (a dynamic config or experiment) to `value`.
    pub fn override_config(&self, config_name: &str, value: Value, user_id: Option<&str>) {
        self.update_overrides(|o| o.set(SpecKind::Config, config_name, value, user_id));
    }

    /// Force `layer_name` to `value`.
    pub fn override_layer(&self, layer_name: &str, value: Value, user_id: Option<&str>) {
        self.update_overrides(|o| o.set(SpecKind::Layer, layer_name, value, user_id));
    }

    /// Remove a gate override for `user_id`, or all overrides of the gate with `None`.
    pub fn remove_gate_override(&self, gate_name: &str, user_id: Option<&str>) {
        self.update_overrides(|o| o.remove(SpecKind::Gate, gate_name, user_id));
    }

    /// Remove a config override for `user_id`, or all overrides of the config with `None`.
    pub fn remove_config_override(&self, config_name: &str, user_id: Option<&str>) {
        self.update_overrides(|o| o.remove(SpecKind::Config, config_name, user_id));
    }

    /// Remove a layer override for `user_id`, or all overrides of the layer with `None`.
    pub fn remove_layer_override(&self, layer_name: &str, user_id: Option<&str>) {
        self.update_overrides(|o| o.remove(SpecKind::Layer, layer_name, user_id));
    }

    /// Remove every gate, config and layer override.
    pub fn clear_all_overrides(&self) {
        self.update_overrides(Overrides::clear);
    }

    /// Queue a custom event.
    pub fn log_event(
        &self,
        user: &StatsigUser,
        event_name: &str,
        value: Option<Value>,
        metadata: HashMap<String, String>,
    ) {
        let user = self.normalize_user(user);
        let mut event = LogEvent::new(event_name, &user);
        event.value = value;
        event.metadata = metadata;
        self.logger.log(event);
    }

    /// Deliver all queued events now.
    pub async fn flush(&self) {
        self.logger.flush().await;
    }

    /// Stop background syncs and deliver queued events, waiting at most
    /// [`StatsigOptions::shutdown_timeout`].
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(self.options.shutdown_timeout)
            .await
    }

    /// Stop background syncs and deliver queued events, waiting at most `timeout` for in-flight
    /// work.
    ///
    /// Returns `false` if the timeout elapsed. Work still in flight keeps running in the
    /// background. Safe to call more than once.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        let (events_done, store_done) = tokio::join!(
            self.logger.shutdown(timeout),
            self.store.shutdown_async(timeout),
        );
        log::debug!(target: "statsig", events_done, store_done; "shut down");
        events_done && store_done
    }

    /// Number of events given up on after exhausting delivery retries.
    pub fn dropped_event_count(&self) -> u64 {
        self.logger.dropped_event_count()
    }

    fn evaluate<'u>(&self, user: &'u StatsigUser, name: &str, kind: SpecKind) -> (Cow<'u, StatsigUser>, Decision) {
        if !user.has_identity() {
            log::warn!(target: "statsig", spec_name = name; "evaluating for a user without userID or customIDs");
        }

        let user = self.normalize_user(user);
        let snapshot = self.store.get_snapshot();
        let decision = {
            let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
            evaluate(&snapshot, &user, name, kind, &overrides, Utc::now())
        };
        (user, decision)
    }

    /// Attach the configured environment to users that do not carry their own.
    fn normalize_user<'u>(&self, user: &'u StatsigUser) -> Cow<'u, StatsigUser> {
        if user.statsig_environment.is_empty() && !self.options.environment.is_empty() {
            let mut user = user.clone();
            user.statsig_environment = self.options.environment.clone();
            Cow::Owned(user)
        } else {
            Cow::Borrowed(user)
        }
    }

    fn update_overrides(&self, f: impl FnOnce(&mut Overrides)) {
        let mut overrides = self.overrides.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut overrides);
    }

    fn event_sink(&self, user: Cow<'_, StatsigUser>) -> EventSink {
        EventSink::new(self.logger.clone(), user.into_owned())
    }

    fn dynamic_config(&self, user: Cow<'_, StatsigUser>, decision: &Decision) -> DynamicConfig {
        DynamicConfig::new(decision, Some(self.event_sink(user)))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use serde_json::json;

    use super::Server;
    use crate::{
        data_adapter::CONFIG_SPECS_KEY,
        events::{CONFIG_EXPOSURE_EVENT, DEFAULT_VALUE_TYPE_MISMATCH_EVENT, GATE_EXPOSURE_EVENT, LAYER_EXPOSURE_EVENT},
        fetcher::{DOWNLOAD_CONFIG_SPECS_ENDPOINT, LOG_EVENT_ENDPOINT},
        snapshot::Reason,
        test_utils::{fixture_json, MemoryDataAdapter, MockFetcher, FIXTURE_TIME},
        StatsigOptions, StatsigUser,
    };

    fn statsig_user() -> StatsigUser {
        StatsigUser::with_user_id("a-user").email("a-user@statsig.com")
    }

    fn network_server(options: StatsigOptions) -> (Server, Arc<MockFetcher>) {
        let fetcher = Arc::new(MockFetcher::new().with_config_specs(fixture_json()));
        (Server::with_fetcher(options, fetcher.clone()), fetcher)
    }

    #[tokio::test]
    async fn uninitialized_server_serves_defaults() {
        let fetcher = Arc::new(MockFetcher::new());
        let server = Server::with_fetcher(StatsigOptions::new(), fetcher.clone());

        let gate = server.get_feature_gate(&statsig_user(), "always_on_gate");
        assert!(!gate.value);
        assert_eq!(gate.details.reason, Reason::Uninitialized);

        let config = server.get_config(&statsig_user(), "test_config");
        assert!(config.value.is_empty());
        assert_eq!(config.details.reason, Reason::Uninitialized);
        assert_eq!(config.get("number", 0), 0);

        let layer = server.get_layer(&statsig_user(), "a_layer");
        assert_eq!(layer.details.reason, Reason::Uninitialized);

        assert!(server.shutdown().await);
        let exposures = fetcher.logged_events_named(GATE_EXPOSURE_EVENT);
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0]["metadata"]["reason"], json!("Uninitialized"));
    }

    #[tokio::test]
    async fn initialize_from_network() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (server, fetcher) = network_server(StatsigOptions::new());
        assert_eq!(server.initialize().await, Reason::Network);
        // Idempotent.
        assert_eq!(server.initialize().await, Reason::Network);
        assert_eq!(fetcher.call_count(DOWNLOAD_CONFIG_SPECS_ENDPOINT), 1);

        let user = statsig_user();
        assert!(server.check_gate(&user, "always_on_gate"));
        assert!(server.check_gate(&user, "on_for_statsig_email"));
        assert!(!server.check_gate(&StatsigUser::with_user_id("b"), "on_for_statsig_email"));

        let gate = server.get_feature_gate(&user, "disabled_gate");
        assert!(!gate.value);
        assert_eq!(gate.rule_id, "disabled");
        assert_eq!(gate.details.reason, Reason::Network);
        assert_eq!(gate.details.config_sync_time, FIXTURE_TIME);

        let config = server.get_config(&user, "test_config");
        assert_eq!(config.rule_id, "1kNmlB23wylPFZi1M0Divl");
        assert_eq!(config.get("string", String::new()), "statsig");

        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn unknown_names_are_unrecognized() {
        let (server, _) = network_server(StatsigOptions::new());
        server.initialize().await;

        let gate = server.get_feature_gate(&statsig_user(), "not_a_gate");
        assert!(!gate.value);
        assert_eq!(gate.details.reason, Reason::Unrecognized);
        assert_eq!(
            server.get_config(&statsig_user(), "not_a_config").details.reason,
            Reason::Unrecognized
        );
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn exposures_carry_evaluation_metadata() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (server, fetcher) = network_server(StatsigOptions::new());
        server.initialize().await;

        let user = statsig_user().private_attribute("secret", "x");
        server.check_gate(&user, "nested_gate");
        server.get_config(&user, "test_config");
        server.flush().await;

        let gates = fetcher.logged_events_named(GATE_EXPOSURE_EVENT);
        assert_eq!(gates.len(), 1);
        let metadata = &gates[0]["metadata"];
        assert_eq!(metadata["gate"], json!("nested_gate"));
        assert_eq!(metadata["gateValue"], json!("true"));
        assert_eq!(metadata["ruleID"], json!("3Oq2CVn1aNlxKwEAuvHK1q"));
        assert_eq!(metadata["reason"], json!("Network"));
        assert_eq!(metadata["configSyncTime"], json!(FIXTURE_TIME.to_string()));
        assert!(metadata.get("isManualExposure").is_none());
        assert_eq!(gates[0]["secondaryExposures"].as_array().map(Vec::len), Some(2));
        assert!(gates[0]["user"].get("privateAttributes").is_none());

        let configs = fetcher.logged_events_named(CONFIG_EXPOSURE_EVENT);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0]["metadata"]["config"], json!("test_config"));
        assert_eq!(configs[0]["metadata"]["ruleID"], json!("1kNmlB23wylPFZi1M0Divl"));

        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn exposure_logging_can_be_disabled_and_done_manually() {
        let (server, fetcher) = network_server(StatsigOptions::new());
        server.initialize().await;
        let user = statsig_user();

        assert!(server.check_gate_with_exposure_logging_disabled(&user, "always_on_gate"));
        server.get_config_with_exposure_logging_disabled(&user, "test_config");
        let layer = server.get_layer_with_exposure_logging_disabled(&user, "a_layer");
        assert_eq!(layer.get("experiment_param", String::new()), "control");
        server.flush().await;
        assert!(fetcher.logged_events().is_empty());

        server.manually_log_gate_exposure(&user, "always_on_gate");
        server.manually_log_experiment_exposure(&user, "sample_experiment");
        server.manually_log_layer_parameter_exposure(&user, "a_layer", "experiment_param");
        server.flush().await;

        let events = fetcher.logged_events();
        assert_eq!(events.len(), 3);
        for event in &events {
            assert_eq!(event["metadata"]["isManualExposure"], json!("true"));
        }
        assert_eq!(events[2]["eventName"], json!(LAYER_EXPOSURE_EVENT));
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn overrides_win_over_specs() {
        let (server, _) = network_server(StatsigOptions::new());
        server.initialize().await;
        let user = statsig_user();

        server.override_gate("always_on_gate", false, None);
        let gate = server.get_feature_gate(&user, "always_on_gate");
        assert!(!gate.value);
        assert_eq!(gate.rule_id, "override");
        assert_eq!(gate.details.reason, Reason::LocalOverride);

        server.override_gate("always_on_gate", true, Some("a-user"));
        assert!(server.check_gate(&user, "always_on_gate"));
        assert!(!server.check_gate(&StatsigUser::with_user_id("other"), "always_on_gate"));

        server.override_config("test_config", json!({"number": 99}), None);
        let config = server.get_config(&user, "test_config");
        assert_eq!(config.get("number", 0), 99);
        assert_eq!(config.details.reason, Reason::LocalOverride);

        // Overrides also apply to names the specs do not know.
        server.override_layer("unknown_layer", json!({"p": "v"}), None);
        assert_eq!(server.get_layer(&user, "unknown_layer").get("p", String::new()), "v");

        server.remove_gate_override("always_on_gate", None);
        assert!(server.check_gate(&user, "always_on_gate"));
        server.remove_gate_override("always_on_gate", Some("a-user"));
        assert_eq!(
            server.get_feature_gate(&user, "always_on_gate").details.reason,
            Reason::Network
        );

        server.clear_all_overrides();
        assert_eq!(server.get_config(&user, "test_config").details.reason, Reason::Network);
        assert_eq!(
            server.get_layer(&user, "unknown_layer").details.reason,
            Reason::Unrecognized
        );
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn overrides_apply_before_initialization() {
        let server = Server::with_fetcher(StatsigOptions::new(), Arc::new(MockFetcher::new()));
        server.override_gate("any_gate", true, None);
        let gate = server.get_feature_gate(&statsig_user(), "any_gate");
        assert!(gate.value);
        assert_eq!(gate.details.reason, Reason::LocalOverride);
    }

    #[tokio::test]
    async fn bootstrap_reason() {
        let fetcher = Arc::new(MockFetcher::new());
        let options = StatsigOptions::new().with_bootstrap_values(fixture_json());
        let server = Server::with_fetcher(options, fetcher.clone());

        assert_eq!(server.initialize().await, Reason::Bootstrap);
        let gate = server.get_feature_gate(&statsig_user(), "always_on_gate");
        assert!(gate.value);
        assert_eq!(gate.details.reason, Reason::Bootstrap);
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn data_adapter_reason() {
        let adapter = Arc::new(MemoryDataAdapter::new().with_value(CONFIG_SPECS_KEY, fixture_json()));
        let options = StatsigOptions::new().with_data_adapter(adapter.clone());
        let (server, _) = network_server(options);

        assert_eq!(server.initialize().await, Reason::DataAdapter);
        assert_eq!(
            server.get_feature_gate(&statsig_user(), "always_on_gate").details.reason,
            Reason::DataAdapter
        );
        assert_eq!(adapter.set_count(), 0);
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn type_mismatch_is_reported_once() {
        let (server, fetcher) = network_server(StatsigOptions::new());
        server.initialize().await;

        let config = server.get_config(&statsig_user(), "test_config");
        assert!(!config.get("number", false));
        assert_eq!(config.get("number", 0), 4);
        server.flush().await;

        let mismatches = fetcher.logged_events_named(DEFAULT_VALUE_TYPE_MISMATCH_EVENT);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(
            mismatches[0]["metadata"],
            json!({
                "defaultValueType": "boolean",
                "name": "test_config",
                "parameter": "number",
                "ruleID": "1kNmlB23wylPFZi1M0Divl",
                "valueType": "number",
            })
        );
        assert_eq!(mismatches[0]["user"]["userID"], json!("a-user"));
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn custom_events_and_environment() {
        let options = StatsigOptions::new().with_environment_tier("staging");
        let (server, fetcher) = network_server(options);

        server.log_event(
            &StatsigUser::with_user_id("a-user"),
            "purchase",
            Some(json!(9.99)),
            HashMap::from([("sku".to_owned(), "abc".to_owned())]),
        );
        server.log_event(
            &StatsigUser::with_user_id("b-user").environment("tier", "production"),
            "purchase",
            None,
            HashMap::new(),
        );
        assert!(server.shutdown().await);

        let events = fetcher.logged_events_named("purchase");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["value"], json!(9.99));
        assert_eq!(events[0]["metadata"]["sku"], json!("abc"));
        assert_eq!(events[0]["user"]["statsigEnvironment"], json!({"tier": "staging"}));
        assert_eq!(events[1]["user"]["statsigEnvironment"], json!({"tier": "production"}));
    }

    #[tokio::test]
    async fn shutdown_waits_for_event_delivery() {
        let latency = Duration::from_millis(500);
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_config_specs(fixture_json())
                .with_latency(LOG_EVENT_ENDPOINT, latency),
        );
        let server = Server::with_fetcher(StatsigOptions::new(), fetcher.clone());
        server.initialize().await;

        server.check_gate(&statsig_user(), "always_on_gate");
        let start = tokio::time::Instant::now();
        assert!(server.shutdown_with_timeout(Duration::from_secs(5)).await);
        assert!(start.elapsed() >= latency);
        assert_eq!(fetcher.logged_events().len(), 1);

        // Events after shutdown are discarded.
        server.check_gate(&statsig_user(), "always_on_gate");
        assert!(server.shutdown().await);
        assert_eq!(fetcher.logged_events().len(), 1);
    }
}
