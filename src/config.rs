use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use crate::DataAdapter;

/// Configuration for [`Server`](crate::Server).
///
/// ```
/// # use std::time::Duration;
/// # use statsig::StatsigOptions;
/// let options = StatsigOptions::new()
///     .with_rulesets_sync_interval(Duration::from_secs(30))
///     .with_environment_tier("staging");
/// ```
// `Debug` is implemented by hand as the data adapter is a trait object.
#[derive(Clone)]
pub struct StatsigOptions {
    /// Base URL of the Statsig API.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_API`].
    pub api: String,
    /// A `download_config_specs` document used to serve evaluations before the first network
    /// sync completes.
    pub bootstrap_values: Option<String>,
    /// Persistent store read on startup (and optionally polled) and written after network syncs.
    pub data_adapter: Option<Arc<dyn DataAdapter>>,
    /// Interval to wait between spec syncs.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_RULESETS_SYNC_INTERVAL`].
    pub rulesets_sync_interval: Duration,
    /// Interval to wait between ID list syncs.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_ID_LISTS_SYNC_INTERVAL`].
    pub id_lists_sync_interval: Duration,
    /// Randomized duration subtracted from sync intervals. This helps to avoid multiple server
    /// instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_SYNC_JITTER`].
    pub sync_jitter: Duration,
    /// Interval between periodic event flushes.
    pub logging_interval: Duration,
    /// Number of queued events that triggers a flush. Clamped to
    /// `MIN_LOGGING_BUFFER_SIZE..=MAX_LOGGING_BUFFER_SIZE`.
    pub logging_max_buffer_size: usize,
    /// Additional delivery attempts for a batch that failed to send.
    pub logging_max_retries: u32,
    /// Base delay between delivery attempts. Attempt `n` waits `n * logging_retry_backoff`.
    pub logging_retry_backoff: Duration,
    /// Default timeout for [`Server::shutdown`](crate::Server::shutdown).
    pub shutdown_timeout: Duration,
    /// Environment attached to users that do not carry their own (e.g., `tier` → `production`).
    pub environment: HashMap<String, String>,
    /// Never touch the network: specs come only from bootstrap values or the data adapter and
    /// events are discarded.
    pub local_mode: bool,
}

impl StatsigOptions {
    /// Default value for [`StatsigOptions::api`].
    pub const DEFAULT_API: &'static str = "https://statsigapi.net/v1";
    /// Default value for [`StatsigOptions::rulesets_sync_interval`].
    pub const DEFAULT_RULESETS_SYNC_INTERVAL: Duration = Duration::from_secs(10);
    /// Default value for [`StatsigOptions::id_lists_sync_interval`].
    pub const DEFAULT_ID_LISTS_SYNC_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`StatsigOptions::sync_jitter`].
    pub const DEFAULT_SYNC_JITTER: Duration = Duration::ZERO;
    /// Default value for [`StatsigOptions::logging_interval`].
    pub const DEFAULT_LOGGING_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`StatsigOptions::logging_max_buffer_size`].
    pub const DEFAULT_LOGGING_MAX_BUFFER_SIZE: usize = 1000;
    /// Lower bound for [`StatsigOptions::logging_max_buffer_size`].
    pub const MIN_LOGGING_BUFFER_SIZE: usize = 10;
    /// Upper bound for [`StatsigOptions::logging_max_buffer_size`].
    pub const MAX_LOGGING_BUFFER_SIZE: usize = 10_000;
    /// Default value for [`StatsigOptions::logging_max_retries`].
    pub const DEFAULT_LOGGING_MAX_RETRIES: u32 = 3;
    /// Default value for [`StatsigOptions::logging_retry_backoff`].
    pub const DEFAULT_LOGGING_RETRY_BACKOFF: Duration = Duration::from_secs(1);
    /// Default value for [`StatsigOptions::shutdown_timeout`].
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create a new `StatsigOptions` using default configuration.
    pub fn new() -> StatsigOptions {
        StatsigOptions::default()
    }

    /// Override base URL for API calls. Servers should use the default setting in most cases.
    pub fn with_api(mut self, api: impl Into<String>) -> StatsigOptions {
        self.api = api.into();
        self
    }

    /// Serve evaluations from a `download_config_specs` document until the network catches up.
    pub fn with_bootstrap_values(mut self, bootstrap_values: impl Into<String>) -> StatsigOptions {
        self.bootstrap_values = Some(bootstrap_values.into());
        self
    }

    /// Read from and write to `data_adapter`.
    pub fn with_data_adapter(mut self, data_adapter: Arc<dyn DataAdapter>) -> StatsigOptions {
        self.data_adapter = Some(data_adapter);
        self
    }

    /// Set [`StatsigOptions::rulesets_sync_interval`].
    pub fn with_rulesets_sync_interval(mut self, interval: Duration) -> StatsigOptions {
        self.rulesets_sync_interval = interval;
        self
    }

    /// Set [`StatsigOptions::id_lists_sync_interval`].
    pub fn with_id_lists_sync_interval(mut self, interval: Duration) -> StatsigOptions {
        self.id_lists_sync_interval = interval;
        self
    }

    /// Set [`StatsigOptions::sync_jitter`].
    pub fn with_sync_jitter(mut self, jitter: Duration) -> StatsigOptions {
        self.sync_jitter = jitter;
        self
    }

    /// Set [`StatsigOptions::logging_interval`].
    pub fn with_logging_interval(mut self, interval: Duration) -> StatsigOptions {
        self.logging_interval = interval;
        self
    }

    /// Set [`StatsigOptions::logging_max_buffer_size`].
    pub fn with_logging_max_buffer_size(mut self, size: usize) -> StatsigOptions {
        self.logging_max_buffer_size = size;
        self
    }

    /// Set [`StatsigOptions::logging_max_retries`].
    pub fn with_logging_max_retries(mut self, retries: u32) -> StatsigOptions {
        self.logging_max_retries = retries;
        self
    }

    /// Set [`StatsigOptions::logging_retry_backoff`].
    pub fn with_logging_retry_backoff(mut self, backoff: Duration) -> StatsigOptions {
        self.logging_retry_backoff = backoff;
        self
    }

    /// Set [`StatsigOptions::shutdown_timeout`].
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> StatsigOptions {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the `tier` environment attribute (e.g., `"production"`, `"staging"`).
    pub fn with_environment_tier(mut self, tier: impl Into<String>) -> StatsigOptions {
        self.environment.insert("tier".to_owned(), tier.into());
        self
    }

    /// Set an arbitrary environment attribute.
    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<String>) -> StatsigOptions {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Disable all network access.
    pub fn with_local_mode(mut self, local_mode: bool) -> StatsigOptions {
        self.local_mode = local_mode;
        self
    }

    pub(crate) fn clamped_logging_buffer_size(&self) -> usize {
        self.logging_max_buffer_size.clamp(
            StatsigOptions::MIN_LOGGING_BUFFER_SIZE,
            StatsigOptions::MAX_LOGGING_BUFFER_SIZE,
        )
    }
}

impl Default for StatsigOptions {
    fn default() -> StatsigOptions {
        StatsigOptions {
            api: StatsigOptions::DEFAULT_API.to_owned(),
            bootstrap_values: None,
            data_adapter: None,
            rulesets_sync_interval: StatsigOptions::DEFAULT_RULESETS_SYNC_INTERVAL,
            id_lists_sync_interval: StatsigOptions::DEFAULT_ID_LISTS_SYNC_INTERVAL,
            sync_jitter: StatsigOptions::DEFAULT_SYNC_JITTER,
            logging_interval: StatsigOptions::DEFAULT_LOGGING_INTERVAL,
            logging_max_buffer_size: StatsigOptions::DEFAULT_LOGGING_MAX_BUFFER_SIZE,
            logging_max_retries: StatsigOptions::DEFAULT_LOGGING_MAX_RETRIES,
            logging_retry_backoff: StatsigOptions::DEFAULT_LOGGING_RETRY_BACKOFF,
            shutdown_timeout: StatsigOptions::DEFAULT_SHUTDOWN_TIMEOUT,
            environment: HashMap::new(),
            local_mode: false,
        }
    }
}

impl fmt::Debug for StatsigOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsigOptions")
            .field("api", &self.api)
            .field("bootstrap_values", &self.bootstrap_values.as_ref().map(String::len))
            .field("data_adapter", &self.data_adapter.is_some())
            .field("rulesets_sync_interval", &self.rulesets_sync_interval)
            .field("id_lists_sync_interval", &self.id_lists_sync_interval)
            .field("sync_jitter", &self.sync_jitter)
            .field("logging_interval", &self.logging_interval)
            .field("logging_max_buffer_size", &self.logging_max_buffer_size)
            .field("logging_max_retries", &self.logging_max_retries)
            .field("logging_retry_backoff", &self.logging_retry_backoff)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("environment", &self.environment)
            .field("local_mode", &self.local_mode)
            .finish()
    }
}
