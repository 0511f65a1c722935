//! Configuration surface for local and remote evaluation clients.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::flag::FlagConfig;
use crate::flag_store::FlagConfigStorage;

/// Default server URL for flag configuration and remote evaluation requests.
pub const DEFAULT_SERVER_URL: &str = "https://api.flagwire.io";

/// Default server URL for the streaming connection.
pub const DEFAULT_STREAM_SERVER_URL: &str = "https://stream.flagwire.io";

/// Default server URL for cohort downloads.
pub const DEFAULT_COHORT_SERVER_URL: &str = "https://cohort.flagwire.io";

/// Configuration for cohort synchronization. Supplying it to
/// [`LocalEvaluationConfig::with_cohort_sync`] enables cohort download and refresh.
#[derive(Clone)]
pub struct CohortSyncConfig {
    /// API key, used together with the secret key for Basic authentication.
    pub api_key: String,
    /// Secret key.
    pub secret_key: String,
    /// Cohort server URL.
    pub cohort_server_url: String,
    /// Largest cohort the SDK is willing to download. Larger cohorts fail their download
    /// permanently.
    pub max_cohort_size: usize,
    /// Interval between cohort refresh cycles.
    pub cohort_polling_interval: Duration,
    /// Timeout for a single cohort download request.
    pub request_timeout: Duration,
}

impl CohortSyncConfig {
    /// Default value for [`CohortSyncConfig::max_cohort_size`].
    pub const DEFAULT_MAX_COHORT_SIZE: usize = 2_147_483_647;
    /// Default value for [`CohortSyncConfig::cohort_polling_interval`].
    pub const DEFAULT_COHORT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`CohortSyncConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a cohort sync configuration with the given credentials and default settings.
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> CohortSyncConfig {
        CohortSyncConfig {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            cohort_server_url: DEFAULT_COHORT_SERVER_URL.to_owned(),
            max_cohort_size: CohortSyncConfig::DEFAULT_MAX_COHORT_SIZE,
            cohort_polling_interval: CohortSyncConfig::DEFAULT_COHORT_POLLING_INTERVAL,
            request_timeout: CohortSyncConfig::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the cohort server URL.
    pub fn with_cohort_server_url(mut self, url: impl Into<String>) -> CohortSyncConfig {
        self.cohort_server_url = url.into();
        self
    }

    /// Override the maximum cohort size.
    pub fn with_max_cohort_size(mut self, size: usize) -> CohortSyncConfig {
        self.max_cohort_size = size;
        self
    }

    /// Override the cohort polling interval.
    pub fn with_cohort_polling_interval(mut self, interval: Duration) -> CohortSyncConfig {
        self.cohort_polling_interval = interval;
        self
    }
}

/// Configuration for [`LocalEvaluationClient`](crate::client::LocalEvaluationClient).
#[derive(Clone, Default)]
pub struct LocalEvaluationConfig {
    /// Server URL for flag configuration fetches. Defaults to [`DEFAULT_SERVER_URL`].
    pub server_url: Option<String>,
    /// Server URL for the streaming connection. Defaults to [`DEFAULT_STREAM_SERVER_URL`].
    pub stream_server_url: Option<String>,
    /// Whether to receive flag configuration updates over the streaming connection, with polling
    /// as a fallback. When `false`, the SDK polls only.
    pub stream_updates: bool,
    /// Interval between flag configuration polls.
    pub flag_poll_interval: Option<Duration>,
    /// Timeout for a single flag configuration fetch.
    pub fetch_timeout: Option<Duration>,
    /// Timeout for establishing the streaming connection and receiving the initial
    /// configuration.
    pub stream_conn_timeout: Option<Duration>,
    /// Number of attempts to establish the streaming connection before falling back to polling.
    pub stream_conn_attempts: Option<u32>,
    /// Delay between streaming connection attempts.
    pub stream_conn_retry_delay: Option<Duration>,
    /// Interval between stream reconnect attempts while polling as a fallback.
    pub stream_retry_delay: Option<Duration>,
    /// Flag configurations to serve before the first fetch completes.
    pub bootstrap: HashMap<String, FlagConfig>,
    /// External store the flag configuration cache writes through to.
    pub flag_config_storage: Option<Arc<dyn FlagConfigStorage>>,
    /// Cohort synchronization; disabled when absent.
    pub cohort_sync: Option<CohortSyncConfig>,
}

impl LocalEvaluationConfig {
    /// Default value for [`LocalEvaluationConfig::flag_poll_interval`].
    pub const DEFAULT_FLAG_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`LocalEvaluationConfig::fetch_timeout`].
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default value for [`LocalEvaluationConfig::stream_conn_timeout`].
    pub const DEFAULT_STREAM_CONN_TIMEOUT: Duration = Duration::from_millis(1500);
    /// Default value for [`LocalEvaluationConfig::stream_conn_attempts`].
    pub const DEFAULT_STREAM_CONN_ATTEMPTS: u32 = 2;
    /// Default value for [`LocalEvaluationConfig::stream_conn_retry_delay`].
    pub const DEFAULT_STREAM_CONN_RETRY_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`LocalEvaluationConfig::stream_retry_delay`].
    pub const DEFAULT_STREAM_RETRY_DELAY: Duration = Duration::from_secs(15);

    /// Create a configuration with default settings.
    pub fn new() -> LocalEvaluationConfig {
        LocalEvaluationConfig::default()
    }

    /// Override the flag configuration server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> LocalEvaluationConfig {
        self.server_url = Some(url.into());
        self
    }

    /// Override the stream server URL.
    pub fn with_stream_server_url(mut self, url: impl Into<String>) -> LocalEvaluationConfig {
        self.stream_server_url = Some(url.into());
        self
    }

    /// Enable or disable streaming updates.
    pub fn with_stream_updates(mut self, enabled: bool) -> LocalEvaluationConfig {
        self.stream_updates = enabled;
        self
    }

    /// Override the flag poll interval.
    pub fn with_flag_poll_interval(mut self, interval: Duration) -> LocalEvaluationConfig {
        self.flag_poll_interval = Some(interval);
        self
    }

    /// Serve the given flag configurations before the first fetch completes.
    pub fn with_bootstrap(mut self, flags: HashMap<String, FlagConfig>) -> LocalEvaluationConfig {
        self.bootstrap = flags;
        self
    }

    /// Write flag configurations through to the given external store.
    pub fn with_flag_config_storage(
        mut self,
        storage: Arc<dyn FlagConfigStorage>,
    ) -> LocalEvaluationConfig {
        self.flag_config_storage = Some(storage);
        self
    }

    /// Enable cohort synchronization.
    pub fn with_cohort_sync(mut self, cohort_sync: CohortSyncConfig) -> LocalEvaluationConfig {
        self.cohort_sync = Some(cohort_sync);
        self
    }

    pub(crate) fn server_url(&self) -> &str {
        self.server_url.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }

    pub(crate) fn stream_server_url(&self) -> &str {
        self.stream_server_url
            .as_deref()
            .unwrap_or(DEFAULT_STREAM_SERVER_URL)
    }

    pub(crate) fn flag_poll_interval(&self) -> Duration {
        self.flag_poll_interval
            .unwrap_or(LocalEvaluationConfig::DEFAULT_FLAG_POLL_INTERVAL)
    }

    pub(crate) fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
            .unwrap_or(LocalEvaluationConfig::DEFAULT_FETCH_TIMEOUT)
    }
}

/// Configuration for [`RemoteEvaluationClient`](crate::remote::RemoteEvaluationClient).
#[derive(Debug, Clone)]
pub struct RemoteEvaluationConfig {
    /// Server URL for remote evaluation requests.
    pub server_url: String,
    /// Timeout for a single evaluation request.
    pub fetch_timeout: Duration,
    /// Retry policy for failed evaluation requests.
    pub retry: BackoffPolicy,
}

impl Default for RemoteEvaluationConfig {
    fn default() -> RemoteEvaluationConfig {
        RemoteEvaluationConfig {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            fetch_timeout: RemoteEvaluationConfig::DEFAULT_FETCH_TIMEOUT,
            retry: BackoffPolicy::default(),
        }
    }
}

impl RemoteEvaluationConfig {
    /// Default value for [`RemoteEvaluationConfig::fetch_timeout`].
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a configuration with default settings.
    pub fn new() -> RemoteEvaluationConfig {
        RemoteEvaluationConfig::default()
    }

    /// Override the server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> RemoteEvaluationConfig {
        self.server_url = url.into();
        self
    }
}
