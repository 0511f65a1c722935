//! The assembled local-evaluation client and the named-instance registry.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::cohort::{Cohort, CohortFetcher, CohortStorage, DirectCohortDownloadApi};
use crate::config::LocalEvaluationConfig;
use crate::evaluator::{EvaluationEngine, Evaluator};
use crate::fetcher::{FlagConfigFetcher, FlagConfigFetcherConfig, FlagConfigSource};
use crate::flag::{ExperimentUser, FlagConfig, Variant};
use crate::flag_store::FlagConfigCache;
use crate::poller::{CohortPoller, FlagConfigPoller, PollerConfig};
use crate::streamer::{FlagConfigStreamer, SseStreamApi, SseStreamApiConfig, StreamApi, StreamerConfig};
use crate::updater::FlagConfigUpdater;
use crate::Result;

/// A client that evaluates flags in-process against a locally synchronized rule set.
///
/// `start()` brings the flag configuration cache up to date and keeps it fresh — over the
/// streaming connection with polling as a fallback when streaming is enabled, by polling alone
/// otherwise. `evaluate()` reads the caches synchronously; it never waits on the network.
pub struct LocalEvaluationClient {
    flag_cache: Arc<FlagConfigCache>,
    cohort_storage: Arc<CohortStorage>,
    poller: Arc<FlagConfigPoller>,
    streamer: Option<FlagConfigStreamer>,
    cohort_poller: Option<CohortPoller>,
    evaluator: Evaluator,
}

impl LocalEvaluationClient {
    /// Create a client using the given API key, configuration, and evaluation engine.
    pub fn new(
        api_key: impl Into<String>,
        config: LocalEvaluationConfig,
        engine: Arc<dyn EvaluationEngine>,
    ) -> LocalEvaluationClient {
        let api_key = api_key.into();
        let source: Arc<dyn FlagConfigSource> =
            Arc::new(FlagConfigFetcher::new(FlagConfigFetcherConfig {
                server_url: config.server_url().to_owned(),
                api_key: api_key.clone(),
                timeout: config.fetch_timeout(),
            }));
        let stream_api = config.stream_updates.then(|| {
            Arc::new(SseStreamApi::new(SseStreamApiConfig {
                stream_server_url: config.stream_server_url().to_owned(),
                api_key: api_key.clone(),
            })) as Arc<dyn StreamApi>
        });
        LocalEvaluationClient::with_apis(config, engine, source, stream_api)
    }

    /// Create a client from explicit transports. Useful for tests and for embedding the client
    /// behind custom transports.
    pub fn with_apis(
        config: LocalEvaluationConfig,
        engine: Arc<dyn EvaluationEngine>,
        source: Arc<dyn FlagConfigSource>,
        stream_api: Option<Arc<dyn StreamApi>>,
    ) -> LocalEvaluationClient {
        let flag_cache = Arc::new(match &config.flag_config_storage {
            Some(storage) => FlagConfigCache::with_storage(Arc::clone(storage)),
            None => FlagConfigCache::new(),
        });
        if !config.bootstrap.is_empty() {
            flag_cache.put_all(config.bootstrap.clone());
        }

        let cohort_storage = Arc::new(CohortStorage::new());
        let cohort_fetcher = config.cohort_sync.as_ref().map(|sync| {
            Arc::new(CohortFetcher::new(
                Arc::new(DirectCohortDownloadApi::new(sync.clone())) as _,
            ))
        });

        let updater = Arc::new(FlagConfigUpdater::new(
            Arc::clone(&flag_cache),
            Arc::clone(&cohort_storage),
            cohort_fetcher,
        ));

        let poll_interval = config.flag_poll_interval();
        let poller = Arc::new(FlagConfigPoller::new(
            source,
            Arc::clone(&updater),
            PollerConfig {
                interval: poll_interval,
                // Jitter stays proportional so short intervals don't collapse to zero.
                jitter: PollerConfig::DEFAULT_JITTER.min(poll_interval / 10),
                ..PollerConfig::default()
            },
        ));

        let streamer = stream_api.map(|api| {
            let defaults = StreamerConfig::default();
            FlagConfigStreamer::new(
                api,
                Arc::clone(&updater),
                Arc::clone(&poller),
                StreamerConfig {
                    conn_timeout: config.stream_conn_timeout.unwrap_or(defaults.conn_timeout),
                    conn_attempts: config.stream_conn_attempts.unwrap_or(defaults.conn_attempts),
                    conn_retry_delay: config
                        .stream_conn_retry_delay
                        .unwrap_or(defaults.conn_retry_delay),
                    retry_delay: config.stream_retry_delay.unwrap_or(defaults.retry_delay),
                    keepalive_timeout: defaults.keepalive_timeout,
                },
            )
        });

        let cohort_poller = config
            .cohort_sync
            .as_ref()
            .map(|sync| CohortPoller::new(Arc::clone(&updater), sync.cohort_polling_interval));

        let evaluator = Evaluator::new(
            Arc::clone(&flag_cache),
            Arc::clone(&cohort_storage),
            engine,
        );

        LocalEvaluationClient {
            flag_cache,
            cohort_storage,
            poller,
            streamer,
            cohort_poller,
            evaluator,
        }
    }

    /// Fetch the initial flag configuration and start receiving updates. Returns once the cache
    /// is populated. Idempotent.
    pub async fn start(&self) -> Result<()> {
        match &self.streamer {
            Some(streamer) => streamer.start().await?,
            None => self.poller.start().await?,
        }
        if let Some(cohort_poller) = &self.cohort_poller {
            cohort_poller.start();
        }
        Ok(())
    }

    /// Stop receiving updates. Safe to call from any state, idempotent. The caches retain their
    /// contents and `evaluate()` keeps serving them.
    pub fn stop(&self) {
        if let Some(cohort_poller) = &self.cohort_poller {
            cohort_poller.stop();
        }
        match &self.streamer {
            Some(streamer) => streamer.stop(),
            None => self.poller.stop(),
        }
    }

    /// Force an immediate flag configuration fetch and commit, independent of any timer.
    pub async fn update(&self) -> Result<()> {
        self.poller.update().await
    }

    /// Evaluate `user` against the cached flag configurations, optionally restricted to
    /// `flag_keys`. Never fails; missing flags or cohorts evaluate to no variant.
    pub fn evaluate(
        &self,
        user: &ExperimentUser,
        flag_keys: Option<&[String]>,
    ) -> HashMap<String, Variant> {
        self.evaluator.evaluate(user, flag_keys)
    }

    /// Get the cached flag configuration for `key`.
    pub fn get_flag_config(&self, key: &str) -> Option<Arc<FlagConfig>> {
        self.flag_cache.get(key)
    }

    /// Snapshot of all cached flag configurations.
    pub fn flag_configs(&self) -> HashMap<String, Arc<FlagConfig>> {
        self.flag_cache.snapshot()
    }

    /// Get the stored cohort for `cohort_id`.
    pub fn get_cohort(&self, cohort_id: &str) -> Option<Arc<Cohort>> {
        self.cohort_storage.get_cohort(cohort_id)
    }

    /// When the flag configuration cache last committed a full configuration.
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.flag_cache.updated_at()
    }
}

/// Explicit, application-owned registry of named client instances.
///
/// The application constructs one registry, injects it where clients are needed, and looks
/// instances up by name — there is no implicit module-level state.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<LocalEvaluationClient>>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    /// Get the instance registered under `name`, creating it with `init` when absent.
    pub fn instance<F>(&self, name: &str, init: F) -> Arc<LocalEvaluationClient>
    where
        F: FnOnce() -> LocalEvaluationClient,
    {
        let mut clients = self.lock_clients();
        Arc::clone(
            clients
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(init())),
        )
    }

    /// Get the instance registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<LocalEvaluationClient>> {
        self.lock_clients().get(name).cloned()
    }

    /// Remove and return the instance registered under `name`. The caller is responsible for
    /// stopping it.
    pub fn remove(&self, name: &str) -> Option<Arc<LocalEvaluationClient>> {
        self.lock_clients().remove(name)
    }

    fn lock_clients(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<LocalEvaluationClient>>> {
        self.clients
            .lock()
            .expect("thread holding client registry lock should not panic")
    }
}
