//! Timer-driven periodic flag configuration and cohort updates.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::task::JoinHandle;

use crate::backoff::{retry_with_backoff, BackoffPolicy};
use crate::fetcher::FlagConfigSource;
use crate::updater::FlagConfigUpdater;
use crate::Result;

/// Configuration for [`FlagConfigPoller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval to wait between requests for flag configurations.
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This helps to avoid
    /// multiple server instances synchronizing and producing spiky network load.
    pub jitter: Duration,
    /// Retry policy for the initial fetch performed by `start()`.
    pub backoff: BackoffPolicy,
}

impl PollerConfig {
    /// Default value for [`PollerConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollerConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_INTERVAL,
            jitter: PollerConfig::DEFAULT_JITTER,
            backoff: BackoffPolicy::default(),
        }
    }
}

enum PollerState {
    Stopped,
    /// `start()` is running its awaited initial fetch; the timer task is not armed yet.
    Starting,
    Running(JoinHandle<()>),
}

/// A flag configuration poller.
///
/// `start()` performs the initial fetch under the backoff policy and awaits its completion, then
/// arms a repeating timer that invokes an update on each tick. Tick errors are logged, not
/// thrown — the poller keeps ticking. `start()` while running and `stop()` while stopped are
/// no-ops.
pub struct FlagConfigPoller {
    source: Arc<dyn FlagConfigSource>,
    updater: Arc<FlagConfigUpdater>,
    config: PollerConfig,
    state: Mutex<PollerState>,
}

impl FlagConfigPoller {
    pub fn new(
        source: Arc<dyn FlagConfigSource>,
        updater: Arc<FlagConfigUpdater>,
        config: PollerConfig,
    ) -> FlagConfigPoller {
        FlagConfigPoller {
            source,
            updater,
            config,
            state: Mutex::new(PollerState::Stopped),
        }
    }

    /// Start polling. Returns after the initial fetch and update completed; an initial fetch
    /// that fails all backoff attempts leaves the poller stopped and returns the error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            match *state {
                PollerState::Stopped => *state = PollerState::Starting,
                _ => return Ok(()),
            }
        }

        let initial = retry_with_backoff(&self.config.backoff, || async {
            Self::tick(&self.source, &self.updater).await
        })
        .await;
        if let Err(err) = initial {
            *self.lock_state() = PollerState::Stopped;
            return Err(err);
        }

        let source = Arc::clone(&self.source);
        let updater = Arc::clone(&self.updater);
        let interval = self.config.interval;
        let jitter_bound = self.config.jitter;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(jitter(interval, jitter_bound)).await;
                log::debug!(target: "flagwire", "poll tick: fetching flag configurations");
                if let Err(err) = Self::tick(&source, &updater).await {
                    log::warn!(target: "flagwire", "flag configuration poll failed: {err}");
                }
            }
        });

        let mut state = self.lock_state();
        match *state {
            PollerState::Starting => *state = PollerState::Running(task),
            // stop() was called while the initial fetch was in flight.
            _ => task.abort(),
        }
        Ok(())
    }

    /// Stop polling. An in-flight tick is aborted at its next await point.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), PollerState::Stopped);
        if let PollerState::Running(task) = previous {
            log::debug!(target: "flagwire", "flag configuration poller stopped");
            task.abort();
        }
    }

    /// Force an immediate fetch and update, independent of the timer.
    pub async fn update(&self) -> Result<()> {
        Self::tick(&self.source, &self.updater).await
    }

    async fn tick(source: &Arc<dyn FlagConfigSource>, updater: &Arc<FlagConfigUpdater>) -> Result<()> {
        let flags = source.fetch().await?;
        updater.update(flags).await
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PollerState> {
        self.state
            .lock()
            .expect("thread holding poller state lock should not panic")
    }
}

/// A cohort refresh poller.
///
/// Between flag update cycles, cohort membership can change server-side without any flag
/// configuration changing. This poller periodically refreshes all stored cohorts.
pub struct CohortPoller {
    updater: Arc<FlagConfigUpdater>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CohortPoller {
    pub fn new(updater: Arc<FlagConfigUpdater>, interval: Duration) -> CohortPoller {
        CohortPoller {
            updater,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start the refresh timer. No-op when already running. Must be called within a tokio
    /// runtime.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }
        let updater = Arc::clone(&self.updater);
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                log::debug!(target: "flagwire", "cohort poll tick: refreshing cohorts");
                if let Err(err) = updater.refresh_cohorts().await {
                    log::warn!(target: "flagwire", "cohort refresh failed: {err}");
                }
            }
        }));
    }

    /// Stop the refresh timer. No-op when stopped.
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .expect("thread holding cohort poller lock should not panic")
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
