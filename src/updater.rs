//! Committing freshly fetched flag configurations together with the cohorts they reference.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::cohort::{CohortFetcher, CohortStorage};
use crate::executor::BoundedExecutor;
use crate::flag::{self, FlagConfig};
use crate::flag_store::FlagConfigCache;
use crate::Result;

/// Maximum number of concurrent cohort downloads per update cycle.
const COHORT_DOWNLOAD_CONCURRENCY: usize = 4;

/// Callback invoked with the committed flag map when an update changed it.
pub type OnFlagConfigsChange = Arc<dyn Fn(&HashMap<String, Arc<FlagConfig>>) + Send + Sync>;

/// Commits flag configuration sets to the flag cache, keeping cohort storage consistent.
///
/// Per cycle: cohorts referenced for the first time are downloaded before the flags are
/// committed; already-known cohorts are refreshed afterwards using their stored `last_modified`
/// hint; cohorts no longer referenced by the new flag set are garbage-collected. A first-time
/// download failure is logged and the depending flags are admitted anyway — evaluation-time
/// defaults decide the outcome for missing cohort data. A refresh failure never blocks the
/// cycle; stale cohort data continues to serve.
///
/// `update` is serialized internally, so overlapping poll-driven and stream-driven commits
/// cannot interleave.
pub struct FlagConfigUpdater {
    flag_cache: Arc<FlagConfigCache>,
    cohort_storage: Arc<CohortStorage>,
    cohort_fetcher: Option<Arc<CohortFetcher>>,
    executor: BoundedExecutor,
    commit_lock: Mutex<()>,
    on_change: Option<OnFlagConfigsChange>,
}

impl FlagConfigUpdater {
    pub fn new(
        flag_cache: Arc<FlagConfigCache>,
        cohort_storage: Arc<CohortStorage>,
        cohort_fetcher: Option<Arc<CohortFetcher>>,
    ) -> FlagConfigUpdater {
        FlagConfigUpdater {
            flag_cache,
            cohort_storage,
            cohort_fetcher,
            executor: BoundedExecutor::new(COHORT_DOWNLOAD_CONCURRENCY),
            commit_lock: Mutex::new(()),
            on_change: None,
        }
    }

    /// Invoke `on_change` with the committed flag map whenever an update changes it.
    pub fn with_on_change(mut self, on_change: OnFlagConfigsChange) -> FlagConfigUpdater {
        self.on_change = Some(on_change);
        self
    }

    /// Commit a freshly fetched flag configuration set.
    pub async fn update(&self, incoming: HashMap<String, FlagConfig>) -> Result<()> {
        let _commit = self.commit_lock.lock().await;

        let needed = flag::all_cohort_ids(incoming.values());

        match &self.cohort_fetcher {
            Some(fetcher) => {
                let known = self.cohort_storage.cohort_ids();

                // First-seen cohorts block the flag commit; a failure is logged and the flags
                // are admitted without the cohort data.
                let first_seen: Vec<(String, Option<u64>)> = needed
                    .difference(&known)
                    .map(|id| (id.clone(), None))
                    .collect();
                self.download_cohorts(fetcher, first_seen).await;

                self.commit_flags(incoming);

                // Already-known cohorts refresh best-effort; stale data continues to serve.
                let refresh: Vec<(String, Option<u64>)> = needed
                    .intersection(&known)
                    .filter_map(|id| {
                        self.cohort_storage
                            .get_cohort(id)
                            .map(|cohort| (id.clone(), Some(cohort.last_modified)))
                    })
                    .collect();
                self.download_cohorts(fetcher, refresh).await;

                self.collect_unused_cohorts(&needed);
            }
            None => {
                self.commit_flags(incoming);
            }
        }

        Ok(())
    }

    /// Refresh every stored cohort using its stored `last_modified` hint. Used by the cohort
    /// poll timer between flag update cycles.
    pub async fn refresh_cohorts(&self) -> Result<()> {
        let Some(fetcher) = &self.cohort_fetcher else {
            return Ok(());
        };
        let _commit = self.commit_lock.lock().await;

        let targets: Vec<(String, Option<u64>)> = self
            .cohort_storage
            .cohort_ids()
            .into_iter()
            .filter_map(|id| {
                self.cohort_storage
                    .get_cohort(&id)
                    .map(|cohort| (id, Some(cohort.last_modified)))
            })
            .collect();
        self.download_cohorts(fetcher, targets).await;

        Ok(())
    }

    fn commit_flags(&self, incoming: HashMap<String, FlagConfig>) {
        let changed = self.flag_cache.replace_all(incoming);
        if changed {
            log::debug!(target: "flagwire", "flag configurations changed");
            if let Some(on_change) = &self.on_change {
                on_change(&self.flag_cache.snapshot());
            }
        }
    }

    /// Download the given cohorts with bounded concurrency and store the results. Failures are
    /// logged, never propagated; the update cycle degrades rather than aborts.
    async fn download_cohorts(
        &self,
        fetcher: &Arc<CohortFetcher>,
        requests: Vec<(String, Option<u64>)>,
    ) {
        let downloads = requests.into_iter().map(|(cohort_id, last_modified)| {
            let fetcher = Arc::clone(fetcher);
            self.executor.run(async move {
                let result = fetcher.fetch(&cohort_id, last_modified).await;
                (cohort_id, result)
            })
        });

        for (cohort_id, result) in join_all(downloads).await {
            match result {
                Ok(Some(cohort)) => self.cohort_storage.put_cohort(cohort),
                Ok(None) => {}
                Err(err) => {
                    log::warn!(
                        target: "flagwire",
                        "cohort {cohort_id} download failed, continuing without fresh data: {err}",
                    );
                }
            }
        }
    }

    /// Remove cohorts no longer referenced by the committed flag set. A cohort still referenced
    /// is never evicted.
    fn collect_unused_cohorts(&self, needed: &HashSet<String>) {
        for cohort_id in self.cohort_storage.cohort_ids().difference(needed) {
            log::debug!(target: "flagwire", "removing unreferenced cohort {cohort_id}");
            self.cohort_storage.delete_cohort(cohort_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cohort::test_cohorts::user_cohort;
    use crate::cohort::{CohortDownload, CohortDownloadApi};
    use crate::flag::test_flags::{flag_with_user_cohorts, plain_flag};
    use crate::Error;

    type Script = Box<dyn Fn(&str, Option<u64>) -> Result<CohortDownload> + Send + Sync>;

    struct ScriptedApi {
        script: Script,
    }

    #[async_trait]
    impl CohortDownloadApi for ScriptedApi {
        async fn get_cohort(
            &self,
            cohort_id: &str,
            last_modified: Option<u64>,
        ) -> Result<CohortDownload> {
            (self.script)(cohort_id, last_modified)
        }
    }

    struct Fixture {
        flag_cache: Arc<FlagConfigCache>,
        cohort_storage: Arc<CohortStorage>,
        updater: FlagConfigUpdater,
    }

    fn fixture(script: Script) -> Fixture {
        let flag_cache = Arc::new(FlagConfigCache::new());
        let cohort_storage = Arc::new(CohortStorage::new());
        let fetcher = Arc::new(CohortFetcher::new(Arc::new(ScriptedApi { script }) as _));
        let updater = FlagConfigUpdater::new(
            Arc::clone(&flag_cache),
            Arc::clone(&cohort_storage),
            Some(fetcher),
        );
        Fixture {
            flag_cache,
            cohort_storage,
            updater,
        }
    }

    fn flags(configs: Vec<FlagConfig>) -> HashMap<String, FlagConfig> {
        configs
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect()
    }

    #[tokio::test]
    async fn failed_first_download_still_admits_flags_and_keeps_stale_cohorts() {
        let fix = fixture(Box::new(|cohort_id, _| match cohort_id {
            // A is new and permanently failing; B refreshes to "no change".
            "a" => Err(Error::RequestFailed { status: 404 }),
            _ => Ok(CohortDownload::NoChange),
        }));
        fix.cohort_storage.put_cohort(user_cohort("b", 5, &["u1"]));

        fix.updater
            .update(flags(vec![
                flag_with_user_cohorts("f1", &["a", "b"]),
                plain_flag("f2"),
            ]))
            .await
            .unwrap();

        assert!(fix.flag_cache.get("f1").is_some());
        assert!(fix.flag_cache.get("f2").is_some());
        assert!(fix.cohort_storage.get_cohort("a").is_none());
        // B's stale data is retained unchanged.
        assert_eq!(fix.cohort_storage.get_cohort("b").unwrap().last_modified, 5);
    }

    #[tokio::test]
    async fn downloads_first_seen_cohorts_before_commit() {
        let fix = fixture(Box::new(|cohort_id, last_modified| {
            assert_eq!(last_modified, None);
            Ok(CohortDownload::Cohort(user_cohort(cohort_id, 1, &["u1"])))
        }));

        fix.updater
            .update(flags(vec![flag_with_user_cohorts("f1", &["a"])]))
            .await
            .unwrap();

        assert!(fix.cohort_storage.get_cohort("a").is_some());
    }

    #[tokio::test]
    async fn refreshes_known_cohorts_with_last_modified_hint() {
        let hints = Arc::new(StdMutex::new(Vec::new()));
        let recorded = Arc::clone(&hints);
        let fix = fixture(Box::new(move |cohort_id, last_modified| {
            recorded.lock().unwrap().push(last_modified);
            Ok(CohortDownload::Cohort(user_cohort(
                cohort_id,
                last_modified.unwrap_or(0) + 1,
                &["u1", "u2"],
            )))
        }));
        fix.cohort_storage.put_cohort(user_cohort("a", 7, &["u1"]));

        fix.updater
            .update(flags(vec![flag_with_user_cohorts("f1", &["a"])]))
            .await
            .unwrap();

        assert_eq!(*hints.lock().unwrap(), vec![Some(7)]);
        assert_eq!(fix.cohort_storage.get_cohort("a").unwrap().last_modified, 8);
    }

    #[tokio::test]
    async fn garbage_collects_unreferenced_cohorts() {
        let fix = fixture(Box::new(|cohort_id, _| {
            Ok(CohortDownload::Cohort(user_cohort(cohort_id, 1, &["u1"])))
        }));

        fix.updater
            .update(flags(vec![
                flag_with_user_cohorts("f1", &["a"]),
                flag_with_user_cohorts("f2", &["b"]),
            ]))
            .await
            .unwrap();
        assert!(fix.cohort_storage.get_cohort("a").is_some());

        // f1 is gone; its cohort is collected, f2's is retained.
        fix.updater
            .update(flags(vec![flag_with_user_cohorts("f2", &["b"])]))
            .await
            .unwrap();

        assert!(fix.cohort_storage.get_cohort("a").is_none());
        assert!(fix.cohort_storage.get_cohort("b").is_some());
    }

    #[tokio::test]
    async fn on_change_fires_only_when_flags_differ() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let flag_cache = Arc::new(FlagConfigCache::new());
        let updater = FlagConfigUpdater::new(
            Arc::clone(&flag_cache),
            Arc::new(CohortStorage::new()),
            None,
        )
        .with_on_change(Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        updater.update(flags(vec![plain_flag("f1")])).await.unwrap();
        updater.update(flags(vec![plain_flag("f1")])).await.unwrap();
        updater.update(flags(vec![plain_flag("f2")])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_cohorts_updates_all_stored_cohorts() {
        let fix = fixture(Box::new(|cohort_id, last_modified| match last_modified {
            Some(t) => Ok(CohortDownload::Cohort(user_cohort(
                cohort_id,
                t + 1,
                &["u1"],
            ))),
            None => Ok(CohortDownload::Cohort(user_cohort(cohort_id, 1, &["u1"]))),
        }));
        fix.cohort_storage.put_cohort(user_cohort("a", 1, &["u1"]));
        fix.cohort_storage.put_cohort(user_cohort("b", 4, &["u2"]));

        fix.updater.refresh_cohorts().await.unwrap();

        assert_eq!(fix.cohort_storage.get_cohort("a").unwrap().last_modified, 2);
        assert_eq!(fix.cohort_storage.get_cohort("b").unwrap().last_modified, 5);
    }
}
