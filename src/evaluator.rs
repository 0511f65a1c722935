//! Thin wrapper around the injected rule-evaluation engine.
//!
//! The evaluation algorithm itself (bucketing, hashing, rule matching) is an external
//! collaborator supplied through [`EvaluationEngine`]. The wrapper's job is to snapshot the flag
//! cache, resolve the user's cohort memberships from storage, and delegate.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cohort::CohortStorage;
use crate::flag::{self, ExperimentUser, FlagConfig, Variant, USER_GROUP_TYPE};
use crate::flag_store::FlagConfigCache;

/// The rule-evaluation function: given flag configurations and a user, decide the variants.
///
/// Implementations must be pure with respect to the SDK: no reads from the SDK caches, no
/// side effects. Missing data never raises — a user not matching any rule simply receives no
/// variant for that flag.
pub trait EvaluationEngine: Send + Sync {
    fn evaluate(
        &self,
        flags: &[Arc<FlagConfig>],
        user: &ExperimentUser,
    ) -> HashMap<String, Variant>;
}

/// Evaluates users against the currently cached flag configurations.
pub struct Evaluator {
    flag_cache: Arc<FlagConfigCache>,
    cohort_storage: Arc<CohortStorage>,
    engine: Arc<dyn EvaluationEngine>,
}

impl Evaluator {
    pub fn new(
        flag_cache: Arc<FlagConfigCache>,
        cohort_storage: Arc<CohortStorage>,
        engine: Arc<dyn EvaluationEngine>,
    ) -> Evaluator {
        Evaluator {
            flag_cache,
            cohort_storage,
            engine,
        }
    }

    /// Evaluate `user` against the cached flag configurations, optionally restricted to
    /// `flag_keys`. Reads both caches synchronously; never fails — an empty cache or unknown
    /// flag keys produce an empty result.
    pub fn evaluate(
        &self,
        user: &ExperimentUser,
        flag_keys: Option<&[String]>,
    ) -> HashMap<String, Variant> {
        let snapshot = self.flag_cache.snapshot();
        let flags: Vec<Arc<FlagConfig>> = match flag_keys {
            Some(keys) => keys
                .iter()
                .filter_map(|key| snapshot.get(key).cloned())
                .collect(),
            None => snapshot.into_values().collect(),
        };
        let user = self.resolve_cohorts(user, &flags);
        self.engine.evaluate(&flags, &user)
    }

    /// Enrich the user with cohort memberships resolved from storage. Cohorts that were never
    /// downloaded simply resolve to no membership.
    fn resolve_cohorts(&self, user: &ExperimentUser, flags: &[Arc<FlagConfig>]) -> ExperimentUser {
        let candidates = flag::all_cohort_ids_by_group(flags.iter().map(|flag| flag.as_ref()));
        if candidates.is_empty() {
            return user.clone();
        }

        let mut user = user.clone();

        if let (Some(user_id), Some(user_candidates)) =
            (user.user_id.clone(), candidates.get(USER_GROUP_TYPE))
        {
            user.cohort_ids = Some(
                self.cohort_storage
                    .cohorts_for_user(&user_id, user_candidates),
            );
        }

        if let Some(groups) = user.groups.clone() {
            let mut group_cohort_ids: HashMap<String, HashMap<String, HashSet<String>>> =
                HashMap::new();
            for (group_type, group_names) in &groups {
                let Some(group_candidates) = candidates.get(group_type) else {
                    continue;
                };
                for group_name in group_names {
                    let memberships = self.cohort_storage.cohorts_for_group(
                        group_type,
                        group_name,
                        group_candidates,
                    );
                    group_cohort_ids
                        .entry(group_type.clone())
                        .or_default()
                        .insert(group_name.clone(), memberships);
                }
            }
            if !group_cohort_ids.is_empty() {
                user.group_cohort_ids = Some(group_cohort_ids);
            }
        }

        user
    }
}

#[cfg(test)]
pub(crate) mod test_engines {
    use super::*;

    /// Assigns the variant `on` to every flag it is given; records nothing.
    pub(crate) struct OnForEveryFlag;

    impl EvaluationEngine for OnForEveryFlag {
        fn evaluate(
            &self,
            flags: &[Arc<FlagConfig>],
            _user: &ExperimentUser,
        ) -> HashMap<String, Variant> {
            flags
                .iter()
                .map(|flag| {
                    (
                        flag.key.clone(),
                        Variant {
                            key: Some("on".to_owned()),
                            ..Variant::default()
                        },
                    )
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::test_engines::OnForEveryFlag;
    use super::*;
    use crate::cohort::test_cohorts::user_cohort;
    use crate::flag::test_flags::{flag_with_user_cohorts, plain_flag};

    /// Captures the enriched user the engine was called with.
    struct CapturingEngine {
        seen: Mutex<Option<ExperimentUser>>,
    }

    impl EvaluationEngine for CapturingEngine {
        fn evaluate(
            &self,
            _flags: &[Arc<FlagConfig>],
            user: &ExperimentUser,
        ) -> HashMap<String, Variant> {
            *self.seen.lock().unwrap() = Some(user.clone());
            HashMap::new()
        }
    }

    fn seeded_caches() -> (Arc<FlagConfigCache>, Arc<CohortStorage>) {
        let flag_cache = Arc::new(FlagConfigCache::new());
        flag_cache.put(flag_with_user_cohorts("f1", &["c1", "c2"]));
        let cohort_storage = Arc::new(CohortStorage::new());
        cohort_storage.put_cohort(user_cohort("c1", 1, &["u1"]));
        cohort_storage.put_cohort(user_cohort("c2", 1, &["u2"]));
        (flag_cache, cohort_storage)
    }

    #[test]
    fn enriches_user_with_cohort_memberships() {
        let (flag_cache, cohort_storage) = seeded_caches();
        let engine = Arc::new(CapturingEngine {
            seen: Mutex::new(None),
        });
        let evaluator = Evaluator::new(flag_cache, cohort_storage, Arc::clone(&engine) as _);

        evaluator.evaluate(&ExperimentUser::from_user_id("u1"), None);

        let seen = engine.seen.lock().unwrap().clone().unwrap();
        let cohort_ids = seen.cohort_ids.unwrap();
        assert!(cohort_ids.contains("c1"));
        assert!(!cohort_ids.contains("c2"));
    }

    #[test]
    fn missing_cohorts_resolve_to_no_membership() {
        let flag_cache = Arc::new(FlagConfigCache::new());
        flag_cache.put(flag_with_user_cohorts("f1", &["never-downloaded"]));
        let engine = Arc::new(CapturingEngine {
            seen: Mutex::new(None),
        });
        let evaluator = Evaluator::new(
            flag_cache,
            Arc::new(CohortStorage::new()),
            Arc::clone(&engine) as _,
        );

        evaluator.evaluate(&ExperimentUser::from_user_id("u1"), None);

        let seen = engine.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.cohort_ids, Some(HashSet::new()));
    }

    #[test]
    fn empty_cache_evaluates_to_empty_result() {
        let evaluator = Evaluator::new(
            Arc::new(FlagConfigCache::new()),
            Arc::new(CohortStorage::new()),
            Arc::new(OnForEveryFlag),
        );

        let variants = evaluator.evaluate(&ExperimentUser::from_user_id("u1"), None);

        assert!(variants.is_empty());
    }

    #[test]
    fn flag_keys_filter_restricts_evaluation() {
        let flag_cache = Arc::new(FlagConfigCache::new());
        flag_cache.put(plain_flag("f1"));
        flag_cache.put(plain_flag("f2"));
        let evaluator = Evaluator::new(
            flag_cache,
            Arc::new(CohortStorage::new()),
            Arc::new(OnForEveryFlag),
        );

        let variants = evaluator.evaluate(
            &ExperimentUser::from_user_id("u1"),
            Some(&["f2".to_owned(), "unknown".to_owned()]),
        );

        assert_eq!(variants.len(), 1);
        assert!(variants.contains_key("f2"));
    }
}
