//! A thread-safe in-memory store for downloaded cohorts, indexed for membership lookup.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use super::Cohort;
use crate::flag::USER_GROUP_TYPE;

/// Mapping from cohort id to cohort, with membership lookup over a candidate set.
///
/// Lookups take the candidate cohort ids extracted from the active flag configurations, so the
/// cost is proportional to the number of candidates rather than the number of stored cohorts.
#[derive(Default)]
pub struct CohortStorage {
    cohorts: RwLock<HashMap<String, Arc<Cohort>>>,
}

impl CohortStorage {
    /// Create an empty storage.
    pub fn new() -> CohortStorage {
        CohortStorage::default()
    }

    /// Get the cohort stored for `cohort_id`.
    pub fn get_cohort(&self, cohort_id: &str) -> Option<Arc<Cohort>> {
        self.read().get(cohort_id).cloned()
    }

    /// Ids of all stored cohorts.
    pub fn cohort_ids(&self) -> HashSet<String> {
        self.read().keys().cloned().collect()
    }

    /// Insert or replace a cohort.
    pub fn put_cohort(&self, cohort: impl Into<Arc<Cohort>>) {
        let cohort = cohort.into();
        self.write().insert(cohort.cohort_id.clone(), cohort);
    }

    /// Remove the cohort stored for `cohort_id`.
    pub fn delete_cohort(&self, cohort_id: &str) {
        self.write().remove(cohort_id);
    }

    /// Of `candidate_ids`, the cohorts that contain `user_id` as a user-level member.
    pub fn cohorts_for_user(
        &self,
        user_id: &str,
        candidate_ids: &HashSet<String>,
    ) -> HashSet<String> {
        self.cohorts_for_member(USER_GROUP_TYPE, user_id, candidate_ids)
    }

    /// Of `candidate_ids`, the cohorts under `group_type` that contain `group_name` as a member.
    pub fn cohorts_for_group(
        &self,
        group_type: &str,
        group_name: &str,
        candidate_ids: &HashSet<String>,
    ) -> HashSet<String> {
        self.cohorts_for_member(group_type, group_name, candidate_ids)
    }

    fn cohorts_for_member(
        &self,
        group_type: &str,
        member_id: &str,
        candidate_ids: &HashSet<String>,
    ) -> HashSet<String> {
        let cohorts = self.read();
        candidate_ids
            .iter()
            .filter(|id| {
                cohorts
                    .get(*id)
                    .is_some_and(|c| c.group_type == group_type && c.member_ids.contains(member_id))
            })
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Cohort>>> {
        self.cohorts
            .read()
            .expect("thread holding cohort storage lock should not panic")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Cohort>>> {
        self.cohorts
            .write()
            .expect("thread holding cohort storage lock should not panic")
    }
}
