//! Cohort model, storage, and synchronization.
//!
//! A cohort is a named, server-computed set of user/group identifiers used as a targeting
//! predicate. Cohorts referenced by flag configurations are downloaded and kept fresh by the
//! sync cycle; [`storage::CohortStorage`] answers membership queries during evaluation.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub mod fetcher;
pub mod storage;

pub use fetcher::{CohortDownload, CohortDownloadApi, CohortFetcher, DirectCohortDownloadApi};
pub use storage::CohortStorage;

/// A server-computed membership set.
///
/// Identity is the cohort id. A cohort is created on first successful download, replaced in place
/// when the server reports a newer `last_modified`, and garbage-collected when no flag
/// configuration references it anymore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    /// Unique cohort id.
    pub cohort_id: String,
    /// Group type the members belong to ([`crate::flag::USER_GROUP_TYPE`] for user cohorts).
    pub group_type: String,
    /// Server-side id of the group type.
    #[serde(default)]
    pub group_type_id: i64,
    /// When the server last computed the membership set, epoch milliseconds.
    #[serde(default)]
    pub last_computed: u64,
    /// When the membership set last changed, epoch milliseconds. Used as a conditional-fetch
    /// hint on refresh.
    #[serde(default)]
    pub last_modified: u64,
    /// Number of members.
    #[serde(default)]
    pub size: usize,
    /// Member identifiers.
    #[serde(default)]
    pub member_ids: HashSet<String>,
}
