//! Flag configuration and evaluation context data model.
//!
//! Flag configurations are treated as mostly-opaque server-defined records: the SDK stores and
//! serves them wholesale, and only inspects targeting conditions as far as needed to discover
//! which cohorts a flag references.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Reserved group type for user-level cohorts.
pub const USER_GROUP_TYPE: &str = "User";

/// Targeting operator that matches a set-valued property against a list of candidate values.
/// Conditions using this operator against a `cohort_ids` selector are cohort memberships.
const OP_SET_CONTAINS_ANY: &str = "set contains any";

/// Terminal selector element identifying a cohort-membership condition.
const COHORT_ID_SELECTOR: &str = "cohort_ids";

/// Server-defined targeting rules and variants for one feature flag.
///
/// Identity is the flag key, unique across the cache. Flags are created and replaced wholesale on
/// each successful fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagConfig {
    /// Unique flag key.
    pub key: String,
    /// Variants that evaluation may assign, keyed by variant key.
    #[serde(default)]
    pub variants: HashMap<String, Variant>,
    /// Targeting segments, evaluated in order.
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Keys of flags this flag depends on (evaluated first by the evaluation engine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    /// Opaque server-side metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// The outcome (value + optional payload) assigned to a user for a flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    /// Variant key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Variant value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Optional payload delivered alongside the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Opaque server-side metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// One targeting segment: a set of condition groups plus the variant to assign on match.
///
/// Bucketing configuration is opaque to this SDK; it is interpreted by the evaluation engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Condition groups. Groups are OR-ed; conditions within a group are AND-ed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Vec<Condition>>>,
    /// Variant assigned when this segment matches (absent when bucketing decides).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Opaque bucketing configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<serde_json::Value>,
    /// Opaque server-side metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// A single targeting condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Property selector path, e.g. `["context", "user", "cohort_ids"]`.
    pub selector: Vec<String>,
    /// Operator name.
    pub op: String,
    /// Candidate values.
    #[serde(default)]
    pub values: Vec<String>,
}

impl FlagConfig {
    /// Cohort ids referenced by this flag's targeting rules, grouped by group type. User-level
    /// cohorts are grouped under [`USER_GROUP_TYPE`].
    pub fn cohort_ids_by_group(&self) -> HashMap<String, HashSet<String>> {
        let mut grouped: HashMap<String, HashSet<String>> = HashMap::new();
        for segment in &self.segments {
            let Some(condition_groups) = &segment.conditions else {
                continue;
            };
            for group in condition_groups {
                for condition in group {
                    let Some(group_type) = cohort_group_type(condition) else {
                        continue;
                    };
                    grouped
                        .entry(group_type.to_owned())
                        .or_default()
                        .extend(condition.values.iter().cloned());
                }
            }
        }
        grouped
    }

    /// All cohort ids referenced by this flag's targeting rules, across group types.
    pub fn cohort_ids(&self) -> HashSet<String> {
        self.cohort_ids_by_group()
            .into_values()
            .flatten()
            .collect()
    }
}

/// Group type of a cohort-membership condition, or `None` if the condition does not reference
/// cohorts.
fn cohort_group_type(condition: &Condition) -> Option<&str> {
    if condition.op != OP_SET_CONTAINS_ANY {
        return None;
    }
    let selector: Vec<&str> = condition.selector.iter().map(String::as_str).collect();
    match selector.as_slice() {
        ["context", "user", COHORT_ID_SELECTOR] => Some(USER_GROUP_TYPE),
        ["context", "groups", group_type, COHORT_ID_SELECTOR] => Some(*group_type),
        _ => None,
    }
}

/// Union of cohort ids referenced by all given flags.
pub fn all_cohort_ids<'a, I>(flags: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a FlagConfig>,
{
    flags.into_iter().flat_map(|flag| flag.cohort_ids()).collect()
}

/// Union of cohort ids referenced by all given flags, grouped by group type.
pub fn all_cohort_ids_by_group<'a, I>(flags: I) -> HashMap<String, HashSet<String>>
where
    I: IntoIterator<Item = &'a FlagConfig>,
{
    let mut grouped: HashMap<String, HashSet<String>> = HashMap::new();
    for flag in flags {
        for (group_type, ids) in flag.cohort_ids_by_group() {
            grouped.entry(group_type).or_default().extend(ids);
        }
    }
    grouped
}

/// The user/context a flag is evaluated for.
///
/// The SDK does not interpret this beyond resolving cohort memberships; it is passed through to
/// the evaluation engine as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentUser {
    /// User id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Group memberships: group type to group names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<HashMap<String, Vec<String>>>,
    /// Free-form user properties, passed through to the evaluation engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_properties: Option<HashMap<String, serde_json::Value>>,
    /// Resolved user-level cohort memberships. Populated by the SDK before evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort_ids: Option<HashSet<String>>,
    /// Resolved group-level cohort memberships: group type to group name to cohort ids.
    /// Populated by the SDK before evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_cohort_ids: Option<HashMap<String, HashMap<String, HashSet<String>>>>,
}

impl ExperimentUser {
    /// Create a user with the given user id.
    pub fn from_user_id(user_id: impl Into<String>) -> ExperimentUser {
        ExperimentUser {
            user_id: Some(user_id.into()),
            ..ExperimentUser::default()
        }
    }

    /// Create a user with the given device id.
    pub fn from_device_id(device_id: impl Into<String>) -> ExperimentUser {
        ExperimentUser {
            device_id: Some(device_id.into()),
            ..ExperimentUser::default()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_format() {
        let json = r#"{
            "key": "checkout-redesign",
            "variants": {
                "on": {"key": "on", "value": true, "payload": {"theme": "dark"}},
                "off": {"key": "off", "value": false}
            },
            "segments": [
                {
                    "conditions": [[
                        {"selector": ["context", "user", "cohort_ids"],
                         "op": "set contains any",
                         "values": ["c1", "c2"]}
                    ]],
                    "variant": "on"
                }
            ],
            "unknownField": 42
        }"#;

        let flag: FlagConfig = serde_json::from_str(json).unwrap();
        assert_eq!(flag.key, "checkout-redesign");
        assert_eq!(flag.variants.len(), 2);
        assert_eq!(flag.segments.len(), 1);
    }

    #[test]
    fn extracts_user_cohorts_under_reserved_group_type() {
        let flag = test_flags::flag_with_user_cohorts("f1", &["c1", "c2"]);

        let grouped = flag.cohort_ids_by_group();
        assert_eq!(grouped.len(), 1);
        let user_cohorts = &grouped[USER_GROUP_TYPE];
        assert!(user_cohorts.contains("c1"));
        assert!(user_cohorts.contains("c2"));
    }

    #[test]
    fn extracts_group_cohorts_under_their_group_type() {
        let json = r#"{
            "key": "f1",
            "segments": [
                {
                    "conditions": [[
                        {"selector": ["context", "groups", "org", "cohort_ids"],
                         "op": "set contains any",
                         "values": ["c3"]}
                    ]]
                }
            ]
        }"#;
        let flag: FlagConfig = serde_json::from_str(json).unwrap();

        let grouped = flag.cohort_ids_by_group();
        assert_eq!(grouped.len(), 1);
        assert!(grouped["org"].contains("c3"));
    }

    #[test]
    fn ignores_non_cohort_conditions() {
        let json = r#"{
            "key": "f1",
            "segments": [
                {
                    "conditions": [[
                        {"selector": ["context", "user", "country"],
                         "op": "is",
                         "values": ["US"]},
                        {"selector": ["context", "user", "cohort_ids"],
                         "op": "is",
                         "values": ["not-a-membership"]}
                    ]]
                }
            ]
        }"#;
        let flag: FlagConfig = serde_json::from_str(json).unwrap();

        assert!(flag.cohort_ids().is_empty());
    }

    #[test]
    fn unions_cohorts_across_flags() {
        let flags = vec![
            test_flags::flag_with_user_cohorts("f1", &["c1"]),
            test_flags::flag_with_user_cohorts("f2", &["c1", "c2"]),
            test_flags::plain_flag("f3"),
        ];

        let ids = all_cohort_ids(&flags);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("c1") && ids.contains("c2"));
    }
}
