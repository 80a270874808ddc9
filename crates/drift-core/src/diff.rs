//! Desired vs observed comparison
//!
//! The diff only ever adds or overwrites keys; keys that exist solely on the
//! target are left alone.

use std::collections::BTreeMap;

use crate::model::{ArtifactRef, ConfigKey, ConfigValue, DesiredState, ObservedState, WritePolicy};

/// Why a key is in the diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Key missing on the target
    Added,
    /// Key present with a different value
    Modified,
}

/// One pending write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Desired value
    pub value: ConfigValue,
    /// Added or modified
    pub kind: ChangeKind,
}

/// Minimal set of settings to push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    changes: BTreeMap<ConfigKey, Change>,
}

impl Diff {
    /// Compute the settings that differ
    ///
    /// `IfAbsent` entries are only included when the key is missing.
    #[must_use]
    pub fn compute(desired: &DesiredState, observed: &ObservedState) -> Self {
        let changes = desired
            .settings()
            .iter()
            .filter_map(|(key, entry)| {
                let kind = match observed.get(key.as_str()) {
                    None => ChangeKind::Added,
                    Some(_) if entry.policy == WritePolicy::IfAbsent => return None,
                    Some(current) if current.same_content(&entry.value) => return None,
                    Some(_) => ChangeKind::Modified,
                };
                Some((
                    key.clone(),
                    Change {
                        value: entry.value.clone(),
                        kind,
                    },
                ))
            })
            .collect();
        Self { changes }
    }

    /// Build a diff from explicit values (all treated as additions)
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (ConfigKey, ConfigValue)>) -> Self {
        let changes = values
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    Change {
                        value,
                        kind: ChangeKind::Added,
                    },
                )
            })
            .collect();
        Self { changes }
    }

    /// Restrict to the given keys
    #[must_use]
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a ConfigKey>) -> Self {
        let changes = keys
            .into_iter()
            .filter_map(|key| self.changes.get(key).map(|c| (key.clone(), c.clone())))
            .collect();
        Self { changes }
    }

    /// Nothing to write
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Value for `key`
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.get(key)
    }

    /// Whether `key` is pending
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// Keys in order
    pub fn keys(&self) -> impl Iterator<Item = &ConfigKey> {
        self.changes.keys()
    }

    /// Keys and changes in order
    pub fn iter(&self) -> impl Iterator<Item = (&ConfigKey, &Change)> {
        self.changes.iter()
    }

    /// Upsert every change into a settings map
    pub fn apply_to(&self, settings: &mut BTreeMap<ConfigKey, ConfigValue>) {
        for (key, change) in &self.changes {
            settings.insert(key.clone(), change.value.clone());
        }
    }
}

/// Pending image change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactChange {
    /// `None` when no image is set
    pub from: Option<ArtifactRef>,
    /// Desired image
    pub to: ArtifactRef,
}

/// Everything a run would write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Settings to write
    pub diff: Diff,
    /// Image change, if any
    pub artifact: Option<ArtifactChange>,
    /// False on a first deploy
    pub target_exists: bool,
}

impl Plan {
    /// Settings diff plus image comparison
    #[must_use]
    pub fn compute(desired: &DesiredState, observed: &ObservedState) -> Self {
        let artifact = match observed.artifact() {
            Some(current) if current == desired.artifact() => None,
            current => Some(ArtifactChange {
                from: current.cloned(),
                to: desired.artifact().clone(),
            }),
        };
        Self {
            diff: Diff::compute(desired, observed),
            artifact,
            target_exists: observed.exists(),
        }
    }

    /// Nothing to write
    #[inline]
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.diff.is_empty() && self.artifact.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DesiredEntry;
    use proptest::prelude::*;

    fn key(k: &str) -> ConfigKey {
        ConfigKey::new(k).unwrap()
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef::new("reg.example.com", "backend", "latest").unwrap()
    }

    fn desired(entries: &[(&str, &str, WritePolicy)]) -> DesiredState {
        let settings = entries
            .iter()
            .map(|(k, v, p)| {
                (
                    key(k),
                    DesiredEntry {
                        value: ConfigValue::plain(*v),
                        policy: *p,
                    },
                )
            })
            .collect();
        DesiredState::new(artifact(), settings)
    }

    fn observed(entries: &[(&str, &str)], artifact: Option<ArtifactRef>) -> ObservedState {
        let settings = entries
            .iter()
            .map(|(k, v)| (key(k), ConfigValue::sensitive(*v)))
            .collect();
        ObservedState::new(settings, artifact)
    }

    #[test]
    fn missing_and_mismatched_keys_are_diffed() {
        let d = desired(&[
            ("A", "1", WritePolicy::Overwrite),
            ("B", "2", WritePolicy::Overwrite),
            ("C", "3", WritePolicy::Overwrite),
        ]);
        let o = observed(&[("A", "1"), ("B", "old")], Some(artifact()));

        let diff = Diff::compute(&d, &o);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff.get("B").unwrap().kind, ChangeKind::Modified);
        assert_eq!(diff.get("C").unwrap().kind, ChangeKind::Added);
        assert!(!diff.contains("A"));
    }

    #[test]
    fn if_absent_keys_only_seed() {
        let d = desired(&[
            ("SECRET_KEY", "fresh", WritePolicy::IfAbsent),
            ("BOT_API_KEY", "fresh", WritePolicy::IfAbsent),
        ]);
        let o = observed(&[("SECRET_KEY", "existing")], None);

        let diff = Diff::compute(&d, &o);
        assert_eq!(diff.keys().map(ConfigKey::as_str).collect::<Vec<_>>(), vec!["BOT_API_KEY"]);
    }

    #[test]
    fn subset_keeps_only_requested_keys() {
        let d = desired(&[
            ("A", "1", WritePolicy::Overwrite),
            ("B", "2", WritePolicy::Overwrite),
        ]);
        let diff = Diff::compute(&d, &ObservedState::missing());
        let only_b = diff.subset([&key("B"), &key("Z")]);
        assert_eq!(only_b.len(), 1);
        assert!(only_b.contains("B"));
    }

    #[test]
    fn plan_detects_artifact_change() {
        let d = desired(&[]);
        let stale = ArtifactRef::new("reg.example.com", "backend", "v1").unwrap();
        let plan = Plan::compute(&d, &observed(&[], Some(stale.clone())));
        assert_eq!(
            plan.artifact,
            Some(ArtifactChange {
                from: Some(stale),
                to: artifact()
            })
        );
        assert!(!plan.is_converged());

        let plan = Plan::compute(&d, &observed(&[], Some(artifact())));
        assert!(plan.is_converged());
    }

    #[test]
    fn missing_target_needs_everything() {
        let d = desired(&[("A", "1", WritePolicy::Overwrite), ("S", "x", WritePolicy::IfAbsent)]);
        let plan = Plan::compute(&d, &ObservedState::missing());
        assert!(!plan.target_exists);
        assert_eq!(plan.diff.len(), d.len());
        assert!(plan.artifact.is_some());
    }

    fn settings_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
        prop::collection::btree_map("[A-Z]{1,3}", "[a-z0-9]{0,4}", 0..8)
    }

    proptest! {
        #[test]
        fn applying_diff_converges_without_deleting(
            want in settings_strategy(),
            have in settings_strategy(),
        ) {
            let d = DesiredState::new(
                artifact(),
                want.iter()
                    .map(|(k, v)| (key(k), DesiredEntry::overwrite(ConfigValue::plain(v.as_str()))))
                    .collect(),
            );
            let mut live: BTreeMap<ConfigKey, ConfigValue> = have
                .iter()
                .map(|(k, v)| (key(k), ConfigValue::plain(v.as_str())))
                .collect();
            let o = ObservedState::new(live.clone(), None);

            let diff = Diff::compute(&d, &o);
            diff.apply_to(&mut live);

            // Every desired key now holds its desired value
            for (k, v) in &want {
                prop_assert_eq!(live.get(k.as_str()).map(ConfigValue::expose), Some(v.as_str()));
            }
            // Keys only on the target survive untouched
            for (k, v) in &have {
                if !want.contains_key(k) {
                    prop_assert_eq!(live.get(k.as_str()).map(ConfigValue::expose), Some(v.as_str()));
                }
            }
            // Re-diffing after apply is empty
            let again = Diff::compute(&d, &ObservedState::new(live, None));
            prop_assert!(again.is_empty());
        }
    }
}
