//! Desired/observed reconciliation
//!
//! `diff` walks the desired state only. Keys the caller did not mention are
//! never inspected, which is what keeps updates partial: a field nobody
//! declared can never end up in a patch.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::trace;

use crate::desired::{Desired, DesiredState};
pub use crate::patch::{FieldPath, Patch, PatchEntry, PathSegment};
use crate::patch::identity_string;

/// Computes minimal patches between desired and observed state
///
/// Sequences are replaced wholesale unless an identity key has been
/// declared for them with [`Reconciler::with_identity`]; their elements are
/// then matched by that key and diffed one by one. A sequence whose
/// identity values are missing or repeated (on either side) is still
/// replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    /// Schema path (mapping keys only) -> identity field of the sequence elements
    identities: BTreeMap<Vec<String>, String>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match elements of the sequence at `path` by their `key` field.
    pub fn with_identity<I, S>(mut self, path: I, key: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identities
            .insert(path.into_iter().map(Into::into).collect(), key.into());
        self
    }

    pub fn diff(&self, desired: &DesiredState, observed: &Value) -> Patch {
        let mut patch = Patch::new();
        let mut walk = Walk {
            identities: &self.identities,
            schema: Vec::new(),
            patch: &mut patch,
        };
        walk.mapping(desired, observed.as_object(), &FieldPath::root());
        trace!("Computed patch with {} entr(ies)", patch.len());
        patch
    }

    /// State expected on the next read once `patch` has been applied.
    pub fn project(&self, observed: &Value, patch: &Patch) -> Value {
        patch.project(observed)
    }
}

struct Walk<'a> {
    identities: &'a BTreeMap<Vec<String>, String>,
    /// Mapping keys from the root to the current node
    schema: Vec<String>,
    patch: &'a mut Patch,
}

impl Walk<'_> {
    fn mapping(&mut self, desired: &DesiredState, observed: Option<&Map<String, Value>>, path: &FieldPath) {
        for (key, node) in desired.iter() {
            self.schema.push(key.clone());
            self.node(node, observed.and_then(|m| m.get(key)), &path.key(key));
            self.schema.pop();
        }
    }

    fn node(&mut self, desired: &Desired, observed: Option<&Value>, path: &FieldPath) {
        match desired {
            Desired::Unset => {}
            Desired::Scalar(value) => {
                if observed != Some(value) {
                    self.patch.push(path.clone(), value.clone());
                }
            }
            Desired::Mapping(state) => match observed {
                Some(Value::Object(map)) => self.mapping(state, Some(map), path),
                // nothing but unset fields
                _ if state.is_empty() => {}
                // type mismatch or missing: replace the whole sub-tree
                _ => self.patch.push(path.clone(), state.to_value()),
            },
            Desired::Sequence(items) => {
                let identity = self.identities.get(&self.schema).cloned();
                match (identity, observed) {
                    (Some(key), Some(Value::Array(current)))
                        if identities_unique(items, current, &key) =>
                    {
                        self.elements(items, current, &key, path)
                    }
                    _ => self.replace_sequence(desired, observed, path),
                }
            }
        }
    }

    fn replace_sequence(&mut self, desired: &Desired, observed: Option<&Value>, path: &FieldPath) {
        let value = desired.to_value().unwrap_or(Value::Null);
        if observed != Some(&value) {
            self.patch.push(path.clone(), value);
        }
    }

    /// Identity-matched elements. Observed elements the caller did not list
    /// are left alone.
    fn elements(&mut self, items: &[Desired], current: &[Value], key: &str, path: &FieldPath) {
        for item in items {
            let Some(id) = identity_of(item, key) else {
                continue;
            };
            let element_path = path.child(PathSegment::Element {
                key: key.to_string(),
                id: id.clone(),
            });
            let existing = current
                .iter()
                .find(|c| c.get(key).map(identity_string).as_deref() == Some(id.as_str()));
            match (item, existing) {
                (Desired::Mapping(state), Some(Value::Object(map))) => {
                    self.mapping(state, Some(map), &element_path)
                }
                _ => {
                    if let Some(value) = item.to_value() {
                        if existing != Some(&value) {
                            self.patch.push(element_path, value);
                        }
                    }
                }
            }
        }
    }
}

/// Every desired element has an identity, and no identity value occurs
/// twice among the desired or the observed elements.
fn identities_unique(items: &[Desired], current: &[Value], key: &str) -> bool {
    let mut desired = BTreeSet::new();
    let desired_unique = items
        .iter()
        .all(|item| identity_of(item, key).is_some_and(|id| desired.insert(id)));

    let mut observed = BTreeSet::new();
    desired_unique
        && current
            .iter()
            .filter_map(|c| c.get(key).map(identity_string))
            .all(|id| observed.insert(id))
}

fn identity_of(item: &Desired, key: &str) -> Option<String> {
    match item {
        Desired::Mapping(state) => match state.get(key) {
            Some(Desired::Scalar(v)) if !v.is_null() => Some(identity_string(v)),
            _ => None,
        },
        _ => None,
    }
}

/// Observed state narrowed to the fields `desired` specifies.
///
/// Fields the remote side does not return are left out.
pub fn restrict(desired: &DesiredState, observed: &Value) -> Value {
    let mut narrowed = Map::new();
    let Some(observed) = observed.as_object() else {
        return Value::Object(narrowed);
    };
    for (key, node) in desired.iter() {
        let Some(current) = observed.get(key) else {
            continue;
        };
        let value = match (node, current) {
            (Desired::Mapping(state), Value::Object(_)) => restrict(state, current),
            _ => current.clone(),
        };
        narrowed.insert(key.clone(), value);
    }
    Value::Object(narrowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desired(value: Value) -> DesiredState {
        DesiredState::from_json(&value).unwrap()
    }

    /// Leaves of `value` as (path, leaf) pairs; sequences count as leaves.
    fn leaves(value: &Value, prefix: Vec<String>, out: &mut Vec<(Vec<String>, Value)>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    let mut p = prefix.clone();
                    p.push(k.clone());
                    leaves(v, p, out);
                }
            }
            other => out.push((prefix, other.clone())),
        }
    }

    fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
        path.iter().try_fold(value, |v, k| v.get(k))
    }

    fn samples() -> Vec<(Value, Value)> {
        vec![
            (
                json!({"audit": {"enabled": true}}),
                json!({"audit": {"enabled": false, "readEnabled": true}, "email": {"maxBytes": 100}}),
            ),
            (
                json!({"name": "", "count": 0, "flag": false}),
                json!({"name": "prod", "count": 3, "flag": true, "other": 1}),
            ),
            (
                json!({"tags": ["a", "b"], "nested": {"deep": {"x": 1, "y": null}}}),
                json!({"tags": ["a"], "nested": {"deep": {"x": 2, "y": 7, "z": 0}}}),
            ),
            (
                json!({"settings": {"limit": 5}}),
                json!({"settings": "not-a-map", "keep": [1, 2]}),
            ),
            (json!({}), json!({"anything": {"at": "all"}})),
        ]
    }

    #[test]
    fn test_partial_update_scenario() {
        let observed = json!({"audit": {"enabled": false, "readEnabled": true}, "email": {"maxBytes": 100}});
        let want = desired(json!({"audit": {"enabled": true}}));
        let reconciler = Reconciler::new();

        let patch = reconciler.diff(&want, &observed);
        assert_eq!(
            patch.entries(),
            &[PatchEntry {
                path: FieldPath::keys(["audit", "enabled"]),
                value: json!(true),
            }]
        );

        let projected = reconciler.project(&observed, &patch);
        assert_eq!(
            projected,
            json!({"audit": {"enabled": true, "readEnabled": true}, "email": {"maxBytes": 100}})
        );
    }

    #[test]
    fn test_diff_against_itself_is_empty() {
        let reconciler = Reconciler::new().with_identity(["rules"], "name");
        for (d, _) in samples() {
            let d = desired(d);
            assert!(reconciler.diff(&d, &d.to_value()).is_empty(), "{d:?}");
        }
        let with_rules = desired(json!({"rules": [{"name": "a", "v": 1}, {"name": "b", "v": null}]}));
        assert!(reconciler.diff(&with_rules, &with_rules.to_value()).is_empty());
    }

    #[test]
    fn test_unmentioned_keys_never_patched() {
        let reconciler = Reconciler::new();
        for (d, o) in samples() {
            let d = desired(d);
            let patch = reconciler.diff(&d, &o);
            for key in o.as_object().unwrap().keys() {
                if d.get(key).is_none_or(Desired::is_unset) {
                    assert!(
                        patch.entries().iter().all(|e| !e.path.is_under(key)),
                        "patch touched unmentioned key {key}: {patch:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_projection_agrees_with_desired_and_observed() {
        let reconciler = Reconciler::new();
        for (d_json, o) in samples() {
            let d = desired(d_json);
            let projected = reconciler.project(&o, &reconciler.diff(&d, &o));

            let mut specified = Vec::new();
            leaves(&d.to_value(), Vec::new(), &mut specified);
            for (path, leaf) in &specified {
                if path.is_empty() {
                    continue;
                }
                assert_eq!(lookup(&projected, path), Some(leaf), "desired leaf {path:?}");
            }

            let mut untouched = Vec::new();
            leaves(&o, Vec::new(), &mut untouched);
            for (path, leaf) in &untouched {
                let covered = specified
                    .iter()
                    .any(|(p, _)| !p.is_empty() && (path.starts_with(p) || p.starts_with(path)));
                if !covered {
                    assert_eq!(lookup(&projected, path), Some(leaf), "observed leaf {path:?}");
                }
            }
        }
    }

    #[test]
    fn test_explicit_false_is_a_difference() {
        let patch = Reconciler::new().diff(&desired(json!({"flag": false})), &json!({"flag": true}));
        assert_eq!(patch.paths(), vec![FieldPath::keys(["flag"])]);

        let patch = Reconciler::new().diff(&desired(json!({"flag": null})), &json!({"flag": true}));
        assert!(patch.is_empty());
    }

    #[test]
    fn test_type_mismatch_replaces_wholesale() {
        let patch = Reconciler::new().diff(
            &desired(json!({"settings": {"limit": 5}})),
            &json!({"settings": 12}),
        );
        assert_eq!(patch.entries()[0].path, FieldPath::keys(["settings"]));
        assert_eq!(patch.entries()[0].value, json!({"limit": 5}));

        let patch = Reconciler::new().diff(
            &desired(json!({"settings": 5})),
            &json!({"settings": {"limit": 5}}),
        );
        assert_eq!(patch.entries()[0].value, json!(5));
    }

    #[test]
    fn test_sequences_replace_whole() {
        let patch = Reconciler::new().diff(
            &desired(json!({"ips": ["10.0.0.1", "10.0.0.2"]})),
            &json!({"ips": ["10.0.0.1"]}),
        );
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.entries()[0].value, json!(["10.0.0.1", "10.0.0.2"]));
    }

    #[test]
    fn test_identity_sequences_diff_per_element() {
        let reconciler = Reconciler::new().with_identity(["rules"], "name");
        let observed = json!({"rules": [
            {"name": "a", "enabled": true, "extra": 1},
            {"name": "b", "enabled": false, "extra": 2},
            {"name": "c", "enabled": false, "extra": 3}
        ]});
        let want = desired(json!({"rules": [
            {"name": "a", "enabled": true},
            {"name": "b", "enabled": true},
            {"name": "d", "enabled": true}
        ]}));

        let patch = reconciler.diff(&want, &observed);
        let paths: Vec<String> = patch.paths().iter().map(ToString::to_string).collect();
        assert_eq!(paths, vec!["rules[name=b].enabled", "rules[name=d]"]);

        let projected = reconciler.project(&observed, &patch);
        assert_eq!(
            projected["rules"],
            json!([
                {"name": "a", "enabled": true, "extra": 1},
                {"name": "b", "enabled": true, "extra": 2},
                {"name": "c", "enabled": false, "extra": 3},
                {"name": "d", "enabled": true}
            ])
        );
    }

    #[test]
    fn test_repeated_identities_fall_back_to_whole_sequence() {
        let reconciler = Reconciler::new().with_identity(["rules"], "name");
        let rules = json!({"rules": [{"name": "a", "v": 1}, {"name": "a", "v": 2}]});
        let want = desired(rules.clone());
        assert!(reconciler.diff(&want, &rules).is_empty());

        let observed = json!({"rules": [{"name": "a", "v": 1}]});
        let patch = reconciler.diff(&want, &observed);
        assert_eq!(patch.paths(), vec![FieldPath::keys(["rules"])]);
        assert_eq!(patch.entries()[0].value, rules["rules"]);

        let want = desired(json!({"rules": [{"name": "a", "v": 1}]}));
        let observed = json!({"rules": [{"name": "a", "v": 1}, {"name": "a", "v": 2}]});
        let patch = reconciler.diff(&want, &observed);
        assert_eq!(patch.paths(), vec![FieldPath::keys(["rules"])]);
    }

    #[test]
    fn test_restrict() {
        let observed = json!({"audit": {"enabled": false, "readEnabled": true}, "email": {"maxBytes": 100}});
        let want = desired(json!({"audit": {"enabled": true}, "missing": 1}));
        assert_eq!(restrict(&want, &observed), json!({"audit": {"enabled": false}}));
    }
}
