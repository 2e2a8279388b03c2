//! Desired (caller-declared, partial) configuration
//!
//! A field the caller did not mention is [`Desired::Unset`] (or simply
//! absent), which is not the same thing as a field set to `false`, `0` or
//! `""`. The reconciler never looks at observed fields behind an unset key.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{LifecycleError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Desired {
    /// No opinion; the observed value is left as-is
    Unset,
    /// A leaf value (string, number, bool, or an explicit null in a sequence)
    Scalar(Value),
    Sequence(Vec<Desired>),
    Mapping(DesiredState),
}

impl Desired {
    pub fn is_unset(&self) -> bool {
        matches!(self, Desired::Unset)
    }

    /// Concrete JSON for this node, `None` when unset.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Desired::Unset => None,
            Desired::Scalar(v) => Some(v.clone()),
            Desired::Sequence(items) => Some(Value::Array(
                items.iter().filter_map(Desired::to_value).collect(),
            )),
            Desired::Mapping(state) => Some(state.to_value()),
        }
    }

    fn from_element(value: &Value) -> Self {
        match value {
            Value::Null => Desired::Scalar(Value::Null),
            other => Desired::from(other.clone()),
        }
    }
}

/// `null` maps to [`Desired::Unset`]; inside sequences it stays a literal null.
impl From<Value> for Desired {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Desired::Unset,
            Value::Array(items) => Desired::Sequence(items.iter().map(Desired::from_element).collect()),
            Value::Object(map) => Desired::Mapping(DesiredState::from_map(map)),
            scalar => Desired::Scalar(scalar),
        }
    }
}

impl From<DesiredState> for Desired {
    fn from(state: DesiredState) -> Self {
        Desired::Mapping(state)
    }
}

/// Nested mapping of desired fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    fields: BTreeMap<String, Desired>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object. `null` members become unset.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_map(map.clone())),
            other => Err(LifecycleError::InvalidDesiredState(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Self {
        Self {
            fields: map
                .into_iter()
                .map(|(key, value)| (key, Desired::from(value)))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Desired>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Desired>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Desired> {
        self.fields.get(key)
    }

    /// Fields that carry an opinion (unset ones are skipped)
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Desired)> {
        self.fields.iter().filter(|(_, d)| !d.is_unset())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// The state as observed JSON, dropping unset fields.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.iter()
                .filter_map(|(key, d)| d.to_value().map(|v| (key.clone(), v)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_is_unset_but_zero_values_are_set() {
        let state = DesiredState::from_json(&json!({
            "enabled": false,
            "name": "",
            "count": 0,
            "owner": null,
        }))
        .unwrap();

        assert_eq!(state.get("enabled"), Some(&Desired::Scalar(json!(false))));
        assert_eq!(state.get("name"), Some(&Desired::Scalar(json!(""))));
        assert_eq!(state.get("count"), Some(&Desired::Scalar(json!(0))));
        assert_eq!(state.get("owner"), Some(&Desired::Unset));
        assert_eq!(state.iter().count(), 3);
        assert_eq!(
            state.to_value(),
            json!({"enabled": false, "name": "", "count": 0})
        );
    }

    #[test]
    fn test_nested_and_sequences() {
        let state = DesiredState::from_json(&json!({
            "audit": {"enabled": true, "retention": null},
            "tags": ["a", null],
        }))
        .unwrap();

        assert_eq!(
            state.to_value(),
            json!({"audit": {"enabled": true}, "tags": ["a", null]})
        );
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            DesiredState::from_json(&json!([1, 2])),
            Err(LifecycleError::InvalidDesiredState(_))
        ));
    }

    #[test]
    fn test_builder() {
        let state = DesiredState::new()
            .with("audit", DesiredState::new().with("enabled", json!(true)))
            .with("retention", Desired::Unset);
        assert_eq!(state.to_value(), json!({"audit": {"enabled": true}}));
        assert!(!state.is_empty());
        assert!(DesiredState::new().with("x", Desired::Unset).is_empty());
    }
}
