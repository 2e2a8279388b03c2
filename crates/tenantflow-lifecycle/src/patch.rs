//! Field paths and patches

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    /// Member of a mapping
    Key(String),
    /// Element of a sequence, matched by the value of its identity field
    Element { key: String, id: String },
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{}", key),
            PathSegment::Element { key, id } => write!(f, "[{}={}]", key, id),
        }
    }
}

/// Location of a leaf or sub-tree inside a state document
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(|k| PathSegment::Key(k.into())).collect())
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    pub fn key(&self, key: &str) -> Self {
        self.child(PathSegment::Key(key.to_string()))
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Whether the path lies under the top-level key `key`.
    pub fn is_under(&self, key: &str) -> bool {
        matches!(self.0.first(), Some(PathSegment::Key(k)) if k == key)
    }

    /// Leading mapping keys, up to the first sequence element.
    fn key_prefix(&self) -> Vec<PathSegment> {
        self.0
            .iter()
            .take_while(|s| matches!(s, PathSegment::Key(_)))
            .cloned()
            .collect()
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 && matches!(segment, PathSegment::Key(_)) {
                write!(f, ".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchEntry {
    pub path: FieldPath,
    pub value: Value,
}

/// Ordered field-level edits that move observed state toward desired state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Patch {
    entries: Vec<PatchEntry>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: FieldPath, value: Value) {
        self.entries.push(PatchEntry { path, value });
    }

    pub fn entries(&self) -> &[PatchEntry] {
        &self.entries
    }

    pub fn paths(&self) -> Vec<FieldPath> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Overlay the patch onto a copy of `observed`.
    ///
    /// Applying the same patch twice gives the same result as applying it once.
    pub fn project(&self, observed: &Value) -> Value {
        let mut projected = observed.clone();
        for entry in &self.entries {
            set_path(&mut projected, entry.path.segments(), &entry.value);
        }
        projected
    }

    /// Partial-update request body carrying only the patched fields.
    ///
    /// Entries inside identity-matched sequence elements send the whole
    /// (projected) sequence, since the remote side replaces sequences.
    pub fn to_body(&self, observed: &Value) -> Value {
        let projected = self.project(observed);
        let mut body = Value::Object(Map::new());
        for entry in &self.entries {
            let prefix = entry.path.key_prefix();
            if prefix.len() == entry.path.segments().len() {
                set_path(&mut body, &prefix, &entry.value);
            } else {
                let value = get_path(&projected, &prefix).cloned().unwrap_or(Value::Null);
                set_path(&mut body, &prefix, &value);
            }
        }
        body
    }

    /// A single-entry patch, used for per-entry updates.
    pub fn single(entry: PatchEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }
}

impl IntoIterator for Patch {
    type Item = PatchEntry;
    type IntoIter = std::vec::IntoIter<PatchEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// String form of an identity value (`"a"` -> `a`, `7` -> `7`).
pub(crate) fn identity_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn find_element(items: &[Value], key: &str, id: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| item.get(key).map(identity_string).as_deref() == Some(id))
}

fn get_path<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value);
    };
    let child = match first {
        PathSegment::Key(key) => value.get(key)?,
        PathSegment::Element { key, id } => {
            let items = value.as_array()?;
            &items[find_element(items, key, id)?]
        }
    };
    get_path(child, rest)
}

/// Write `value` at `segments`, creating containers where needed and
/// replacing anything of the wrong shape.
fn set_path(target: &mut Value, segments: &[PathSegment], value: &Value) {
    let Some((first, rest)) = segments.split_first() else {
        *target = value.clone();
        return;
    };

    match first {
        PathSegment::Key(key) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Some(map) = target.as_object_mut() {
                let child = map.entry(key.clone()).or_insert(Value::Null);
                set_path(child, rest, value);
            }
        }
        PathSegment::Element { key, id } => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            if let Some(items) = target.as_array_mut() {
                match find_element(items, key, id) {
                    Some(index) => set_path(&mut items[index], rest, value),
                    None => {
                        let mut element = if rest.is_empty() {
                            Value::Null
                        } else {
                            let mut seed = Map::new();
                            seed.insert(key.clone(), Value::String(id.clone()));
                            Value::Object(seed)
                        };
                        set_path(&mut element, rest, value);
                        items.push(element);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(key: &str, id: &str) -> PathSegment {
        PathSegment::Element {
            key: key.to_string(),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_path_display() {
        let path = FieldPath::keys(["rules"])
            .child(element("name", "block"))
            .key("enabled");
        assert_eq!(path.to_string(), "rules[name=block].enabled");
        assert_eq!(FieldPath::keys(["audit", "enabled"]).to_string(), "audit.enabled");
    }

    #[test]
    fn test_project_is_idempotent() {
        let observed = json!({"audit": {"enabled": false, "readEnabled": true}, "rules": [{"name": "a", "v": 1}]});
        let mut patch = Patch::new();
        patch.push(FieldPath::keys(["audit", "enabled"]), json!(true));
        patch.push(
            FieldPath::keys(["rules"]).child(element("name", "a")).key("v"),
            json!(2),
        );
        patch.push(
            FieldPath::keys(["rules"]).child(element("name", "b")),
            json!({"name": "b", "v": 3}),
        );

        let once = patch.project(&observed);
        let twice = patch.project(&once);
        assert_eq!(once, twice);
        assert_eq!(
            once,
            json!({
                "audit": {"enabled": true, "readEnabled": true},
                "rules": [{"name": "a", "v": 2}, {"name": "b", "v": 3}]
            })
        );
    }

    #[test]
    fn test_project_replaces_wrong_shape() {
        let mut patch = Patch::new();
        patch.push(FieldPath::keys(["email", "maxBytes"]), json!(10));
        assert_eq!(
            patch.project(&json!({"email": "legacy"})),
            json!({"email": {"maxBytes": 10}})
        );
    }

    #[test]
    fn test_body_carries_only_patched_fields() {
        let observed = json!({
            "audit": {"enabled": false, "readEnabled": true},
            "rules": [{"name": "a", "v": 1}, {"name": "b", "v": 1}],
            "email": {"maxBytes": 100}
        });
        let mut patch = Patch::new();
        patch.push(FieldPath::keys(["audit", "enabled"]), json!(true));
        patch.push(
            FieldPath::keys(["rules"]).child(element("name", "b")).key("v"),
            json!(5),
        );

        assert_eq!(
            patch.to_body(&observed),
            json!({
                "audit": {"enabled": true},
                "rules": [{"name": "a", "v": 1}, {"name": "b", "v": 5}]
            })
        );
    }

    #[test]
    fn test_serialize_paths_as_strings() {
        let mut patch = Patch::new();
        patch.push(FieldPath::keys(["audit", "enabled"]), json!(true));
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"path": "audit.enabled", "value": true}])
        );
    }
}
