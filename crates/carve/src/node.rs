//! The output value tree produced by extraction.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

/// A polymorphic output value. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum JsonNode {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Children in declared order.
    Object(IndexMap<String, JsonNode>),
    Array(Vec<JsonNode>),
}

impl JsonNode {
    /// Build a string node.
    pub fn string(value: impl Into<String>) -> Self {
        JsonNode::String(value.into())
    }

    /// Build an integer node.
    pub fn int(value: i64) -> Self {
        JsonNode::Number(Number::from(value))
    }

    /// Build a float node. NaN and infinities have no JSON form and yield `None`.
    pub fn float(value: f64) -> Option<Self> {
        Number::from_f64(value).map(JsonNode::Number)
    }

    /// Build an object node from ordered pairs.
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, JsonNode)>) -> Self {
        JsonNode::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsonNode::Null)
    }

    /// Null is empty, scalars never are, containers are empty when every child is.
    pub fn is_empty(&self) -> bool {
        match self {
            JsonNode::Null => true,
            JsonNode::Bool(_) | JsonNode::Number(_) | JsonNode::String(_) => false,
            JsonNode::Object(fields) => fields.values().all(JsonNode::is_empty),
            JsonNode::Array(items) => items.iter().all(JsonNode::is_empty),
        }
    }

    /// Native representation, used as the expression environment.
    pub fn raw(&self) -> Value {
        match self {
            JsonNode::Null => Value::Null,
            JsonNode::Bool(b) => Value::Bool(*b),
            JsonNode::Number(n) => Value::Number(n.clone()),
            JsonNode::String(s) => Value::String(s.clone()),
            JsonNode::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.raw()))
                    .collect(),
            ),
            JsonNode::Array(items) => Value::Array(items.iter().map(JsonNode::raw).collect()),
        }
    }

    /// Compact JSON text.
    pub fn to_json(&self) -> String {
        self.raw().to_string()
    }

    /// Text used when the node is substituted into a template: strings are
    /// inserted raw, Null as nothing, everything else as compact JSON.
    pub fn render(&self) -> String {
        match self {
            JsonNode::Null => String::new(),
            JsonNode::String(s) => s.clone(),
            other => other.to_json(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonNode::String(s) => Some(s),
            _ => None,
        }
    }

    /// Walk a dot-separated path of keys and array ordinals.
    ///
    /// An empty path yields the node itself.
    pub fn get_path(&self, path: &str) -> Option<&JsonNode> {
        let mut current = self;
        for segment in path_segments(path) {
            current = match current {
                JsonNode::Object(fields) => fields.get(segment)?,
                JsonNode::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl From<Value> for JsonNode {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsonNode::Null,
            Value::Bool(b) => JsonNode::Bool(b),
            Value::Number(n) => JsonNode::Number(n),
            Value::String(s) => JsonNode::String(s),
            Value::Array(items) => JsonNode::Array(items.into_iter().map(JsonNode::from).collect()),
            Value::Object(fields) => JsonNode::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, JsonNode::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for JsonNode {
    fn from(value: &str) -> Self {
        JsonNode::String(value.to_string())
    }
}

impl From<bool> for JsonNode {
    fn from(value: bool) -> Self {
        JsonNode::Bool(value)
    }
}

impl Serialize for JsonNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(JsonNode::from)
    }
}

impl std::fmt::Display for JsonNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Same walk as [`JsonNode::get_path`], over a borrowed `serde_json::Value`.
pub(crate) fn walk_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path_segments(path) {
        current = match current {
            Value::Object(fields) => fields.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JsonNode {
        JsonNode::object([
            ("name", JsonNode::string("widget")),
            ("price", JsonNode::float(9.5).unwrap()),
            ("tags", JsonNode::Array(vec![JsonNode::string("a"), JsonNode::Null])),
            ("meta", JsonNode::object([("ok", JsonNode::Bool(true))])),
        ])
    }

    #[test]
    fn test_null_and_empty_containers_are_empty() {
        assert!(JsonNode::Null.is_empty());
        assert!(JsonNode::Array(vec![]).is_empty());
        assert!(JsonNode::Object(IndexMap::new()).is_empty());
        assert!(JsonNode::Array(vec![JsonNode::Null, JsonNode::Array(vec![])]).is_empty());
        assert!(JsonNode::object([("a", JsonNode::Null)]).is_empty());
    }

    #[test]
    fn test_scalars_are_never_empty() {
        assert!(!JsonNode::string("").is_empty());
        assert!(!JsonNode::Bool(false).is_empty());
        assert!(!JsonNode::int(0).is_empty());
        assert!(!JsonNode::Array(vec![JsonNode::Null, JsonNode::int(0)]).is_empty());
    }

    #[test]
    fn test_to_json_reparses_to_raw() {
        let node = sample();
        let reparsed: Value = serde_json::from_str(&node.to_json()).unwrap();
        assert_eq!(reparsed, node.raw());

        let quoted = JsonNode::string("say \"hi\"\n");
        let reparsed: Value = serde_json::from_str(&quoted.to_json()).unwrap();
        assert_eq!(reparsed, quoted.raw());
    }

    #[test]
    fn test_object_keeps_declared_order() {
        let node = JsonNode::object([
            ("z", JsonNode::int(1)),
            ("a", JsonNode::int(2)),
            ("m", JsonNode::int(3)),
        ]);
        assert_eq!(node.to_json(), r#"{"z":1,"a":2,"m":3}"#);
    }

    #[test]
    fn test_get_path() {
        let node = sample();
        assert_eq!(node.get_path("name"), Some(&JsonNode::string("widget")));
        assert_eq!(node.get_path("tags.0"), Some(&JsonNode::string("a")));
        assert_eq!(node.get_path("meta.ok"), Some(&JsonNode::Bool(true)));
        assert_eq!(node.get_path(""), Some(&node));
        assert!(node.get_path("tags.9").is_none());
        assert!(node.get_path("name.inner").is_none());
    }

    #[test]
    fn test_render() {
        assert_eq!(JsonNode::string("plain").render(), "plain");
        assert_eq!(JsonNode::Null.render(), "");
        assert_eq!(JsonNode::int(42).render(), "42");
        assert_eq!(
            JsonNode::object([("value", JsonNode::string("kek"))]).render(),
            r#"{"value":"kek"}"#
        );
    }

    #[test]
    fn test_from_value_round_trip() {
        let value = json!({"a": [1, 2.5, "x", null, true], "b": {"c": {}}});
        let node = JsonNode::from(value.clone());
        assert_eq!(node.raw(), value);
        assert_eq!(walk_value(&value, "a.2"), Some(&json!("x")));
    }
}
