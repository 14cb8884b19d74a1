//! Declarative configuration: fetch descriptors and model specs.
//!
//! Everything here is plain data. Loading from files is left to the caller;
//! the types derive serde so JSON and YAML both work.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A fetch descriptor plus the model applied to what it returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelField {
    pub connector: ConnectorConfig,
    pub model: ModelSpec,
}

/// Named deferred fetch+extract, resolvable from templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceDefinition {
    pub name: String,
    #[serde(flatten)]
    pub field: ModelField,
}

// ── Connectors ──────────────────────────────────────────────────────────────

/// How the response body should be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    #[default]
    Json,
    Xml,
    Html,
    Text,
}

/// Where a document comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub response_type: DocumentKind,
    /// Templated target URL. Unused by static sources.
    #[serde(default)]
    pub url: String,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Http(HttpConfig),
    Browser(BrowserConfig),
    Static(StaticConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_method")]
    pub method: String,
    /// Header names and values are both templated.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Serialized and templated; takes precedence over `body`.
    #[serde(default)]
    pub json_body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserEngine {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

/// Page lifecycle event navigation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
    Commit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub engine: BrowserEngine,
    /// Run the one-shot runtime installation before launching.
    #[serde(default)]
    pub install: bool,
    /// Inject fingerprint-evasion scripts before navigation.
    #[serde(default)]
    pub stealth: bool,
    #[serde(default)]
    pub wait_until: WaitUntil,
    /// Navigation timeout.
    #[serde(default)]
    pub wait_secs: Option<u64>,
    /// Deadline for the whole browser sequence.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Templated script evaluated after navigation.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    pub value: String,
}

// ── Models ──────────────────────────────────────────────────────────────────

/// Declarative shape of the desired output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Scalar(ScalarSpec),
    Object(ObjectSpec),
    Array(ArraySpec),
    FirstOf(FirstOfSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Null,
    Bool,
    #[default]
    String,
    Int,
    Float,
    /// Inner markup of an HTML match.
    Html,
    /// The extracted value as-is, JSON text parsed when possible.
    Raw,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalarSpec {
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// HTML only: read this attribute instead of the text.
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub generated: Option<Generated>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectSpec {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub fields: IndexMap<String, ModelSpec>,
    #[serde(default)]
    pub drop_empty: bool,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySpec {
    #[serde(default)]
    pub path: String,
    pub item: Box<ModelSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirstOfSpec {
    pub candidates: Vec<ModelSpec>,
}

/// Values computed rather than read from the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Generated {
    Static { value: String },
    Formatted { template: String },
    Uuid,
    Calculated { expression: String },
    Reference {
        name: String,
        #[serde(default)]
        path: String,
    },
    Fetch { field: Box<ModelField> },
}

impl ModelSpec {
    /// Scalar read of `path` with the given type.
    pub fn scalar(path: impl Into<String>, field_type: FieldType) -> Self {
        ModelSpec::Scalar(ScalarSpec {
            path: path.into(),
            field_type,
            ..ScalarSpec::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_field_from_json() {
        let raw = r#"{
            "connector": {
                "response_type": "html",
                "url": "https://example.com/{{{id}}}",
                "source": {"kind": "http", "headers": {"Accept": "text/html"}}
            },
            "model": {
                "kind": "object",
                "fields": {
                    "title": {"kind": "scalar", "path": "h1"},
                    "links": {
                        "kind": "array",
                        "path": "a",
                        "limit": 5,
                        "item": {"kind": "scalar", "attribute": "href"}
                    }
                }
            }
        }"#;
        let field: ModelField = serde_json::from_str(raw).unwrap();
        assert_eq!(field.connector.response_type, DocumentKind::Html);
        match &field.connector.source {
            SourceConfig::Http(http) => {
                assert_eq!(http.method, "GET");
                assert_eq!(http.headers.get("Accept").map(String::as_str), Some("text/html"));
            }
            other => panic!("expected http source, got {other:?}"),
        }
        let ModelSpec::Object(obj) = &field.model else {
            panic!("expected object model");
        };
        let keys: Vec<_> = obj.fields.keys().cloned().collect();
        assert_eq!(keys, vec!["title", "links"]);
        assert!(matches!(obj.fields["links"], ModelSpec::Array(ArraySpec { limit: Some(5), .. })));
    }

    #[test]
    fn test_generated_and_reference_definition() {
        let raw = r#"{
            "name": "Token",
            "connector": {"source": {"kind": "static", "value": "{\"token\": \"abc\"}"}},
            "model": {
                "kind": "scalar",
                "path": "token",
                "generated": {"kind": "reference", "name": "Other", "path": "a.b"}
            }
        }"#;
        let def: ReferenceDefinition = serde_json::from_str(raw).unwrap();
        assert_eq!(def.name, "Token");
        assert_eq!(def.field.connector.response_type, DocumentKind::Json);
        let ModelSpec::Scalar(scalar) = &def.field.model else {
            panic!("expected scalar");
        };
        assert_eq!(scalar.field_type, FieldType::String);
        assert!(matches!(
            &scalar.generated,
            Some(Generated::Reference { name, path }) if name == "Other" && path == "a.b"
        ));
    }
}
