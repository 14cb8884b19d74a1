//! Wiring root: one governor, one registry, one extractor per process.

use crate::config::{ModelField, ReferenceDefinition};
use crate::extract::Extractor;
use crate::fetch::{BrowserRuntime, ChromiumRuntime, HttpTransport, ReqwestTransport, SourceFetcher};
use crate::governor::{Governor, GovernorConfig};
use crate::node::JsonNode;
use crate::references::{ReferenceRegistry, ReferenceResolver};
use crate::template::{Scope, TemplateEngine};
use crate::types::{CarveError, CarveResult};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// Owns the shared pools and the reference registry and runs extractions.
pub struct Carver {
    governor: Arc<Governor>,
    references: Arc<ReferenceRegistry>,
    extractor: Extractor,
}

impl Carver {
    /// Build with the reqwest and chromium defaults.
    pub fn new(config: GovernorConfig) -> CarveResult<Self> {
        Ok(Self::with_transports(
            config,
            Arc::new(ReqwestTransport::new()?),
            Arc::new(ChromiumRuntime::new()),
        ))
    }

    pub fn with_transports(
        config: GovernorConfig,
        http: Arc<dyn HttpTransport>,
        browser: Arc<dyn BrowserRuntime>,
    ) -> Self {
        let governor = Arc::new(Governor::new(config));
        let references = Arc::new(ReferenceRegistry::new());
        let templates = TemplateEngine::new(Arc::clone(&references));
        let fetcher = SourceFetcher::new(Arc::clone(&governor), templates.clone(), http, browser);
        Self {
            governor,
            references,
            extractor: Extractor::new(templates, fetcher),
        }
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn references(&self) -> &Arc<ReferenceRegistry> {
        &self.references
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Register the named references. Allowed once, before any template uses them.
    pub fn register_references(
        self: &Arc<Self>,
        definitions: impl IntoIterator<Item = ReferenceDefinition>,
    ) -> CarveResult<()> {
        let resolver = Arc::new(EngineResolver {
            carver: Arc::downgrade(self),
        });
        self.references.register(definitions, resolver)
    }

    /// Fetch `field`'s document with `input` as scope and extract its model.
    pub async fn extract(&self, field: &ModelField, input: JsonNode, index: Option<u32>) -> CarveResult<JsonNode> {
        let scope = Scope::root(input, index);
        self.extractor.run(field, &scope).await
    }
}

/// Resolves references through the extractor of the owning [`Carver`].
///
/// Holds a weak handle: the registry lives inside the carver, so a strong one
/// would keep both alive forever.
struct EngineResolver {
    carver: Weak<Carver>,
}

#[async_trait]
impl ReferenceResolver for EngineResolver {
    async fn resolve(&self, definition: &ReferenceDefinition) -> CarveResult<JsonNode> {
        let carver = self.carver.upgrade().ok_or_else(|| {
            CarveError::resolution(&definition.name, "engine has been dropped")
        })?;
        carver
            .extractor
            .run(&definition.field, &Scope::root(JsonNode::Null, None))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::{NoBrowser, RecordingTransport};
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn carver(transport: Arc<RecordingTransport>) -> Arc<Carver> {
        Arc::new(Carver::with_transports(
            GovernorConfig::default(),
            transport,
            Arc::new(NoBrowser),
        ))
    }

    fn field(raw: serde_json::Value) -> ModelField {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_extract_with_input_and_index() {
        let carver = carver(RecordingTransport::new("{}"));
        let out = carver
            .extract(
                &field(json!({
                    "connector": {"source": {"kind": "static", "value": "{\"page\": {INDEX}, \"q\": \"{{{q}}}\"}"}},
                    "model": {"kind": "object", "fields": {
                        "page": {"kind": "scalar", "path": "page", "type": "int"},
                        "q": {"kind": "scalar", "path": "q"}
                    }}
                })),
                JsonNode::from(json!({"q": "lamps"})),
                Some(4),
            )
            .await
            .unwrap();
        assert_json_eq!(out.raw(), json!({"page": 4, "q": "lamps"}));
    }

    #[tokio::test]
    async fn test_reference_feeds_templates_and_resolves_once() {
        let transport = RecordingTransport::new(r#"{"token": "s3cr3t"}"#);
        let carver = carver(transport.clone());
        let token: ReferenceDefinition = serde_json::from_value(json!({
            "name": "Auth",
            "connector": {"url": "https://auth.example.com/token", "source": {"kind": "http", "method": "POST"}},
            "model": {"kind": "object", "fields": {"token": {"kind": "scalar", "path": "token"}}}
        }))
        .unwrap();
        carver.register_references([token]).unwrap();

        let uses_token = field(json!({
            "connector": {"source": {"kind": "static", "value": "\"Bearer {{{RefName=Auth token}}}\""}},
            "model": {"kind": "scalar"}
        }));
        let runs = (0..10).map(|_| carver.extract(&uses_token, JsonNode::Null, None));
        for result in futures::future::join_all(runs).await {
            assert_eq!(result.unwrap(), JsonNode::string("Bearer s3cr3t"));
        }
        assert_eq!(transport.calls(), 1);
        assert!(carver.references().is_resolved("Auth"));
    }

    #[tokio::test]
    async fn test_default_transports_build() {
        let carver = Carver::new(GovernorConfig::default()).unwrap();
        assert_eq!(carver.governor().in_flight(), 0);
        assert!(carver.references().is_empty());
    }

    #[tokio::test]
    async fn test_registration_is_one_shot() {
        let carver = carver(RecordingTransport::new("{}"));
        carver.register_references([]).unwrap();
        assert!(matches!(
            carver.register_references([]),
            Err(CarveError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_error_reaches_caller() {
        let carver = carver(RecordingTransport::new("{}"));
        let err = carver
            .extract(
                &field(json!({
                    "connector": {"url": "{{{nothing}}}", "source": {"kind": "http"}},
                    "model": {"kind": "scalar"}
                })),
                JsonNode::Null,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CarveError::Configuration(_)));
    }
}
