//! Document acquisition: HTTP, headless browser, or a static value.
//!
//! Every source goes through [`SourceFetcher::fetch`], which expands the
//! connector's templates against the caller's scope and returns the raw body.
//! Pool permits are taken from the shared [`Governor`].

pub mod browser;
pub mod http;

pub use browser::{navigate, BrowserPage, BrowserRuntime, ChromiumRuntime, LaunchOptions};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

use crate::config::{ConnectorConfig, DocumentKind, ProxyConfig, SourceConfig, StaticConfig};
use crate::document::Document;
use crate::governor::Governor;
use crate::template::{Scope, TemplateEngine};
use crate::types::{CarveError, CarveResult};
use std::sync::Arc;
use std::time::Duration;

/// Deadline applied when a connector does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Unparsed fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub kind: DocumentKind,
}

impl RawDocument {
    pub fn parse(&self) -> CarveResult<Document> {
        Document::parse(self.kind, &self.body)
    }

    /// First header with this name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Proxy settings after template expansion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedProxy {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Fetches documents for connectors. Cheap to clone.
#[derive(Clone)]
pub struct SourceFetcher {
    governor: Arc<Governor>,
    templates: TemplateEngine,
    http: Arc<dyn HttpTransport>,
    browser: Arc<dyn BrowserRuntime>,
}

impl SourceFetcher {
    pub fn new(
        governor: Arc<Governor>,
        templates: TemplateEngine,
        http: Arc<dyn HttpTransport>,
        browser: Arc<dyn BrowserRuntime>,
    ) -> Self {
        Self {
            governor,
            templates,
            http,
            browser,
        }
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub async fn fetch(&self, connector: &ConnectorConfig, scope: &Scope) -> CarveResult<RawDocument> {
        let kind = connector.response_type;
        let body = match &connector.source {
            SourceConfig::Http(cfg) => return self.fetch_http(&connector.url, cfg, kind, scope).await,
            SourceConfig::Browser(cfg) => self.fetch_browser(&connector.url, cfg, scope).await?,
            SourceConfig::Static(cfg) => self.fetch_static(cfg, scope).await,
        };
        Ok(RawDocument {
            headers: Vec::new(),
            body,
            kind,
        })
    }

    async fn fetch_static(&self, cfg: &StaticConfig, scope: &Scope) -> Vec<u8> {
        self.templates.format(&cfg.value, scope).await.into_bytes()
    }

    /// Expand the connector URL, rejecting an empty result.
    async fn target_url(&self, template: &str, scope: &Scope) -> CarveResult<String> {
        let url = self.templates.format(template, scope).await;
        if url.trim().is_empty() {
            return Err(CarveError::Configuration(format!(
                "connector URL '{template}' expanded to an empty string"
            )));
        }
        Ok(url)
    }

    async fn resolve_proxy(&self, proxy: Option<&ProxyConfig>, scope: &Scope) -> Option<ResolvedProxy> {
        let proxy = proxy?;
        let nonempty = |s: String| if s.is_empty() { None } else { Some(s) };
        Some(ResolvedProxy {
            server: self.templates.format(&proxy.server, scope).await,
            username: nonempty(self.templates.format_opt(proxy.username.as_deref(), scope).await.unwrap_or_default()),
            password: nonempty(self.templates.format_opt(proxy.password.as_deref(), scope).await.unwrap_or_default()),
        })
    }
}

fn timeout_from(secs: Option<u64>) -> Duration {
    secs.filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transports shared by the fetch and extraction tests.

    use super::*;
    use crate::config::BrowserEngine;
    use crate::governor::GovernorConfig;
    use crate::references::ReferenceRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records requests and answers with a fixed body.
    pub struct RecordingTransport {
        pub requests: Mutex<Vec<HttpRequest>>,
        pub status: u16,
        pub body: String,
        pub delay: Duration,
    }

    impl RecordingTransport {
        pub fn new(body: &str) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                status: 200,
                body: body.to_string(),
                delay: Duration::ZERO,
            })
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn execute(&self, request: HttpRequest) -> CarveResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            Ok(HttpResponse {
                status: self.status,
                headers: vec![("content-type".into(), "application/json".into())],
                body: self.body.clone().into_bytes(),
            })
        }
    }

    /// Browser runtime that never launches anything.
    pub struct NoBrowser;

    #[async_trait]
    impl BrowserRuntime for NoBrowser {
        async fn install(&self) -> CarveResult<()> {
            Ok(())
        }

        async fn launch(&self, _options: &LaunchOptions) -> CarveResult<Box<dyn BrowserPage>> {
            Err(CarveError::Transport("no browser in tests".into()))
        }
    }

    pub fn fetcher_with(
        http: Arc<dyn HttpTransport>,
        browser: Arc<dyn BrowserRuntime>,
        config: GovernorConfig,
    ) -> SourceFetcher {
        SourceFetcher::new(
            Arc::new(Governor::new(config)),
            TemplateEngine::new(Arc::new(ReferenceRegistry::new())),
            http,
            browser,
        )
    }

    pub fn launch_options() -> LaunchOptions {
        LaunchOptions {
            engine: BrowserEngine::Chromium,
            proxy: None,
        }
    }
}
