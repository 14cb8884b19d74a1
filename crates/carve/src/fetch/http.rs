//! HTTP source: templated requests through a pluggable transport.

use super::{timeout_from, RawDocument, ResolvedProxy, SourceFetcher};
use crate::config::{DocumentKind, HttpConfig};
use crate::template::Scope;
use crate::types::{CarveError, CarveResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/131.0.0.0 Safari/537.36";

/// A fully expanded request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub proxy: Option<ResolvedProxy>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Executes a single request. Pooling and deadlines are handled by the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> CarveResult<HttpResponse>;
}

/// Default transport over reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> CarveResult<Self> {
        let client = Self::builder()
            .build()
            .map_err(|e| CarveError::Configuration(format!("unable to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
    }

    /// The shared client, or a one-off client routed through `proxy`.
    fn client_for(&self, proxy: Option<&ResolvedProxy>) -> CarveResult<reqwest::Client> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };
        let mut route = reqwest::Proxy::all(proxy.server.as_str())
            .map_err(|e| CarveError::Configuration(format!("invalid proxy '{}': {e}", proxy.server)))?;
        if let Some(username) = &proxy.username {
            route = route.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
        }
        tracing::debug!(server = %proxy.server, username = ?proxy.username, "routing request through proxy");
        Self::builder()
            .proxy(route)
            .build()
            .map_err(|e| CarveError::Configuration(format!("unable to build proxied client: {e}")))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> CarveResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| CarveError::Configuration(format!("invalid HTTP method '{}'", request.method)))?;
        let client = self.client_for(request.proxy.as_ref())?;

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let r = builder.send().await?;
        let status = r.status().as_u16();
        let headers: Vec<(String, String)> = r
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = r.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl SourceFetcher {
    pub(super) async fn fetch_http(
        &self,
        url_template: &str,
        cfg: &HttpConfig,
        kind: DocumentKind,
        scope: &Scope,
    ) -> CarveResult<RawDocument> {
        let url = self.target_url(url_template, scope).await?;
        let host = url::Url::parse(&url)
            .map_err(|e| CarveError::Configuration(format!("invalid URL '{url}': {e}")))?
            .host_str()
            .unwrap_or_default()
            .to_string();

        let method = self.templates.format(&cfg.method, scope).await;
        let mut headers = Vec::with_capacity(cfg.headers.len());
        for (name, value) in &cfg.headers {
            headers.push((
                self.templates.format(name, scope).await,
                self.templates.format(value, scope).await,
            ));
        }
        let body = match (&cfg.json_body, &cfg.body) {
            (Some(json), _) => Some(self.templates.format(&json.to_string(), scope).await),
            (None, Some(body)) => Some(self.templates.format(body, scope).await),
            (None, None) => None,
        };
        let proxy = self.resolve_proxy(cfg.proxy.as_ref(), scope).await;

        let timeout = timeout_from(cfg.timeout_secs);
        let deadline = Instant::now() + timeout;
        let request = HttpRequest {
            method,
            url: url.clone(),
            headers,
            body,
            timeout,
            proxy,
        };

        let _permit = self.governor.acquire_request(&host, deadline).await?;
        tracing::info!(method = %request.method, url = %url, "sending request");

        let response = tokio::time::timeout_at(deadline, self.http.execute(request))
            .await
            .map_err(|_| CarveError::Timeout(format!("{url} did not answer within {timeout:?}")))?
            .map_err(|e| {
                tracing::error!(url = %url, error = %e, "request failed");
                e
            })?;

        if !(200..300).contains(&response.status) {
            tracing::warn!(url = %url, status = response.status, "non-success status, extracting body anyway");
        }
        tracing::debug!(url = %url, status = response.status, bytes = response.body.len(), "response received");

        Ok(RawDocument {
            headers: response.headers,
            body: response.body,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::{ConnectorConfig, ProxyConfig, SourceConfig};
    use crate::governor::GovernorConfig;
    use crate::node::JsonNode;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::Arc;

    fn connector(url: &str, cfg: HttpConfig) -> ConnectorConfig {
        ConnectorConfig {
            response_type: DocumentKind::Json,
            url: url.to_string(),
            source: SourceConfig::Http(cfg),
        }
    }

    fn get() -> HttpConfig {
        HttpConfig {
            method: "GET".into(),
            ..HttpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_url_never_reaches_transport() {
        let transport = RecordingTransport::new("{}");
        let fetcher = fetcher_with(transport.clone(), Arc::new(NoBrowser), GovernorConfig::default());
        let scope = Scope::root(JsonNode::Null, None);

        let err = fetcher
            .fetch(&connector("{{{missing}}}", get()), &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, CarveError::Configuration(_)), "{err:?}");
        assert_eq!(transport.calls(), 0);
        assert_eq!(fetcher.governor().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_fields_are_templated() {
        let transport = RecordingTransport::new(r#"{"ok": true}"#);
        let fetcher = fetcher_with(transport.clone(), Arc::new(NoBrowser), GovernorConfig::default());
        let scope = Scope::root(JsonNode::from(json!({"id": 7, "token": "t0k", "q": "shoes"})), Some(2));

        let mut headers = IndexMap::new();
        headers.insert("X-{{{q}}}".to_string(), "Bearer {{{token}}}".to_string());
        let cfg = HttpConfig {
            method: "post".into(),
            headers,
            body: Some("ignored".into()),
            json_body: Some(json!({"id": "{{{id}}}", "page": "{INDEX}"})),
            timeout_secs: Some(5),
            proxy: Some(ProxyConfig {
                server: "http://proxy.local:{{{id}}}".into(),
                username: Some("user-{{{q}}}".into()),
                password: None,
            }),
        };

        let raw = fetcher
            .fetch(&connector("https://api.example.com/items/{{{id}}}", cfg), &scope)
            .await
            .unwrap();
        assert_eq!(raw.header("Content-Type"), Some("application/json"));

        let requests = transport.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.url, "https://api.example.com/items/7");
        assert_eq!(request.method, "post");
        assert_eq!(request.headers, vec![("X-shoes".to_string(), "Bearer t0k".to_string())]);
        assert_eq!(request.body.as_deref(), Some(r#"{"id":"7","page":"2"}"#));
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert_eq!(
            request.proxy,
            Some(ResolvedProxy {
                server: "http://proxy.local:7".into(),
                username: Some("user-shoes".into()),
                password: None,
            })
        );
    }

    #[tokio::test]
    async fn test_non_success_status_still_returns_body() {
        let transport = Arc::new(RecordingTransport {
            requests: Default::default(),
            status: 404,
            body: r#"{"error": "not found"}"#.into(),
            delay: Duration::ZERO,
        });
        let fetcher = fetcher_with(transport, Arc::new(NoBrowser), GovernorConfig::default());
        let raw = fetcher
            .fetch(&connector("https://api.example.com/x", get()), &Scope::default())
            .await
            .unwrap();
        assert_eq!(raw.body, br#"{"error": "not found"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_slow_transport_times_out() {
        let transport = Arc::new(RecordingTransport {
            requests: Default::default(),
            status: 200,
            body: "{}".into(),
            delay: Duration::from_secs(30),
        });
        let fetcher = fetcher_with(transport, Arc::new(NoBrowser), GovernorConfig::default());
        let cfg = HttpConfig {
            timeout_secs: Some(1),
            ..get()
        };

        let started = std::time::Instant::now();
        let err = fetcher
            .fetch(&connector("https://slow.example.com/", cfg), &Scope::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(fetcher.governor().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let transport = RecordingTransport::new("{}");
        let fetcher = fetcher_with(transport.clone(), Arc::new(NoBrowser), GovernorConfig::default());
        let err = fetcher
            .fetch(&connector("not a url", get()), &Scope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CarveError::Configuration(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let transport = ReqwestTransport::new().unwrap();
        let proxy = ResolvedProxy {
            server: "::not a proxy::".into(),
            ..ResolvedProxy::default()
        };
        assert!(transport.client_for(Some(&proxy)).is_err());
        assert!(transport.client_for(None).is_ok());
    }
}
