//! Browser source: render a page in a headless browser and return its markup.
//!
//! The whole sequence (install, acquire, launch, stealth, navigate, script,
//! content) runs in a spawned task. The caller races that task against the
//! connector deadline. When the deadline wins, the caller gets a timeout and
//! the task is told to stop at its next step boundary. A step that is already
//! running is left to finish, except the navigation wait, which stops at once.
//!
//! Navigation returns on commit; [`navigate`] then polls the page until the
//! configured [`WaitUntil`] condition holds.

use super::{timeout_from, ResolvedProxy, SourceFetcher};
use crate::config::{BrowserConfig, BrowserEngine, WaitUntil};
use crate::governor::Governor;
use crate::template::Scope;
use crate::types::{CarveError, CarveResult};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval between readiness probes while waiting on a page.
const READY_POLL: Duration = Duration::from_millis(50);
/// How long the resource count must stay unchanged to count as network idle.
const NETWORK_QUIET: Duration = Duration::from_millis(500);
const READY_STATE: &str = "document.readyState";
const RESOURCE_COUNT: &str = "performance.getEntriesByType('resource').length";

/// How to start a browser.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    pub engine: BrowserEngine,
    pub proxy: Option<ResolvedProxy>,
}

/// A browser engine that can open pages.
#[async_trait]
pub trait BrowserRuntime: Send + Sync {
    /// Make the browser binary available. Called at most once per governor.
    async fn install(&self) -> CarveResult<()>;
    /// Launch a browser and open a blank page in it.
    async fn launch(&self, options: &LaunchOptions) -> CarveResult<Box<dyn BrowserPage>>;
}

/// A single page in a launched browser. Closing it shuts the browser down.
#[async_trait]
pub trait BrowserPage: Send {
    async fn enable_stealth(&mut self) -> CarveResult<()>;
    /// Start navigating to `url`; returns once the new document is committed.
    async fn goto(&mut self, url: &str) -> CarveResult<()>;
    async fn evaluate(&mut self, script: &str) -> CarveResult<serde_json::Value>;
    async fn content(&mut self) -> CarveResult<String>;
    async fn close(self: Box<Self>) -> CarveResult<()>;
}

struct BrowserJob {
    runtime: Arc<dyn BrowserRuntime>,
    governor: Arc<Governor>,
    options: LaunchOptions,
    install: bool,
    stealth: bool,
    url: String,
    wait_until: WaitUntil,
    navigation_timeout: Duration,
    script: Option<String>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl BrowserJob {
    fn checkpoint(&self, step: &str) -> CarveResult<()> {
        if self.cancel.is_cancelled() {
            tracing::debug!(url = %self.url, step, "browser task cancelled");
            return Err(CarveError::Timeout(format!("browser task cancelled before {step}")));
        }
        Ok(())
    }

    async fn run(self) -> CarveResult<String> {
        if self.install {
            self.checkpoint("install")?;
            let runtime = Arc::clone(&self.runtime);
            self.governor
                .install_once(self.deadline, || async move { runtime.install().await })
                .await?;
        }

        self.checkpoint("acquire")?;
        let _slot = self.governor.acquire_browser(self.deadline).await?;

        self.checkpoint("launch")?;
        let mut page = self.runtime.launch(&self.options).await?;
        let rendered = self.drive(page.as_mut()).await;
        if let Err(e) = page.close().await {
            tracing::warn!(url = %self.url, error = %e, "could not close browser");
        }
        rendered
    }

    async fn drive(&self, page: &mut dyn BrowserPage) -> CarveResult<String> {
        if self.stealth {
            self.checkpoint("stealth")?;
            page.enable_stealth().await?;
        }

        self.checkpoint("navigate")?;
        tracing::info!(url = %self.url, wait_until = ?self.wait_until, "navigating");
        tokio::select! {
            navigated = navigate(&mut *page, &self.url, self.wait_until, self.navigation_timeout) => navigated?,
            _ = self.cancel.cancelled() => {
                return Err(CarveError::Timeout("browser task cancelled during navigation".into()));
            }
        }

        if let Some(script) = &self.script {
            self.checkpoint("script")?;
            page.evaluate(script).await?;
        }

        self.checkpoint("content")?;
        page.content().await
    }
}

impl SourceFetcher {
    pub(super) async fn fetch_browser(
        &self,
        url_template: &str,
        cfg: &BrowserConfig,
        scope: &Scope,
    ) -> CarveResult<Vec<u8>> {
        let url = self.target_url(url_template, scope).await?;
        let script = self.templates.format_opt(cfg.script.as_deref(), scope).await;
        let proxy = self.resolve_proxy(cfg.proxy.as_ref(), scope).await;

        let timeout = timeout_from(cfg.timeout_secs);
        let deadline = Instant::now() + timeout;
        let cancel = CancellationToken::new();

        let job = BrowserJob {
            runtime: Arc::clone(&self.browser),
            governor: Arc::clone(&self.governor),
            options: LaunchOptions {
                engine: cfg.engine,
                proxy,
            },
            install: cfg.install,
            stealth: cfg.stealth,
            url: url.clone(),
            wait_until: cfg.wait_until,
            navigation_timeout: timeout_from(cfg.wait_secs),
            script,
            deadline,
            cancel: cancel.clone(),
        };
        let mut task: JoinHandle<CarveResult<String>> = tokio::spawn(job.run());

        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(html)) => Ok(html.into_bytes()),
                Ok(Err(e)) => {
                    tracing::error!(url = %url, error = %e, "browser fetch failed");
                    Err(e)
                }
                Err(e) => Err(CarveError::Transport(format!("browser task aborted: {e}"))),
            },
            _ = tokio::time::sleep_until(deadline) => {
                cancel.cancel();
                tracing::warn!(url = %url, ?timeout, "browser deadline reached, abandoning task");
                Err(CarveError::Timeout(format!("browser fetch of {url} exceeded {timeout:?}")))
            }
        }
    }
}

/// Navigate `page` to `url` and wait for `wait_until`, all within `timeout`.
///
/// `Commit` returns as soon as the document is committed, `DomContentLoaded`
/// and `Load` wait on `document.readyState`, `NetworkIdle` additionally waits
/// until no resource has finished loading for a quiet window.
pub async fn navigate(
    page: &mut dyn BrowserPage,
    url: &str,
    wait_until: WaitUntil,
    timeout: Duration,
) -> CarveResult<()> {
    let settle = async {
        page.goto(url).await?;
        match wait_until {
            WaitUntil::Commit => {}
            WaitUntil::DomContentLoaded => wait_for_ready_state(&mut *page, &["interactive", "complete"]).await,
            WaitUntil::Load => wait_for_ready_state(&mut *page, &["complete"]).await,
            WaitUntil::NetworkIdle => {
                wait_for_ready_state(&mut *page, &["complete"]).await;
                wait_for_network_quiet(&mut *page).await;
            }
        }
        Ok::<_, CarveError>(())
    };
    tokio::time::timeout(timeout, settle).await.map_err(|_| {
        CarveError::Timeout(format!(
            "navigation to {url} did not reach {wait_until:?} within {timeout:?}"
        ))
    })?
}

async fn wait_for_ready_state(page: &mut dyn BrowserPage, accepted: &[&str]) {
    loop {
        match page.evaluate(READY_STATE).await {
            Ok(serde_json::Value::String(state)) if accepted.contains(&state.as_str()) => return,
            Ok(_) => {}
            // The execution context is briefly missing while documents swap.
            Err(e) => tracing::debug!(error = %e, "page not ready for evaluation"),
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

async fn wait_for_network_quiet(page: &mut dyn BrowserPage) {
    let mut last = None;
    let mut quiet_since = Instant::now();
    loop {
        let count = page.evaluate(RESOURCE_COUNT).await.ok().and_then(|v| v.as_u64());
        if count != last {
            last = count;
            quiet_since = Instant::now();
        } else if quiet_since.elapsed() >= NETWORK_QUIET {
            return;
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

// ── Chromium ──

/// Environment variable pointing at a Chromium binary.
pub const CHROMIUM_PATH_ENV: &str = "CARVE_CHROMIUM_PATH";
/// Shell command run by [`ChromiumRuntime::install`] when no binary is found.
pub const INSTALL_CMD_ENV: &str = "CARVE_BROWSER_INSTALL_CMD";

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var(CHROMIUM_PATH_ENV) {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let candidates = [
            home.join(".carve/chromium/chrome-linux64/chrome"),
            home.join(".carve/chromium/chrome"),
        ];
        if let Some(found) = candidates.into_iter().find(|c| c.exists()) {
            return Some(found);
        }
    }

    ["google-chrome", "chromium", "chromium-browser"]
        .into_iter()
        .find_map(|name| which::which(name).ok())
}

/// Default runtime backed by chromiumoxide. Supports the chromium engine only.
#[derive(Debug, Default, Clone)]
pub struct ChromiumRuntime;

impl ChromiumRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserRuntime for ChromiumRuntime {
    async fn install(&self) -> CarveResult<()> {
        if find_chromium().is_some() {
            tracing::info!("chromium already available");
            return Ok(());
        }
        let command = std::env::var(INSTALL_CMD_ENV).map_err(|_| {
            CarveError::Transport(format!(
                "chromium not found; set {CHROMIUM_PATH_ENV} or {INSTALL_CMD_ENV}"
            ))
        })?;

        tracing::info!(%command, "installing browser runtime");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .await
            .map_err(|e| CarveError::Transport(format!("failed to run install command: {e}")))?;
        if !status.success() {
            return Err(CarveError::Transport(format!(
                "install command exited with {status}"
            )));
        }
        Ok(())
    }

    async fn launch(&self, options: &LaunchOptions) -> CarveResult<Box<dyn BrowserPage>> {
        if options.engine != BrowserEngine::Chromium {
            return Err(CarveError::Transport(format!(
                "{:?} is not supported by the chromium runtime",
                options.engine
            )));
        }
        let chrome_path = find_chromium().ok_or_else(|| {
            CarveError::Transport(format!("chromium not found; set {CHROMIUM_PATH_ENV}"))
        })?;

        let mut builder = ChromeConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if let Some(proxy) = &options.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server));
            if proxy.username.is_some() {
                tracing::warn!(server = %proxy.server, "chromium ignores proxy credentials");
            }
        }
        let config = builder
            .build()
            .map_err(|e| CarveError::Transport(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CarveError::Transport(format!("failed to launch chromium: {e}")))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CarveError::Transport(format!("failed to create page: {e}")))?;

        Ok(Box::new(ChromiumPage {
            browser,
            page,
            events,
        }))
    }
}

struct ChromiumPage {
    browser: Browser,
    page: Page,
    events: JoinHandle<()>,
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn enable_stealth(&mut self) -> CarveResult<()> {
        self.page
            .enable_stealth_mode()
            .await
            .map_err(|e| CarveError::Transport(format!("could not inject stealth: {e}")))?;
        Ok(())
    }

    async fn goto(&mut self, url: &str) -> CarveResult<()> {
        // Page.navigate answers once the navigation commits, before load.
        let response = self
            .page
            .execute(NavigateParams::new(url))
            .await
            .map_err(|e| CarveError::Transport(format!("navigation failed: {e}")))?;
        match &response.result.error_text {
            Some(error) => Err(CarveError::Transport(format!("navigation to {url} failed: {error}"))),
            None => Ok(()),
        }
    }

    async fn evaluate(&mut self, script: &str) -> CarveResult<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| CarveError::Transport(format!("script execution failed: {e}")))?;
        Ok(result.into_value().unwrap_or_default())
    }

    async fn content(&mut self) -> CarveResult<String> {
        self.page
            .evaluate("document.documentElement.outerHTML")
            .await
            .map_err(|e| CarveError::Transport(format!("failed to get page content: {e}")))?
            .into_value()
            .map_err(|e| CarveError::Transport(format!("failed to convert page content: {e:?}")))
    }

    async fn close(mut self: Box<Self>) -> CarveResult<()> {
        let _ = self.page.close().await;
        let closed = self.browser.close().await;
        self.events.abort();
        closed
            .map(|_| ())
            .map_err(|e| CarveError::Transport(format!("failed to close browser: {e}")))
    }
}
