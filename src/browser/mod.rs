//! Shared Chromium handle for extraction jobs.
//!
//! One browser process (launched locally or reached over a remote CDP
//! websocket) is shared by all jobs; each job gets its own isolated
//! browser context so cookies and page state never cross jobs. The
//! browser is launched lazily and relaunched if the connection dies.

mod session;

pub use session::DocumentSession;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig as CdpBrowserConfig};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

struct SharedBrowser {
    browser: Browser,
    /// Cleared by the handler task when the CDP connection ends.
    alive: Arc<AtomicBool>,
}

/// Lazily-initialized browser shared across jobs.
pub struct BrowserHandle {
    config: BrowserConfig,
    inner: Mutex<Option<SharedBrowser>>,
}

impl BrowserHandle {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        // Common install locations
        "/opt/google/chrome/google-chrome",
    ];

    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }

    /// Find a Chrome/Chromium executable.
    fn find_chrome() -> Result<std::path::PathBuf> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        info!("Found Chrome in PATH: {}", path);
                        return Ok(std::path::PathBuf::from(path));
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "Chrome/Chromium not found. Please install it:\n\
             - Arch/Manjaro: sudo pacman -S chromium\n\
             - Ubuntu/Debian: sudo apt install chromium-browser\n\
             - Fedora: sudo dnf install chromium\n\
             - Or download from: https://www.google.com/chrome/"
        ))
    }

    async fn launch(&self) -> Result<SharedBrowser> {
        if let Some(remote_url) = self.config.remote_url.clone() {
            return self.connect_remote(&remote_url).await;
        }

        info!("Launching browser (headless={})", self.config.headless);

        let chrome_path = Self::find_chrome()?;
        let mut builder = CdpBrowserConfig::builder().chrome_executable(chrome_path);

        // with_head means NOT headless, confusingly
        if !self.config.headless {
            builder = builder.with_head();
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--metrics-recording-only")
            .arg("--no-sandbox") // Often needed for headless in containers/restricted environments
            .arg("--disable-gpu") // Recommended for headless
            .arg("--disable-software-rasterizer");

        for arg in &self.config.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
            debug!("Browser handler task ended");
        });

        Ok(SharedBrowser { browser, alive })
    }

    /// Connect to a remote Chrome instance.
    async fn connect_remote(&self, url: &str) -> Result<SharedBrowser> {
        info!("Connecting to remote browser at {}", url);

        // Get the WebSocket URL from the /json/version endpoint
        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let client = reqwest::Client::new();
        let resp: serde_json::Value = client
            .get(&version_url)
            .send()
            .await
            .context("Failed to connect to remote browser")?
            .json()
            .await
            .context("Failed to parse browser version info")?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("No webSocketDebuggerUrl in response"))?;

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .context("Failed to connect to remote browser")?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
        });

        Ok(SharedBrowser { browser, alive })
    }

    /// Open an isolated session for one job: a fresh browser context with
    /// a single page, navigated nowhere yet.
    pub async fn open_session(self: Arc<Self>) -> Result<DocumentSession> {
        let mut guard = self.inner.lock().await;

        // Relaunch if the previous connection died.
        let stale = guard
            .as_ref()
            .map(|s| !s.alive.load(Ordering::SeqCst))
            .unwrap_or(true);
        if stale {
            if guard.is_some() {
                warn!("Browser connection lost, relaunching");
            }
            *guard = Some(self.launch().await?);
        }

        let shared = guard.as_ref().context("Browser not initialized")?;

        let context_id = shared
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .context("Failed to create browser context")?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build target params: {}", e))?;

        let page = shared
            .browser
            .new_page(target)
            .await
            .context("Failed to open page")?;

        drop(guard);

        let timeout = std::time::Duration::from_secs(self.config.timeout);
        let session =
            DocumentSession::new(page, context_id, Arc::clone(&self), USER_AGENT, timeout).await?;
        Ok(session)
    }

    /// Dispose a job's browser context. Best effort; the browser may
    /// already be gone.
    pub(crate) async fn dispose_context(
        &self,
        context_id: chromiumoxide::cdp::browser_protocol::browser::BrowserContextId,
    ) {
        let guard = self.inner.lock().await;
        if let Some(shared) = guard.as_ref() {
            let params = DisposeBrowserContextParams::builder()
                .browser_context_id(context_id)
                .build();
            match params {
                Ok(p) => {
                    if let Err(e) = shared.browser.execute(p).await {
                        debug!("Failed to dispose browser context: {}", e);
                    }
                }
                Err(e) => debug!("Failed to build dispose params: {}", e),
            }
        }
    }
}
