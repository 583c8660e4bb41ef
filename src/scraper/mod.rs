//! Extraction pipeline: gate negotiation → page-count discovery →
//! batched asset retrieval → document assembly.
//!
//! The stages run strictly in sequence within a job; concurrency lives
//! inside the fetch stage. The pipeline is a trait so the job manager
//! and server tests can substitute a fake.

pub mod auth;
pub mod fetch;
pub mod pages;

pub use auth::GateSurface;
pub use fetch::{fetch_page_images, AssetSource, PageAsset};
pub use pages::{parse_page_indicator, probe_page_count, PageProbe};

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use crate::assemble::DocumentAssembler;
use crate::browser::{BrowserHandle, DocumentSession};
use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::jobs::{Credentials, JobStatus, ScrapeOutput, ScrapeUpdate};

static DOC_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"docsend\.com/(?:view|v/[a-zA-Z0-9]+)/[a-zA-Z0-9]+").unwrap());

/// Selectors raced on the landing page: a gate form or document content.
const LANDING_SELECTORS: &[&str] = &[
    "input[name='link_auth_form[email]']",
    "input[type='password']",
    ".document-page",
    "[class*='page']",
];

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Validate a submitted URL and normalize it for navigation.
/// Rejection happens here, before any job is created.
pub fn validate_url(raw: &str) -> Result<String, ScrapeError> {
    if !DOC_URL.is_match(raw) {
        return Err(ScrapeError::InvalidUrl(raw.to_string()));
    }
    let mut url = raw.to_string();
    if !url.starts_with("http") {
        url = format!("https://{}", url);
    }
    Ok(url.trim_end_matches('/').to_string())
}

/// Derive a document title from the viewer's page title.
fn clean_title(raw: Option<String>) -> String {
    let title = raw.unwrap_or_default();
    let title = title.strip_suffix(" | DocSend").unwrap_or(&title).trim();
    if title.is_empty() || title == "DocSend" {
        "Document".to_string()
    } else {
        title.to_string()
    }
}

/// PDF filename from a document title, with characters that are
/// illegal in common filesystems replaced.
pub fn safe_filename(title: Option<&str>) -> String {
    let cleaned: String = title
        .unwrap_or("document")
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let stem = cleaned.trim();
    if stem.is_empty() {
        "document.pdf".to_string()
    } else {
        format!("{}.pdf", stem)
    }
}

/// Parse a per-page metadata response into retrieval locations.
fn parse_page_asset(value: &serde_json::Value) -> Option<PageAsset> {
    let image_url = value.get("imageUrl")?.as_str()?.to_string();
    let fallback_url = value
        .get("directImageUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(PageAsset {
        image_url,
        fallback_url,
    })
}

/// Callback receiving pipeline progress while a job runs.
pub type ProgressSink<'a> = &'a (dyn Fn(ScrapeUpdate) + Send + Sync);

/// One end-to-end document extraction.
#[async_trait]
pub trait ExtractionPipeline: Send + Sync {
    async fn run(
        &self,
        url: &str,
        credentials: &Credentials,
        on_progress: ProgressSink<'_>,
    ) -> Result<ScrapeOutput, ScrapeError>;
}

/// Production pipeline driving a real browser session.
pub struct BrowserPipeline {
    browser: Arc<BrowserHandle>,
    http: reqwest::Client,
    assembler: Arc<dyn DocumentAssembler>,
    config: ScrapeConfig,
}

impl BrowserPipeline {
    pub fn new(
        browser: Arc<BrowserHandle>,
        assembler: Arc<dyn DocumentAssembler>,
        config: ScrapeConfig,
    ) -> anyhow::Result<Self> {
        // Image downloads hit signed CDN URLs outside the browser; they
        // only need browser-like headers, not cookies.
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::REFERER,
            reqwest::header::HeaderValue::from_static("https://docsend.com/"),
        );
        let http = reqwest::Client::builder()
            .user_agent(BROWSER_UA)
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            browser,
            http,
            assembler,
            config,
        })
    }

    async fn run_in_session(
        &self,
        session: &DocumentSession,
        url: &str,
        credentials: &Credentials,
        on_progress: ProgressSink<'_>,
    ) -> Result<ScrapeOutput, ScrapeError> {
        session.goto(url).await?;
        session
            .wait_for_any(LANDING_SELECTORS, Duration::from_secs(5))
            .await;

        auth::negotiate_gates(session, credentials, &self.config).await?;

        // The viewer may redirect post-auth; per-page endpoints hang off
        // the final URL, minus any tracking query params.
        let mut base_url = session.current_url().await?;
        if let Ok(mut parsed) = url::Url::parse(&base_url) {
            parsed.set_query(None);
            parsed.set_fragment(None);
            base_url = parsed.to_string();
        }
        base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            base_url = url.to_string();
        }

        let title = clean_title(session.title().await?);

        let body = session.body_text().await.unwrap_or_default();
        let total_pages = match parse_page_indicator(&body) {
            Some(total) => total,
            None => {
                let probe = SessionProbe {
                    session,
                    base_url: &base_url,
                };
                probe_page_count(&probe, self.config.page_cap).await
            }
        };
        if total_pages == 0 {
            return Err(ScrapeError::PageCountUnknown);
        }
        info!("Document '{}' has {} pages", title, total_pages);

        on_progress(ScrapeUpdate {
            status: JobStatus::Scraping,
            current_page: 0,
            total_pages,
            document_title: Some(title.clone()),
        });

        let assets = SessionAssets {
            session,
            http: &self.http,
            base_url: &base_url,
        };
        let batch_title = title.clone();
        let images = fetch_page_images(
            &assets,
            total_pages,
            self.config.image_batch_size,
            |attempted| {
                on_progress(ScrapeUpdate {
                    status: JobStatus::Scraping,
                    current_page: attempted,
                    total_pages,
                    document_title: Some(batch_title.clone()),
                });
            },
        )
        .await?;

        on_progress(ScrapeUpdate {
            status: JobStatus::BuildingPdf,
            current_page: total_pages,
            total_pages,
            document_title: Some(title.clone()),
        });

        let assembler = Arc::clone(&self.assembler);
        let pdf = tokio::task::spawn_blocking(move || assembler.assemble(&images))
            .await
            .map_err(|e| ScrapeError::Assembly(e.to_string()))?
            .map_err(|e| ScrapeError::Assembly(e.to_string()))?;

        Ok(ScrapeOutput {
            pdf,
            document_title: title,
            total_pages,
        })
    }
}

#[async_trait]
impl ExtractionPipeline for BrowserPipeline {
    async fn run(
        &self,
        url: &str,
        credentials: &Credentials,
        on_progress: ProgressSink<'_>,
    ) -> Result<ScrapeOutput, ScrapeError> {
        let url = validate_url(url)?;
        let session = Arc::clone(&self.browser).open_session().await?;

        // The session owns a browser context; close it on every path.
        let result = self
            .run_in_session(&session, &url, credentials, on_progress)
            .await;
        session.close().await;
        result
    }
}

/// The gate negotiator sees a live session through its capability
/// surface only, so tests can drive it with a fake page.
#[async_trait]
impl GateSurface for DocumentSession {
    async fn is_visible(&self, selector: &str) -> bool {
        DocumentSession::is_visible(self, selector).await
    }

    async fn fill(&self, selector: &str, value: &str) -> anyhow::Result<()> {
        DocumentSession::fill(self, selector, value).await
    }

    async fn click(&self, selector: &str) -> anyhow::Result<()> {
        DocumentSession::click(self, selector).await
    }

    async fn wait_until(&self, predicate: &str, timeout: Duration) -> bool {
        DocumentSession::wait_until(self, predicate, timeout).await
    }

    async fn body_text(&self) -> anyhow::Result<String> {
        DocumentSession::body_text(self).await
    }
}

/// Page-existence probe over the per-page data endpoint, with the
/// session's cookies.
struct SessionProbe<'a> {
    session: &'a DocumentSession,
    base_url: &'a str,
}

#[async_trait]
impl PageProbe for SessionProbe<'_> {
    async fn page_exists(&self, index: u32) -> bool {
        self.session
            .fetch_ok(&format!("{}/page_data/{}", self.base_url, index))
            .await
    }
}

/// Asset source: metadata via in-page fetch, images via plain HTTP.
struct SessionAssets<'a> {
    session: &'a DocumentSession,
    http: &'a reqwest::Client,
    base_url: &'a str,
}

#[async_trait]
impl AssetSource for SessionAssets<'_> {
    async fn page_metadata(&self, index: u32) -> Option<PageAsset> {
        let value = self
            .session
            .fetch_json(&format!("{}/page_data/{}", self.base_url, index))
            .await?;
        parse_page_asset(&value)
    }

    async fn fetch_image(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }
        Ok(response.bytes().await?.to_vec())
    }
}
