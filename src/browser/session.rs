//! Per-job page wrapper around a chromiumoxide [`Page`].
//!
//! Everything a pipeline stage needs from the browser goes through this
//! narrow surface: navigation, visibility checks, form interaction, and
//! cookie-bearing HTTP requests issued from inside the page context
//! (the viewer's per-page endpoints require the session cookies).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::Page;
use tracing::{debug, warn};

use super::BrowserHandle;

pub struct DocumentSession {
    page: Page,
    context_id: BrowserContextId,
    handle: Arc<BrowserHandle>,
    timeout: Duration,
}

impl DocumentSession {
    pub(crate) async fn new(
        page: Page,
        context_id: BrowserContextId,
        handle: Arc<BrowserHandle>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self> {
        // Realistic user agent before any navigation
        page.execute(SetUserAgentOverrideParams::new(user_agent.to_string()))
            .await?;

        Ok(Self {
            page,
            context_id,
            handle,
            timeout,
        })
    }

    /// Navigate and wait for the document to become interactive.
    pub async fn goto(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid URL: {}", e))?;
        self.page.execute(nav_params).await?;

        // document.readyState instead of a fixed sleep
        let ready_script = r#"
            new Promise((resolve) => {
                if (document.readyState === 'complete' || document.readyState === 'interactive') {
                    resolve(document.readyState);
                } else {
                    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                    setTimeout(() => resolve('timeout'), 10000);
                }
            })
        "#;

        match tokio::time::timeout(self.timeout, self.page.evaluate(ready_script.to_string()))
            .await
        {
            Ok(Ok(result)) => {
                let state: String = result.into_value().unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }

        // Small additional delay for late-loading viewer scripts
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(())
    }

    /// URL after redirects (the viewer may redirect post-auth).
    pub async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await?
            .map(|u| u.to_string())
            .unwrap_or_default())
    }

    pub async fn title(&self) -> Result<Option<String>> {
        Ok(self.page.get_title().await?)
    }

    /// Visible text of the whole page.
    pub async fn body_text(&self) -> Result<String> {
        let text: String = self
            .page
            .evaluate("document.body ? document.body.innerText : ''".to_string())
            .await?
            .into_value()
            .unwrap_or_default();
        Ok(text)
    }

    /// Whether a selector matches an element that is actually rendered.
    pub async fn is_visible(&self, selector: &str) -> bool {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                return !!el && el.offsetParent !== null;
            }})()"#,
            sel = js_string(selector),
        );
        match self.page.evaluate(script).await {
            Ok(result) => result.into_value().unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Focus an input and type into it.
    pub async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {}", selector))?;
        element.click().await?.type_str(value).await?;
        Ok(())
    }

    pub async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {}", selector))?;
        element.click().await?;
        Ok(())
    }

    /// Wait until any of the selectors appears, up to `timeout`.
    /// Timing out is not an error; callers treat it as best effort.
    pub async fn wait_for_any(&self, selectors: &[&str], timeout: Duration) {
        let combined = selectors.join(", ");
        let script = format!(
            "!!document.querySelector({sel})",
            sel = js_string(&combined)
        );
        if !self.wait_until(&script, timeout).await {
            debug!("Timed out waiting for any of: {}", combined);
        }
    }

    /// Poll a boolean JS expression until it holds or `timeout` elapses.
    /// Returns whether the condition was observed.
    pub async fn wait_until(&self, predicate: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let holds: bool = match self.page.evaluate(predicate.to_string()).await {
                Ok(result) => result.into_value().unwrap_or(false),
                Err(_) => false,
            };
            if holds {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Issue a GET from inside the page (session cookies included) and
    /// report only whether it succeeded.
    pub async fn fetch_ok(&self, url: &str) -> bool {
        let script = format!(
            r#"
            (async () => {{
                try {{
                    const response = await fetch({url}, {{ credentials: 'include' }});
                    return response.ok;
                }} catch (e) {{
                    return false;
                }}
            }})()
            "#,
            url = js_string(url),
        );
        match self.page.evaluate(script).await {
            Ok(result) => result.into_value().unwrap_or(false),
            Err(e) => {
                debug!("In-page fetch failed for {}: {}", url, e);
                false
            }
        }
    }

    /// Issue a GET from inside the page and parse the body as JSON.
    /// Returns `None` for non-success responses or network errors.
    pub async fn fetch_json(&self, url: &str) -> Option<serde_json::Value> {
        let script = format!(
            r#"
            (async () => {{
                try {{
                    const response = await fetch({url}, {{ credentials: 'include' }});
                    if (!response.ok) return null;
                    return await response.json();
                }} catch (e) {{
                    return null;
                }}
            }})()
            "#,
            url = js_string(url),
        );
        match self.page.evaluate(script).await {
            Ok(result) => {
                let value: serde_json::Value = result.into_value().ok()?;
                if value.is_null() {
                    None
                } else {
                    Some(value)
                }
            }
            Err(e) => {
                debug!("In-page JSON fetch failed for {}: {}", url, e);
                None
            }
        }
    }

    /// Close the page and dispose the job's browser context.
    pub async fn close(self) {
        let _ = self.page.close().await;
        self.handle.dispose_context(self.context_id).await;
    }
}

/// Quote a string as a JavaScript literal.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
