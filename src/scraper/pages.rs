//! Page count discovery for documents without a reliable count API.
//!
//! Cheap path: the viewer renders a "current / total" indicator; parse
//! it from the visible text. Fallback: probe the per-page data endpoint
//! with an exponential-then-binary search, O(log n) requests instead of
//! walking every index.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

static SLASH_INDICATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\s*/\s*(\d+)").unwrap());
static OF_INDICATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+\s+of\s+(\d+)").unwrap());

/// Capability to check whether a page index resolves.
///
/// A network error and a non-success response are deliberately
/// indistinguishable here: both narrow the search the same way. On a
/// flaky network this can under-count pages; adding retries would
/// change observed counts, so it stays as is.
#[async_trait]
pub trait PageProbe: Send + Sync {
    async fn page_exists(&self, index: u32) -> bool;
}

/// Parse a "3 / 12" or "3 of 12" indicator out of visible page text.
pub fn parse_page_indicator(text: &str) -> Option<u32> {
    let total = SLASH_INDICATOR
        .captures(text)
        .or_else(|| OF_INDICATOR.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())?;
    (total > 0).then_some(total)
}

/// Find the highest page index that resolves, probing up to `cap`.
///
/// Returns 0 when even page 1 is unreachable; callers translate that
/// into a page-count failure. Documents larger than `cap` pages are
/// reported as `cap` — a known limitation of the bound.
pub async fn probe_page_count<P: PageProbe + ?Sized>(probe: &P, cap: u32) -> u32 {
    if !probe.page_exists(1).await {
        return 0;
    }

    // Exponentially find an upper bound
    let mut upper: u32 = 1;
    while upper <= cap {
        if !probe.page_exists(upper).await {
            break;
        }
        upper *= 2;
    }
    upper = upper.min(cap);

    // Binary search between the last known-good power and the bound
    let mut low = upper / 2;
    let mut high = upper;
    while low < high {
        let mid = (low + high).div_ceil(2);
        if probe.page_exists(mid).await {
            low = mid;
        } else {
            high = mid - 1;
        }
    }

    debug!("Probed page count: {}", low);
    low
}
