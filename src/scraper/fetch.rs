//! Concurrent, batched retrieval of per-page image assets.
//!
//! Metadata for all pages is fetched in one unbounded fan-out (small
//! JSON responses), then images are downloaded in fixed-size batches to
//! cap simultaneous outbound connections. Individual pages are allowed
//! to fail: they are skipped with a warning, and the job only fails if
//! nothing at all could be retrieved.

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::error::ScrapeError;

/// Per-page retrieval locations: a primary image URL and an optional
/// fallback tried when the primary fails.
#[derive(Debug, Clone)]
pub struct PageAsset {
    pub image_url: String,
    pub fallback_url: Option<String>,
}

/// Capability to resolve page metadata and download image bytes.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Metadata for a 1-based page index. `None` covers both a missing
    /// page and a failed metadata request; neither is retried.
    async fn page_metadata(&self, index: u32) -> Option<PageAsset>;

    /// Download one image.
    async fn fetch_image(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Download all pages of a document, in order, tolerating gaps.
///
/// `on_batch` is invoked after each image batch with the number of
/// pages attempted so far (coarser than per-page progress, to bound
/// event volume). The returned buffers preserve ascending page order
/// with failed pages omitted, not reordered.
pub async fn fetch_page_images<S, F>(
    source: &S,
    total_pages: u32,
    batch_size: usize,
    on_batch: F,
) -> Result<Vec<Vec<u8>>, ScrapeError>
where
    S: AssetSource + ?Sized,
    F: Fn(u32),
{
    let total = total_pages as usize;

    // Phase 1: metadata fan-out, all pages at once
    let metadata: Vec<Option<PageAsset>> =
        join_all((1..=total_pages).map(|index| source.page_metadata(index))).await;

    // Phase 2: image downloads in bounded batches
    let mut buffers: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
    let indices: Vec<u32> = (1..=total_pages).collect();

    for batch in indices.chunks(batch_size.max(1)) {
        let downloads = batch.iter().map(|&page| {
            let asset = metadata[(page - 1) as usize].clone();
            async move {
                let asset = asset?;
                match download_with_fallback(source, &asset, page).await {
                    Some(bytes) => Some(bytes),
                    None => {
                        warn!("Page {} skipped: all image URLs failed", page);
                        None
                    }
                }
            }
        });
        buffers.extend(join_all(downloads).await);

        let attempted = batch[batch.len() - 1];
        on_batch(attempted);
    }

    let images: Vec<Vec<u8>> = buffers.into_iter().flatten().collect();
    if images.is_empty() {
        return Err(ScrapeError::NoPagesRetrieved);
    }
    Ok(images)
}

/// Try the primary image location, then the fallback.
async fn download_with_fallback<S: AssetSource + ?Sized>(
    source: &S,
    asset: &PageAsset,
    page: u32,
) -> Option<Vec<u8>> {
    match source.fetch_image(&asset.image_url).await {
        Ok(bytes) => return Some(bytes),
        Err(e) => warn!("Page {} primary image failed: {}", page, e),
    }

    if let Some(fallback) = &asset.fallback_url {
        match source.fetch_image(fallback).await {
            Ok(bytes) => return Some(bytes),
            Err(e) => warn!("Page {} fallback image failed: {}", page, e),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fake source where chosen pages have broken metadata or images.
    struct FakeSource {
        pages: u32,
        missing_metadata: HashSet<u32>,
        broken_primary: HashSet<u32>,
        broken_fallback: HashSet<u32>,
    }

    impl FakeSource {
        fn healthy(pages: u32) -> Self {
            Self {
                pages,
                missing_metadata: HashSet::new(),
                broken_primary: HashSet::new(),
                broken_fallback: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl AssetSource for FakeSource {
        async fn page_metadata(&self, index: u32) -> Option<PageAsset> {
            if index > self.pages || self.missing_metadata.contains(&index) {
                return None;
            }
            Some(PageAsset {
                image_url: format!("primary/{index}"),
                fallback_url: Some(format!("fallback/{index}")),
            })
        }

        async fn fetch_image(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            let (kind, index) = url.split_once('/').unwrap();
            let index: u32 = index.parse().unwrap();
            let broken = match kind {
                "primary" => self.broken_primary.contains(&index),
                _ => self.broken_fallback.contains(&index),
            };
            if broken {
                anyhow::bail!("HTTP 403");
            }
            Ok(format!("{kind}-{index}").into_bytes())
        }
    }

    #[tokio::test]
    async fn downloads_all_pages_in_order() {
        let source = FakeSource::healthy(12);
        let images = fetch_page_images(&source, 12, 10, |_| {}).await.unwrap();
        assert_eq!(images.len(), 12);
        assert_eq!(images[0], b"primary-1");
        assert_eq!(images[11], b"primary-12");
    }

    #[tokio::test]
    async fn failed_pages_are_skipped_not_reordered() {
        let mut source = FakeSource::healthy(5);
        source.missing_metadata.insert(2);
        source.broken_primary.insert(4);
        source.broken_fallback.insert(4);

        let images = fetch_page_images(&source, 5, 10, |_| {}).await.unwrap();
        let pages: Vec<&[u8]> = images.iter().map(|b| b.as_slice()).collect();
        assert_eq!(
            pages,
            vec![
                b"primary-1".as_slice(),
                b"primary-3".as_slice(),
                b"primary-5".as_slice()
            ]
        );
    }

    #[tokio::test]
    async fn fallback_is_used_when_primary_fails() {
        let mut source = FakeSource::healthy(3);
        source.broken_primary.insert(2);

        let images = fetch_page_images(&source, 3, 10, |_| {}).await.unwrap();
        assert_eq!(images[1], b"fallback-2");
    }

    #[tokio::test]
    async fn batch_progress_counts_pages_attempted() {
        let mut source = FakeSource::healthy(25);
        // Failures must not reduce the attempted count.
        source.missing_metadata.insert(3);
        source.broken_primary.insert(7);
        source.broken_fallback.insert(7);

        let seen = Mutex::new(Vec::new());
        fetch_page_images(&source, 25, 10, |attempted| {
            seen.lock().unwrap().push(attempted);
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![10, 20, 25]);
    }

    #[tokio::test]
    async fn all_pages_lost_is_an_error() {
        let mut source = FakeSource::healthy(4);
        for page in 1..=4 {
            source.missing_metadata.insert(page);
        }
        let err = fetch_page_images(&source, 4, 10, |_| {}).await.unwrap_err();
        assert!(matches!(err, ScrapeError::NoPagesRetrieved));
    }
}
