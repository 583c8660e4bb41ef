//! HTTP surface for document extraction.
//!
//! Exposes the job-based flow (submit, poll, subscribe to progress,
//! download the finished PDF) plus a single-request streaming variant
//! that runs the whole pipeline inline and streams the artifact back
//! base64-chunked over one SSE response.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::assemble::PdfAssembler;
use crate::browser::BrowserHandle;
use crate::config::Settings;
use crate::jobs::JobManager;
use crate::scraper::{BrowserPipeline, ExtractionPipeline};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    /// Direct pipeline handle for the inline streaming endpoint.
    pub pipeline: Arc<dyn ExtractionPipeline>,
}

impl AppState {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let browser = Arc::new(BrowserHandle::new(settings.browser.clone()));
        let pipeline: Arc<dyn ExtractionPipeline> = Arc::new(BrowserPipeline::new(
            browser,
            Arc::new(PdfAssembler),
            settings.scrape.clone(),
        )?);
        let manager = JobManager::new(pipeline.clone(), settings.jobs.clone());

        Ok(Self { manager, pipeline })
    }
}

/// Start the web server.
pub async fn serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(settings)?;
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    use crate::config::JobConfig;
    use crate::error::ScrapeError;
    use crate::jobs::{Credentials, JobStatus, ScrapeOutput, ScrapeUpdate};
    use crate::scraper::ProgressSink;

    /// Pipeline stub: succeeds or fails instantly unless gated.
    struct StubPipeline {
        outcome: Mutex<Option<Result<ScrapeOutput, ScrapeError>>>,
        gate: Option<Semaphore>,
    }

    impl StubPipeline {
        fn ok(pdf: Vec<u8>) -> Self {
            Self {
                outcome: Mutex::new(Some(Ok(ScrapeOutput {
                    pdf,
                    document_title: "Q3 Deck: Final?".into(),
                    total_pages: 2,
                }))),
                gate: None,
            }
        }

        fn err(e: ScrapeError) -> Self {
            Self {
                outcome: Mutex::new(Some(Err(e))),
                gate: None,
            }
        }

        fn gated(pdf: Vec<u8>) -> Self {
            Self {
                outcome: Mutex::new(Some(Ok(ScrapeOutput {
                    pdf,
                    document_title: "Deck".into(),
                    total_pages: 2,
                }))),
                gate: Some(Semaphore::new(0)),
            }
        }
    }

    #[async_trait]
    impl ExtractionPipeline for StubPipeline {
        async fn run(
            &self,
            _url: &str,
            _credentials: &Credentials,
            on_progress: ProgressSink<'_>,
        ) -> Result<ScrapeOutput, ScrapeError> {
            on_progress(ScrapeUpdate {
                status: JobStatus::Scraping,
                current_page: 0,
                total_pages: 2,
                document_title: None,
            });
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            on_progress(ScrapeUpdate {
                status: JobStatus::BuildingPdf,
                current_page: 2,
                total_pages: 2,
                document_title: None,
            });
            self.outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(ScrapeError::NoPagesRetrieved))
        }
    }

    fn test_app(pipeline: Arc<StubPipeline>) -> (axum::Router, JobManager) {
        test_app_with_retention(pipeline, 600)
    }

    fn test_app_with_retention(
        pipeline: Arc<StubPipeline>,
        retention_secs: u64,
    ) -> (axum::Router, JobManager) {
        let pipeline: Arc<dyn ExtractionPipeline> = pipeline;
        let manager = JobManager::new(
            pipeline.clone(),
            JobConfig {
                max_concurrent: 5,
                retention_secs,
            },
        );
        let state = AppState {
            manager: manager.clone(),
            pipeline,
        };
        (create_router(state), manager)
    }

    fn submit_body(url: &str) -> Body {
        Body::from(serde_json::json!({ "urls": [url] }).to_string())
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text_body(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn wait_for_status(manager: &JobManager, id: crate::jobs::JobId, want: JobStatus) {
        for _ in 0..200 {
            if manager.job(id).map(|j| j.status) == Some(want) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job never reached {:?}", want);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_url_without_creating_a_job() {
        let (app, _) = test_app(Arc::new(StubPipeline::ok(b"%PDF-1.5".to_vec())));

        let response = app
            .oneshot(
                Request::post("/api/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("https://example.com/view/abc123"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("example.com"));
    }

    #[tokio::test]
    async fn submit_then_poll_reaches_done() {
        let (app, manager) = test_app(Arc::new(StubPipeline::ok(b"%PDF-1.5".to_vec())));

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("https://docsend.com/view/abc123"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let id: crate::jobs::JobId = body[0]["id"].as_str().unwrap().parse().unwrap();

        wait_for_status(&manager, id, JobStatus::Done).await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "done");
        assert_eq!(body["total_pages"], 2);
    }

    #[tokio::test]
    async fn submit_accepts_one_job_per_url() {
        let (app, manager) = test_app(Arc::new(StubPipeline::ok(b"%PDF-1.5".to_vec())));

        let body = Body::from(
            serde_json::json!({
                "urls": [
                    "https://docsend.com/view/abc123",
                    "https://docsend.com/view/def456",
                ]
            })
            .to_string(),
        );
        let response = app
            .oneshot(
                Request::post("/api/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        for job in jobs {
            let id: crate::jobs::JobId = job["id"].as_str().unwrap().parse().unwrap();
            assert!(manager.job(id).is_some());
        }
    }

    #[tokio::test]
    async fn submit_rejects_whole_batch_on_any_bad_url() {
        let (app, _) = test_app(Arc::new(StubPipeline::ok(Vec::new())));

        let body = Body::from(
            serde_json::json!({
                "urls": [
                    "https://docsend.com/view/abc123",
                    "https://example.com/not-a-doc",
                ]
            })
            .to_string(),
        );
        let response = app
            .oneshot(
                Request::post("/api/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (app, _) = test_app(Arc::new(StubPipeline::ok(Vec::new())));

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_while_running_is_conflict() {
        let pipeline = Arc::new(StubPipeline::gated(b"%PDF-1.5".to_vec()));
        let (app, manager) = test_app(pipeline.clone());

        let job = manager.create_job("https://docsend.com/view/abc123");
        manager.start(job.id, Credentials::default());
        wait_for_status(&manager, job.id, JobStatus::Scraping).await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}/download", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        pipeline.gate.as_ref().unwrap().add_permits(1);
    }

    #[tokio::test]
    async fn download_serves_pdf_with_sanitized_filename() {
        let (app, manager) = test_app(Arc::new(StubPipeline::ok(b"%PDF-1.5 test".to_vec())));

        let job = manager.create_job("https://docsend.com/view/abc123");
        manager.start(job.id, Credentials::default());
        wait_for_status(&manager, job.id, JobStatus::Done).await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}/download", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        // "Q3 Deck: Final?" sanitized for filesystem use
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Q3 Deck_ Final_.pdf\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"%PDF-1.5 test");
    }

    #[tokio::test]
    async fn download_after_artifact_eviction_is_gone() {
        // One-second retention: the artifact ages out first, the job
        // record lingers one further window, so the download lands in
        // the expired branch rather than 404.
        let (app, manager) =
            test_app_with_retention(Arc::new(StubPipeline::ok(b"%PDF-1.5".to_vec())), 1);

        let job = manager.create_job("https://docsend.com/view/abc123");
        manager.start(job.id, Credentials::default());
        wait_for_status(&manager, job.id, JobStatus::Done).await;

        for _ in 0..200 {
            if manager.artifact(job.id).is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(manager.artifact(job.id).is_none(), "artifact never evicted");

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}/download", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn download_of_failed_job_is_unprocessable() {
        let (app, manager) = test_app(Arc::new(StubPipeline::err(ScrapeError::EmailRejected)));

        let job = manager.create_job("https://docsend.com/view/abc123");
        manager.start(job.id, Credentials::default());
        wait_for_status(&manager, job.id, JobStatus::Error).await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}/download", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn event_stream_ends_after_terminal_event() {
        let (app, manager) = test_app(Arc::new(StubPipeline::ok(b"%PDF-1.5".to_vec())));

        let job = manager.create_job("https://docsend.com/view/abc123");
        manager.start(job.id, Credentials::default());
        wait_for_status(&manager, job.id, JobStatus::Done).await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}/events", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Stream closes on its own after the terminal snapshot, so the
        // whole body can be collected.
        let body = text_body(response).await;
        assert!(body.contains("\"status\":\"done\""));
    }

    #[tokio::test]
    async fn streaming_scrape_delivers_chunked_artifact() {
        let pdf = b"%PDF-1.5 streaming artifact".to_vec();
        let (app, _) = test_app(Arc::new(StubPipeline::ok(pdf.clone())));

        let response = app
            .oneshot(
                Request::post("/api/scrape")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("https://docsend.com/view/abc123"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = text_body(response).await;
        assert!(body.contains("event: progress"));
        assert!(body.contains("event: pdf-chunk"));
        assert!(body.contains("event: done"));
        assert!(body.contains(&BASE64.encode(&pdf)));
    }

    #[tokio::test]
    async fn streaming_scrape_rejects_multiple_urls() {
        let (app, _) = test_app(Arc::new(StubPipeline::ok(Vec::new())));

        let body = Body::from(
            serde_json::json!({
                "urls": [
                    "https://docsend.com/view/abc123",
                    "https://docsend.com/view/def456",
                ]
            })
            .to_string(),
        );
        let response = app
            .oneshot(
                Request::post("/api/scrape")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("one URL"));
    }

    #[tokio::test]
    async fn streaming_scrape_reports_pipeline_errors() {
        let (app, _) = test_app(Arc::new(StubPipeline::err(ScrapeError::MissingPasscode)));

        let response = app
            .oneshot(
                Request::post("/api/scrape")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("https://docsend.com/view/abc123"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = text_body(response).await;
        assert!(body.contains("event: error"));
        assert!(body.contains("passcode"));
    }
}
