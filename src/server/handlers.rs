//! Request handlers for the extraction API.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::jobs::{Credentials, JobId, JobStatus, ProgressEvent, ScrapeUpdate};
use crate::scraper::{safe_filename, validate_url};

use super::AppState;

/// Base64 characters per streamed artifact frame.
const PDF_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Deserialize)]
pub struct ScrapeRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub passcode: Option<String>,
}

impl ScrapeRequest {
    fn credentials(&self) -> Credentials {
        Credentials {
            email: self.email.clone(),
            passcode: self.passcode.clone(),
        }
    }
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn parse_job_id(raw: &str) -> Result<JobId, Response> {
    raw.parse()
        .map_err(|_| error_json(StatusCode::NOT_FOUND, "Job not found"))
}

/// POST /api/jobs — register and start one extraction job per URL.
///
/// Every URL is validated before anything is registered, so a request
/// with any malformed URL never leaves a job record behind.
pub async fn submit_jobs(
    State(state): State<AppState>,
    Json(request): Json<ScrapeRequest>,
) -> Response {
    if request.urls.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "No URLs provided");
    }
    let mut urls = Vec::with_capacity(request.urls.len());
    for raw in &request.urls {
        match validate_url(raw) {
            Ok(url) => urls.push(url),
            Err(e) => return error_json(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }

    let jobs: Vec<_> = urls
        .into_iter()
        .map(|url| {
            let job = state.manager.create_job(&url);
            state.manager.start(job.id, request.credentials());
            debug!("Accepted job {} for {}", job.id, url);
            job
        })
        .collect();

    (StatusCode::ACCEPTED, Json(jobs)).into_response()
}

/// GET /api/jobs/:job_id — current job snapshot.
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.manager.job(job_id) {
        Some(job) => Json(job).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "Job not found"),
    }
}

/// GET /api/jobs/:job_id/events — live progress over SSE.
///
/// Opens with the job's current snapshot, then relays updates as the
/// pipeline produces them. The stream ends after the terminal event,
/// or immediately if the job already finished.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    // Snapshot and receiver come from one registry lock; a job that
    // finishes right after the snapshot still delivers its terminal
    // event through the receiver, so the stream always terminates.
    let Some((job, receiver)) = state.manager.watch(job_id) else {
        return error_json(StatusCode::NOT_FOUND, "Job not found");
    };
    let Some(receiver) = receiver else {
        return error_json(StatusCode::GONE, "Job events have expired");
    };

    let snapshot = job.progress_event();
    let stream = stream::unfold(
        (Some(snapshot), receiver, false),
        |(pending, mut receiver, finished)| async move {
            if finished {
                return None;
            }
            if let Some(event) = pending {
                let terminal = event.status.is_terminal();
                return Some((progress_frame(&event), (None, receiver, terminal)));
            }
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let terminal = event.status.is_terminal();
                        return Some((progress_frame(&event), (None, receiver, terminal)));
                    }
                    // A slow consumer skips ahead; the next snapshot is
                    // still a valid cumulative state.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn progress_frame(event: &ProgressEvent) -> Result<Event, axum::Error> {
    Event::default().event("progress").json_data(event)
}

/// GET /api/jobs/:job_id/download — the finished PDF.
///
/// Distinguishes unknown jobs (404), jobs still in flight (409),
/// failed jobs (422) and finished jobs whose artifact has aged out of
/// the retention window (410).
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let Some(job) = state.manager.job(job_id) else {
        return error_json(StatusCode::NOT_FOUND, "Job not found");
    };

    match job.status {
        JobStatus::Queued | JobStatus::Scraping | JobStatus::BuildingPdf => {
            error_json(StatusCode::CONFLICT, "Job is still running")
        }
        JobStatus::Error => error_json(
            StatusCode::UNPROCESSABLE_ENTITY,
            job.error.unwrap_or_else(|| "Job failed".to_string()),
        ),
        JobStatus::Done => match state.manager.artifact(job_id) {
            Some(artifact) => {
                let filename = safe_filename(job.document_title.as_deref());
                (
                    [
                        (header::CONTENT_TYPE, "application/pdf".to_string()),
                        (
                            header::CONTENT_DISPOSITION,
                            format!("attachment; filename=\"{}\"", filename),
                        ),
                    ],
                    artifact.as_ref().clone(),
                )
                    .into_response()
            }
            None => error_json(StatusCode::GONE, "Job result has expired"),
        },
    }
}

/// POST /api/scrape — run the whole pipeline inline and stream the
/// result over one SSE response: progress frames while scraping, then
/// the PDF as base64 `pdf-chunk` frames, then a `done` frame. Errors
/// arrive as a terminal `error` frame on the same stream.
pub async fn scrape_stream(
    State(state): State<AppState>,
    Json(request): Json<ScrapeRequest>,
) -> Response {
    // Streaming mode handles one document per request.
    let [raw] = request.urls.as_slice() else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "Streaming mode takes exactly one URL",
        );
    };
    let url = match validate_url(raw) {
        Ok(url) => url,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let credentials = request.credentials();

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let pipeline = state.pipeline.clone();

    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let on_progress = move |update: ScrapeUpdate| {
            let frame = Event::default().event("progress").json_data(serde_json::json!({
                "status": update.status,
                "current_page": update.current_page,
                "total_pages": update.total_pages,
                "document_title": update.document_title,
            }));
            if let Ok(frame) = frame {
                // Dropping a progress frame on backpressure is fine;
                // the next one carries cumulative state.
                let _ = progress_tx.try_send(Ok(frame));
            }
        };

        match pipeline.run(&url, &credentials, &on_progress).await {
            Ok(output) => {
                let encoded = BASE64.encode(&output.pdf);
                let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(PDF_CHUNK_SIZE).collect();
                let total = chunks.len();
                for (index, chunk) in chunks.into_iter().enumerate() {
                    let frame = Event::default().event("pdf-chunk").json_data(
                        serde_json::json!({
                            "index": index,
                            "total": total,
                            "data": String::from_utf8_lossy(chunk),
                        }),
                    );
                    if let Ok(frame) = frame {
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                }
                let done = Event::default().event("done").json_data(serde_json::json!({
                    "document_title": output.document_title,
                    "total_pages": output.total_pages,
                    "bytes": output.pdf.len(),
                }));
                if let Ok(done) = done {
                    let _ = tx.send(Ok(done)).await;
                }
            }
            Err(e) => {
                let frame = Event::default()
                    .event("error")
                    .json_data(serde_json::json!({ "error": e.to_string() }));
                if let Ok(frame) = frame {
                    let _ = tx.send(Ok(frame)).await;
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

