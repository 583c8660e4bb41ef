//! Job lifecycle types shared between the manager, pipeline and server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle of one extraction job.
///
/// Transitions only move forward: `queued → scraping → building_pdf`
/// and then exactly one of `done` or `error`. `error` may be entered
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Scraping,
    BuildingPdf,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Position in the forward-only ordering. `error` ranks above all
    /// non-terminal states so a failing job can always reach it.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Scraping => 1,
            JobStatus::BuildingPdf => 2,
            JobStatus::Done => 3,
            JobStatus::Error => 3,
        }
    }

    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

/// One end-to-end extraction request, tracked until eviction.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub status: JobStatus,
    pub total_pages: u32,
    pub current_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            status: JobStatus::Queued,
            total_pages: 0,
            current_page: 0,
            document_title: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Fold a pipeline update into the job, honoring the forward-only
    /// status ordering and monotone page progress.
    pub fn apply(&mut self, update: &ScrapeUpdate) {
        if self.status.can_advance_to(update.status) {
            self.status = update.status;
        }
        self.current_page = self.current_page.max(update.current_page);
        if update.total_pages > 0 {
            self.total_pages = update.total_pages;
        }
        if let Some(title) = &update.document_title {
            self.document_title = Some(title.clone());
        }
    }

    /// Immutable snapshot broadcast to subscribers.
    pub fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            job_id: self.id,
            status: self.status,
            current_page: self.current_page,
            total_pages: self.total_pages,
            document_title: self.document_title.clone(),
            error: self.error.clone(),
        }
    }
}

/// Optional gate credentials, supplied once per job invocation.
///
/// Never persisted and never logged: the `Debug` impl redacts values.
#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    pub email: Option<String>,
    pub passcode: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email.as_deref().map(|_| "<redacted>"))
            .field("passcode", &self.passcode.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Progress emitted by the pipeline while a job runs.
#[derive(Debug, Clone)]
pub struct ScrapeUpdate {
    pub status: JobStatus,
    pub current_page: u32,
    pub total_pages: u32,
    pub document_title: Option<String>,
}

/// Snapshot broadcast to subscribers on every state change.
///
/// Carries no artifact payload; finished bytes travel through the
/// download path instead.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub current_page: u32,
    pub total_pages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct ScrapeOutput {
    pub pdf: Vec<u8>,
    pub document_title: String,
    pub total_pages: u32,
}
