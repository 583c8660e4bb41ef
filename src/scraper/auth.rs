//! Gate negotiation: email and passcode checkpoints in front of a
//! document's content.
//!
//! The negotiator drives the live page through detect → fill → submit →
//! settle for each gate. Every wait is bounded, and a wait that times
//! out is treated as best-effort completion rather than failure: a slow
//! but successful submission should not sink the job, and a submission
//! that truly failed will surface as a page-count failure right after.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::jobs::Credentials;

const EMAIL_INPUT: &str = "input[name='link_auth_form[email]']";
const PASSCODE_INPUT: &str = "input[type='password']";
const AUTH_SUBMIT: &str = "#new_link_auth_form button[type='submit']";
const ANY_SUBMIT: &str = "form button[type='submit']";

static VALIDATION_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)valid email").unwrap());
static VERIFICATION_REQUIRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)confirmation email|verify your|check your email|verification link").unwrap()
});

/// The page surface the negotiator drives: visibility checks, form
/// interaction, bounded waits and visible text.
#[async_trait]
pub trait GateSurface: Send + Sync {
    async fn is_visible(&self, selector: &str) -> bool;
    async fn fill(&self, selector: &str, value: &str) -> anyhow::Result<()>;
    async fn click(&self, selector: &str) -> anyhow::Result<()>;
    async fn wait_until(&self, predicate: &str, timeout: Duration) -> bool;
    async fn body_text(&self) -> anyhow::Result<String>;
}

/// What the page looks like after an email submission settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmailGateOutcome {
    Passed,
    Rejected,
    VerificationRequired,
}

/// Interpret the settled page state after submitting an email.
///
/// Kept free of browser specifics so the decision table is testable:
/// verification demands win over validation errors, and an input that
/// lingers without any error text counts as passed (slow unlock).
pub(crate) fn classify_email_submission(body_text: &str) -> EmailGateOutcome {
    if VERIFICATION_REQUIRED.is_match(body_text) {
        return EmailGateOutcome::VerificationRequired;
    }
    if VALIDATION_ERROR.is_match(body_text) {
        return EmailGateOutcome::Rejected;
    }
    EmailGateOutcome::Passed
}

/// Drive the session through both gates. A gate whose credential is
/// absent fails before any form interaction, so the caller never
/// reaches page-count discovery with an unanswerable checkpoint open.
/// Returns once the document content is reachable (or the next stage
/// can find out it is not).
pub async fn negotiate_gates<S: GateSurface + ?Sized>(
    session: &S,
    credentials: &Credentials,
    config: &ScrapeConfig,
) -> Result<(), ScrapeError> {
    if session.is_visible(EMAIL_INPUT).await {
        let email = credentials
            .email
            .as_deref()
            .ok_or(ScrapeError::MissingEmail)?;
        submit_email(session, email, config).await?;
    }

    if session.is_visible(PASSCODE_INPUT).await {
        let passcode = credentials
            .passcode
            .as_deref()
            .ok_or(ScrapeError::MissingPasscode)?;
        submit_passcode(session, passcode, config).await?;
    }

    Ok(())
}

async fn submit_email<S: GateSurface + ?Sized>(
    session: &S,
    email: &str,
    config: &ScrapeConfig,
) -> Result<(), ScrapeError> {
    debug!("Email gate detected, submitting");
    session.fill(EMAIL_INPUT, email).await?;
    if let Err(e) = session.click(AUTH_SUBMIT).await {
        warn!("Email submit button not clickable: {}", e);
    }

    // Settle: input disappears, or an error/verification message shows.
    let settled = r#"(() => {
        const input = document.querySelector("input[name='link_auth_form[email]']");
        if (!input || input.offsetParent === null) return true;
        const body = document.body ? document.body.innerText : '';
        return /valid email|verify|confirmation/i.test(body);
    })()"#;
    if !session
        .wait_until(settled, Duration::from_secs(config.gate_wait_secs))
        .await
    {
        debug!("Email gate did not settle in time, proceeding");
    }

    let body = session.body_text().await.unwrap_or_default();
    match classify_email_submission(&body) {
        EmailGateOutcome::Passed => Ok(()),
        EmailGateOutcome::Rejected => Err(ScrapeError::EmailRejected),
        EmailGateOutcome::VerificationRequired => Err(ScrapeError::EmailVerificationRequired),
    }
}

async fn submit_passcode<S: GateSurface + ?Sized>(
    session: &S,
    passcode: &str,
    config: &ScrapeConfig,
) -> Result<(), ScrapeError> {
    debug!("Passcode gate detected, submitting");
    session.fill(PASSCODE_INPUT, passcode).await?;
    if session.click(AUTH_SUBMIT).await.is_err() {
        if let Err(e) = session.click(ANY_SUBMIT).await {
            warn!("Passcode submit button not clickable: {}", e);
        }
    }

    // Unlock navigates or re-renders; wait for the field to go away.
    let unlocked = r#"(() => {
        const input = document.querySelector("input[type='password']");
        return !input || input.offsetParent === null;
    })()"#;
    if !session
        .wait_until(unlocked, Duration::from_secs(config.nav_wait_secs))
        .await
    {
        // Best effort: a wrong passcode shows up as PageCountUnknown next.
        debug!("Passcode field still present after wait, proceeding");
    }

    Ok(())
}
