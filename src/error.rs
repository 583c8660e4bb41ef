//! Error taxonomy for the extraction pipeline.

use thiserror::Error;

/// Errors that terminate an extraction job.
///
/// Per-page download failures are not represented here: they are
/// absorbed inside the fetch stage and only surface as
/// [`ScrapeError::NoPagesRetrieved`] when every page is lost.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Not a recognized document URL: {0}")]
    InvalidUrl(String),

    #[error("This document requires an email address. Provide one with the request.")]
    MissingEmail,

    #[error("The email address was rejected. Provide a valid address.")]
    EmailRejected,

    #[error("The document requires email verification. Click the link in the verification email, then retry.")]
    EmailVerificationRequired,

    #[error("This document requires a passcode. Provide one with the request.")]
    MissingPasscode,

    #[error("Could not determine the page count. The passcode may be wrong or the link invalid.")]
    PageCountUnknown,

    #[error("No pages could be downloaded.")]
    NoPagesRetrieved,

    #[error("Failed to assemble the output document: {0}")]
    Assembly(String),

    #[error(transparent)]
    Browser(#[from] anyhow::Error),
}
