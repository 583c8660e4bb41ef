//! docpull - gated document extraction service.
//!
//! Drives a headless browser through viewer auth gates (email,
//! passcode), discovers how many pages a document has, downloads the
//! page images in batches and assembles them into a PDF. Exposes the
//! pipeline over an HTTP API with live progress events, and as a CLI
//! for one-off fetches.

pub mod assemble;
pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod scraper;
pub mod server;
