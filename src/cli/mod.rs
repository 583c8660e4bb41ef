//! Command line interface: run the extraction server, or fetch a
//! single document straight to disk.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::assemble::PdfAssembler;
use crate::browser::BrowserHandle;
use crate::config::Settings;
use crate::jobs::{Credentials, JobStatus, ScrapeUpdate};
use crate::scraper::{safe_filename, BrowserPipeline, ExtractionPipeline};

#[derive(Parser)]
#[command(name = "docpull")]
#[command(about = "Gated document extraction: auth-walled viewers in, PDFs out")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction HTTP server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Extract one document and write the PDF to disk
    Fetch {
        /// Document viewer URL
        url: String,
        /// Email address for email-gated documents
        #[arg(long, env = "DOCPULL_EMAIL")]
        email: Option<String>,
        /// Passcode for passcode-protected documents
        #[arg(long, env = "DOCPULL_PASSCODE")]
        passcode: Option<String>,
        /// Output path (defaults to the document title)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| settings.server.host.clone());
            let port = port.unwrap_or(settings.server.port);
            crate::server::serve(&settings, &host, port).await
        }
        Commands::Fetch {
            url,
            email,
            passcode,
            output,
        } => fetch(&settings, &url, email, passcode, output).await,
    }
}

async fn fetch(
    settings: &Settings,
    url: &str,
    email: Option<String>,
    passcode: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let browser = Arc::new(BrowserHandle::new(settings.browser.clone()));
    let pipeline = BrowserPipeline::new(
        browser,
        Arc::new(PdfAssembler),
        settings.scrape.clone(),
    )?;
    let credentials = Credentials { email, passcode };

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    bar.set_message("opening document");

    let progress = |update: ScrapeUpdate| match update.status {
        JobStatus::Scraping => {
            if update.total_pages > 0 {
                bar.set_length(u64::from(update.total_pages));
                bar.set_position(u64::from(update.current_page));
                bar.set_message("downloading pages");
            }
        }
        JobStatus::BuildingPdf => bar.set_message("assembling PDF"),
        _ => {}
    };

    let output_doc = pipeline.run(url, &credentials, &progress).await?;
    bar.finish_and_clear();

    let path = output
        .unwrap_or_else(|| PathBuf::from(safe_filename(Some(&output_doc.document_title))));
    std::fs::write(&path, &output_doc.pdf)?;

    println!(
        "{} {} ({} pages, {} KiB) -> {}",
        style("Saved").green().bold(),
        output_doc.document_title,
        output_doc.total_pages,
        output_doc.pdf.len() / 1024,
        path.display()
    );
    Ok(())
}
