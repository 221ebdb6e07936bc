//! `rfs-fetch` command line.
//!
//! Works offline against a JSON snapshot of published records, which is
//! loaded into a [`MemorySource`].

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::keys::{OwnerKey, SecretKey};
use crate::record::Record;
use crate::session::FetchSession;
use crate::source::MemorySource;

/// Command line arguments.
#[derive(Parser)]
#[command(name = "rfs-fetch")]
#[command(about = "RelayFS file retrieval", long_about = None)]
pub struct Cli {
    /// Config file (`.toml` or `.json`); defaults apply when omitted.
    #[arg(short, long, env = "RFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON array of published records to serve from.
    #[arg(short, long, env = "RFS_RECORDS")]
    pub records: PathBuf,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List an owner's files.
    List {
        /// Owner public key (hex).
        owner: String,
        /// Listing page, 1 is the current one.
        #[arg(short, long, default_value = "1")]
        page: u32,
        /// Walk every page.
        #[arg(long, conflicts_with = "page")]
        all: bool,
    },
    /// Print a file's manifest.
    Manifest {
        /// Owner public key (hex).
        owner: String,
        /// Content hash of the file.
        hash: String,
    },
    /// Download a file.
    Get {
        /// Owner public key (hex).
        owner: String,
        /// Content hash of the file.
        hash: String,
        /// Secret key (hex) for sealed files.
        #[arg(long, env = "RFS_SECRET_KEY", hide_env_values = true)]
        secret: Option<String>,
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Refuse files above the configured preview limit.
        #[arg(long)]
        preview: bool,
    },
}

impl Cli {
    /// Runs the command, writing results to stdout.
    pub async fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => FetchConfig::from_file(path)?,
            None => FetchConfig::default(),
        };
        let source = load_snapshot(&self.records)?;
        let session = FetchSession::new(Arc::new(source), config)?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                on_interrupt.cancel();
            }
        });

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        execute(&session, &self.command, &cancel, &mut out).await
    }
}

/// Loads a record snapshot into a memory source.
pub fn load_snapshot(path: &Path) -> Result<MemorySource> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading records from {}", path.display()))?;
    let records: Vec<Record> = serde_json::from_str(&contents)
        .with_context(|| format!("parsing records from {}", path.display()))?;
    tracing::info!(records = records.len(), path = %path.display(), "loaded record snapshot");
    Ok(MemorySource::with_records(records))
}

/// Runs one command against `session`.
pub async fn execute(
    session: &FetchSession,
    command: &Command,
    cancel: &CancellationToken,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Command::List { owner, page, all } => {
            let owner = OwnerKey::parse(owner)?;
            let files = if *all {
                session.list_all_files(&owner).await?
            } else {
                session.list_files(&owner, *page).await?.files
            };
            for file in files {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}",
                    file.hash, file.size, file.encryption, file.name
                )?;
            }
        }
        Command::Manifest { owner, hash } => {
            let owner = OwnerKey::parse(owner)?;
            let manifest = session.manifest(&owner, hash).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&manifest)?)?;
        }
        Command::Get {
            owner,
            hash,
            secret,
            output,
            preview,
        } => {
            let owner = OwnerKey::parse(owner)?;
            let secret = secret.as_deref().map(SecretKey::parse).transpose()?;
            let on_progress = |p: crate::collector::Progress| {
                tracing::debug!(received = p.received, total = p.total, "chunks");
            };
            let file = if *preview {
                session
                    .preview(&owner, hash, secret.as_ref(), &on_progress, cancel)
                    .await?
            } else {
                session
                    .download(&owner, hash, secret.as_ref(), &on_progress, cancel)
                    .await?
            };
            match output {
                Some(path) => {
                    std::fs::write(path, &file.bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                    tracing::info!(name = %file.name, bytes = file.bytes.len(), path = %path.display(), "saved");
                }
                None => out.write_all(&file.bytes)?,
            }
        }
    }
    out.flush()?;
    Ok(())
}
