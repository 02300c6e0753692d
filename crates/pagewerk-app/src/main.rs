// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pagewerk command-line front end.
//
// Entry point. Initialises logging, opens the engine in the data directory
// and runs one subcommand.

mod services;

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pagewerk_core::{DocumentId, JobId, JobRequest};
use pagewerk_dispatch::Shutdown;
use pagewerk_model::PageModelStore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use services::data_dir;
use services::engine::Engine;

#[derive(Debug, Parser)]
#[command(name = "pagewerk", version, about = "Crash-safe document transformation jobs")]
struct Cli {
    /// Directory holding the engine's databases and blobs.
    #[arg(long, global = true, env = "PAGEWERK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Worker tasks to run, overriding the configured count.
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a document whose pages are the given files, in order.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print a document's committed page model.
    Show { document: DocumentId },
    /// Write a document's pages into a directory, one file per page.
    Export { document: DocumentId, out_dir: PathBuf },
    /// Submit a job request read from a JSON file.
    Submit {
        request: PathBuf,
        /// Run the engine until the job finishes.
        #[arg(long)]
        wait: bool,
    },
    /// Print a job's status and attempt history.
    Status { job: JobId },
    /// Request cancellation of a job.
    Cancel { job: JobId },
    /// Run the orchestrator and workers until interrupted.
    Serve,
    /// Print job counts and queue depths.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let dir = data_dir::data_dir(cli.data_dir.as_deref())?;
    let engine = Engine::open(&dir, cli.workers)?;
    let orch = engine.orchestrator().clone();

    match cli.command {
        Command::Ingest { files } => {
            let readers = files
                .iter()
                .map(|path| File::open(path).with_context(|| format!("opening {}", path.display())))
                .collect::<Result<Vec<_>>>()?;
            let document = orch.ingest(readers)?;
            print_json(&document)?;
        }
        Command::Show { document } => {
            print_json(&orch.pages().read(&document)?)?;
        }
        Command::Export { document, out_dir } => {
            std::fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
            for (index, (page, mut reader)) in orch.export(&document)?.into_iter().enumerate() {
                let path = out_dir.join(format!("{index:04}-{}", page.id));
                let mut file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                std::io::copy(&mut reader, &mut file).with_context(|| format!("writing {}", path.display()))?;
            }
            info!(document_id = %document, dir = %out_dir.display(), "document exported");
        }
        Command::Submit { request, wait } => {
            let data = std::fs::read_to_string(&request).with_context(|| format!("reading {}", request.display()))?;
            let request: JobRequest = serde_json::from_str(&data).context("parsing job request")?;
            if wait {
                let shutdown = Shutdown::new();
                let handles = engine.start(&shutdown).await?;
                let status = orch.submit(request).await?;
                let done = orch.wait(&status.job_id, orch.config().poll_interval()).await;
                stop(&shutdown, handles).await;
                print_json(&done?)?;
            } else {
                print_json(&orch.submit(request).await?)?;
            }
        }
        Command::Status { job } => {
            #[derive(Serialize)]
            struct Report<T, A> {
                status: T,
                attempts: A,
            }
            print_json(&Report {
                status: orch.status(&job)?,
                attempts: orch.attempts(&job)?,
            })?;
        }
        Command::Cancel { job } => {
            print_json(&orch.cancel(&job)?)?;
        }
        Command::Serve => {
            let shutdown = Shutdown::new();
            let handles = engine.start(&shutdown).await?;
            info!(path = %engine.dir().display(), "serving, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down");
            stop(&shutdown, handles).await;
        }
        Command::Health => {
            let health = orch.health().await?;
            print_json(&health)?;
            if health.dead_letters > 0 {
                bail!("{} dead-lettered message(s)", health.dead_letters);
            }
        }
    }
    Ok(())
}

async fn stop(shutdown: &Shutdown, handles: Vec<JoinHandle<()>>) {
    shutdown.trigger();
    let grace = Duration::from_secs(5);
    for handle in handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("task did not stop within {grace:?}");
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_accepts_wait_flag() {
        let cli = Cli::try_parse_from(["pagewerk", "--workers", "2", "submit", "job.json", "--wait"]).expect("parse");
        assert_eq!(cli.workers, Some(2));
        assert!(matches!(cli.command, Command::Submit { wait: true, .. }));
    }
}
