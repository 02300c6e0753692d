// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine host: opens every store under one data directory and runs the
// orchestrator alongside a local worker pool.
//
// Layout of the data directory:
//
//   config.json   engine settings
//   pages.db      page model store
//   jobs.db       jobs, steps and attempt history
//   leases.db     per-document leases
//   queue.db      work and result queues, dead letters
//   blobs/        content-addressed page content

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pagewerk_blob::BlobResolver;
use pagewerk_core::config::CONFIG_FILE;
use pagewerk_core::EngineConfig;
use pagewerk_dispatch::{Dispatcher, Shutdown, SqliteQueue};
use pagewerk_executor::ExecutorRegistry;
use pagewerk_executor::worker::spawn_pool;
use pagewerk_model::SqlitePageStore;
use pagewerk_orchestrator::{JobStore, LeaseStore, Orchestrator};
use tokio::task::JoinHandle;
use tracing::info;

pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Dispatcher,
    registry: Arc<ExecutorRegistry>,
    pages: Arc<SqlitePageStore>,
    blobs: BlobResolver,
}

impl Engine {
    /// Open (or initialise) the engine state in `dir`.
    pub fn open(dir: &Path, workers: Option<usize>) -> Result<Self> {
        let mut config = EngineConfig::load_or_default(dir);
        if !dir.join(CONFIG_FILE).exists() {
            config.save(dir).context("writing default configuration")?;
        }
        if let Some(count) = workers {
            config.worker_count = count;
        }
        config.validate()?;

        let pages = Arc::new(SqlitePageStore::open(dir.join("pages.db")).context("opening page store")?);
        let jobs = Arc::new(JobStore::open(dir.join("jobs.db")).context("opening job store")?);
        let leases = Arc::new(LeaseStore::open(dir.join("leases.db")).context("opening lease store")?);
        let queue = SqliteQueue::open(dir.join("queue.db"), config.max_deliveries).context("opening queue")?;
        let blobs = BlobResolver::filesystem(dir.join("blobs"), config.max_blob_bytes).context("opening blob store")?;

        let dispatcher = Dispatcher::new(Arc::new(queue), config.visibility_timeout(), config.poll_interval());
        let registry = Arc::new(ExecutorRegistry::with_builtins(pagewerk_bridge::default_bridge()));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            jobs,
            leases,
            pages.clone(),
            blobs.clone(),
            dispatcher.clone(),
        ));
        info!(path = %dir.display(), "engine opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            orchestrator,
            dispatcher,
            registry,
            pages,
            blobs,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Recover interrupted jobs, then spawn the orchestrator loops and the
    /// worker pool. Everything stops when `shutdown` fires.
    pub async fn start(&self, shutdown: &Shutdown) -> Result<Vec<JoinHandle<()>>> {
        self.orchestrator.recover().await.context("recovering running jobs")?;
        let mut handles = self.orchestrator.start(shutdown);
        handles.extend(spawn_pool(
            self.config.worker_count,
            &self.dispatcher,
            self.registry.clone(),
            self.pages.clone(),
            &self.blobs,
            shutdown,
        ));
        info!(workers = self.config.worker_count, "engine running");
        Ok(handles)
    }
}
