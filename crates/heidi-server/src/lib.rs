//! heidi-server - agent dispatch daemon
//!
//! Library components for the server process: executors, the run engine,
//! the loop controller, on-disk run storage and the HTTP API.

pub mod controller;
pub mod engine;
pub mod executor;
pub mod server;
pub mod session;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use engine::{EngineSettings, RunEngine};
use executor::ExecutorRegistry;
use heidi_core::Config;
use server::AppState;
use storage::RunStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Time live runs get to record their terminal state on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    engine: RunEngine,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open the run store and build the executor registry from `config`.
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        let store = Arc::new(RunStore::open(config.runs_dir()).await?);
        let registry = Arc::new(ExecutorRegistry::from_config(&config));
        let engine = RunEngine::new(store, registry, EngineSettings::from_config(&config));

        Ok(Self {
            config,
            engine,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &RunEngine {
        &self.engine
    }

    /// Recover interrupted runs, then serve HTTP until shutdown.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let bind = self.config.bind_addr();
        let addr: SocketAddr = tokio::net::lookup_host(&bind)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| DaemonError::InvalidAddress(bind.clone()))?;

        info!(home = %self.config.home.display(), "heidi-server starting");
        info!(
            executors = ?self.engine.registry().names(),
            default_executor = %self.config.default_executor,
            "executors registered"
        );
        if self.config.api_key.is_some() {
            info!("api key: enabled");
        } else if !addr.ip().is_loopback() {
            warn!(addr = %addr, "serving on a non-loopback address without an api key");
        }

        match self.engine.recover_interrupted_runs().await {
            Ok(0) => {}
            Ok(count) => info!(count, "marked interrupted runs as failed"),
            Err(err) => warn!(error = %err, "failed to recover interrupted runs"),
        }

        let state = Arc::new(AppState {
            engine: self.engine.clone(),
            api_key: self.config.api_key.clone(),
        });
        server::start_server(state, addr, self.shutdown.clone()).await?;
        info!("HTTP server stopped");
        Ok(())
    }

    /// Stop accepting requests, then stop live runs and wait for them to
    /// record their outcome.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.engine.shutdown(SHUTDOWN_GRACE).await;
    }
}
