//! Session lifecycle: brings the engine up for one download and tears it down exactly once.

pub mod triggers;

pub use triggers::{ShutdownReason, ShutdownTrigger, spawn_parent_watch, spawn_signal_listener};

use crate::{
    config::Config,
    engine::{
        AddDownload, DiscoveryService, EngineError, EngineHandle, EngineSettings, SnapshotRx,
        StorageMode, SwarmId,
    },
    logging::redact_uri,
};
use serde::Serialize;
use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::sync::OnceCell;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub uri: String,
    pub save_path: PathBuf,
    pub storage_mode: StorageMode,
    pub settings: EngineSettings,
    pub listen_ports: RangeInclusive<u16>,
    pub keep_files: bool,
    pub flush_timeout: Duration,
}

impl SessionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            uri: cfg.download.uri.clone(),
            save_path: cfg.save_path(),
            storage_mode: cfg.storage_mode(),
            settings: cfg.engine_settings(),
            listen_ports: cfg.listen_ports(),
            keep_files: cfg.download.keep_files,
            flush_timeout: cfg.flush_timeout(),
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    Startup {
        step: &'static str,
        source: EngineError,
    },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup { step, source } => write!(f, "session startup failed at {step}: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Startup { source, .. } => Some(source),
        }
    }
}

fn startup(step: &'static str) -> impl FnOnce(EngineError) -> SessionError {
    move |source| SessionError::Startup { step, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub swarm: SwarmId,
    pub listen_port: u16,
}

/// Outcome of the one teardown run. A flush timeout is recorded, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub services_stopped: usize,
    pub removed: bool,
    pub flush_timed_out: bool,
    pub files_deleted: usize,
    pub errors: Vec<String>,
}

pub struct SessionManager {
    engine: EngineHandle,
    snapshots: SnapshotRx,
    cfg: SessionConfig,
    attached: AtomicBool,
    report: OnceCell<ShutdownReport>,
}

impl SessionManager {
    pub fn new(engine: EngineHandle, snapshots: SnapshotRx, cfg: SessionConfig) -> Self {
        Self {
            engine,
            snapshots,
            cfg,
            attached: AtomicBool::new(false),
            report: OnceCell::new(),
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// settings → listen → discovery services → add download → sequential fetch.
    pub async fn start(&self) -> Result<Started, SessionError> {
        self.engine
            .apply_settings(self.cfg.settings.clone())
            .await
            .map_err(startup("apply_settings"))?;
        let listen_port = self
            .engine
            .listen_on(self.cfg.listen_ports.clone())
            .await
            .map_err(startup("listen_on"))?;
        tracing::info!(port = listen_port, "engine listening");

        for service in DiscoveryService::ALL {
            match self.engine.start_service(service).await {
                Ok(()) => tracing::info!(service = service.as_str(), "discovery service started"),
                Err(err) => {
                    tracing::warn!(service = service.as_str(), error = %err, "discovery service failed to start")
                }
            }
        }

        let swarm = self
            .engine
            .add_download(AddDownload {
                uri: self.cfg.uri.clone(),
                save_path: self.cfg.save_path.clone(),
                storage_mode: self.cfg.storage_mode,
            })
            .await
            .map_err(startup("add_download"))?;
        self.attached.store(true, Ordering::Release);
        tracing::info!(
            %swarm,
            uri = %redact_uri(&self.cfg.uri),
            save_path = %self.cfg.save_path.display(),
            "download added"
        );

        self.engine
            .set_sequential(true)
            .await
            .map_err(startup("set_sequential"))?;
        Ok(Started { swarm, listen_port })
    }

    /// Runs teardown once; concurrent and later callers get the same report.
    pub async fn shutdown(&self) -> &ShutdownReport {
        self.report.get_or_init(|| self.teardown()).await
    }

    pub fn report(&self) -> Option<&ShutdownReport> {
        self.report.get()
    }

    async fn teardown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for service in DiscoveryService::ALL.into_iter().rev() {
            match self.engine.stop_service(service).await {
                Ok(()) => {
                    report.services_stopped += 1;
                    tracing::info!(service = service.as_str(), "discovery service stopped");
                }
                Err(err) => report.errors.push(format!("stop {}: {err}", service.as_str())),
            }
        }

        if !self.is_attached() {
            tracing::info!("no download attached; nothing to remove");
            return report;
        }

        // Captured before removal; the snapshot loses metadata once the swarm is gone.
        let paths = self.storage_paths();
        let delete_files = !self.cfg.keep_files;
        tracing::info!(delete_files, "removing download");
        match self.engine.remove_download(delete_files).await {
            Ok(()) => report.removed = true,
            Err(err) => {
                tracing::warn!(error = %err, "remove download failed");
                report.errors.push(format!("remove download: {err}"));
            }
        }

        if report.removed {
            tracing::info!(timeout_secs = self.cfg.flush_timeout.as_secs_f32(), "waiting for storage flush");
            match self.engine.wait_for_flush(self.cfg.flush_timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    report.flush_timed_out = true;
                    tracing::warn!("storage flush not confirmed in time; continuing cleanup");
                }
                Err(err) => report.errors.push(format!("wait for flush: {err}")),
            }
        }

        if delete_files {
            report.files_deleted = delete_best_effort(&self.cfg.save_path, &paths).await;
        }
        tracing::info!(
            removed = report.removed,
            flush_timed_out = report.flush_timed_out,
            files_deleted = report.files_deleted,
            "session torn down"
        );
        report
    }

    fn storage_paths(&self) -> Vec<PathBuf> {
        let snap = self.snapshots.borrow();
        snap.as_ref()
            .and_then(|s| s.info.as_ref())
            .map(|info| (0..info.files.len()).filter_map(|i| info.file_path(i)).collect())
            .unwrap_or_default()
    }
}

/// Removes whatever the engine left behind, then prunes emptied directories below `root`.
async fn delete_best_effort(root: &Path, paths: &[PathBuf]) -> usize {
    let mut deleted = 0;
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => deleted += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to delete file"),
        }
    }
    for path in paths {
        let mut dir = path.parent();
        while let Some(d) = dir.filter(|d| d.starts_with(root) && *d != root) {
            if tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
    deleted
}
