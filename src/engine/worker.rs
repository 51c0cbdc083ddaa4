//! Engine call serializer.
//!
//! One dedicated OS thread owns the [`SwarmEngine`] and drains a FIFO command queue, so the
//! engine is never entered from two threads. Between commands it publishes a status snapshot
//! of the attached download on a `watch` channel; readers that only need the piece bitmap
//! use that snapshot instead of queueing.

use super::{
    AddDownload, DiscoveryService, EngineError, EngineSettings, FilePriority, Result,
    SwarmEngine, SwarmId, SwarmStatus,
};
use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};

const QUEUE_DEPTH: usize = 128;

pub type SnapshotRx = watch::Receiver<Option<Arc<SwarmStatus>>>;

#[derive(Debug)]
pub enum EngineCommand {
    ApplySettings {
        settings: EngineSettings,
        reply: oneshot::Sender<Result<()>>,
    },
    ListenOn {
        ports: RangeInclusive<u16>,
        reply: oneshot::Sender<Result<u16>>,
    },
    StartService {
        service: DiscoveryService,
        reply: oneshot::Sender<Result<()>>,
    },
    StopService {
        service: DiscoveryService,
        reply: oneshot::Sender<()>,
    },
    AddDownload {
        params: AddDownload,
        reply: oneshot::Sender<Result<SwarmId>>,
    },
    RemoveDownload {
        delete_files: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSequential {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetFilePriority {
        index: usize,
        priority: FilePriority,
        reply: oneshot::Sender<Result<()>>,
    },
    FilePriorities {
        reply: oneshot::Sender<Result<Vec<FilePriority>>>,
    },
    Status {
        reply: oneshot::Sender<Result<SwarmStatus>>,
    },
    WaitForFlush {
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn apply_settings(&self, settings: EngineSettings) -> Result<()> {
        self.request(|reply| EngineCommand::ApplySettings { settings, reply })
            .await?
    }

    pub async fn listen_on(&self, ports: RangeInclusive<u16>) -> Result<u16> {
        self.request(|reply| EngineCommand::ListenOn { ports, reply })
            .await?
    }

    pub async fn start_service(&self, service: DiscoveryService) -> Result<()> {
        self.request(|reply| EngineCommand::StartService { service, reply })
            .await?
    }

    pub async fn stop_service(&self, service: DiscoveryService) -> Result<()> {
        self.request(|reply| EngineCommand::StopService { service, reply })
            .await
    }

    pub async fn add_download(&self, params: AddDownload) -> Result<SwarmId> {
        self.request(|reply| EngineCommand::AddDownload { params, reply })
            .await?
    }

    pub async fn remove_download(&self, delete_files: bool) -> Result<()> {
        self.request(|reply| EngineCommand::RemoveDownload {
            delete_files,
            reply,
        })
        .await?
    }

    pub async fn set_sequential(&self, enabled: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetSequential { enabled, reply })
            .await?
    }

    pub async fn set_file_priority(&self, index: usize, priority: FilePriority) -> Result<()> {
        self.request(|reply| EngineCommand::SetFilePriority {
            index,
            priority,
            reply,
        })
        .await?
    }

    pub async fn file_priorities(&self) -> Result<Vec<FilePriority>> {
        self.request(|reply| EngineCommand::FilePriorities { reply })
            .await?
    }

    pub async fn status(&self) -> Result<SwarmStatus> {
        self.request(|reply| EngineCommand::Status { reply }).await?
    }

    pub async fn wait_for_flush(&self, timeout: Duration) -> Result<bool> {
        self.request(|reply| EngineCommand::WaitForFlush { timeout, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }
}

/// Spawns the worker thread. The returned join handle resolves once the queue is drained after
/// [`EngineHandle::shutdown`] or once every handle has been dropped.
pub fn start_worker<E: SwarmEngine>(
    engine: E,
    poll_interval: Duration,
) -> std::io::Result<(EngineHandle, SnapshotRx, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let join = std::thread::Builder::new()
        .name("engine-worker".to_string())
        .spawn(move || {
            runtime.block_on(run_worker(engine, rx, snapshot_tx, poll_interval));
        })?;
    Ok((EngineHandle { tx }, snapshot_rx, join))
}

struct Worker<E> {
    engine: E,
    attached: Option<SwarmId>,
    snapshot_tx: watch::Sender<Option<Arc<SwarmStatus>>>,
}

async fn run_worker<E: SwarmEngine>(
    engine: E,
    mut rx: mpsc::Receiver<EngineCommand>,
    snapshot_tx: watch::Sender<Option<Arc<SwarmStatus>>>,
    poll_interval: Duration,
) {
    let mut worker = Worker {
        engine,
        attached: None,
        snapshot_tx,
    };
    let mut tick = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::debug!("engine worker started");
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                if !worker.handle(cmd) {
                    break;
                }
                worker.publish();
            }
            _ = tick.tick() => worker.publish(),
        }
    }
    worker.snapshot_tx.send_replace(None);
    tracing::debug!("engine worker stopped");
}

impl<E: SwarmEngine> Worker<E> {
    fn attached(&self) -> Result<SwarmId> {
        self.attached.ok_or(EngineError::NoDownload)
    }

    /// Returns `false` when the worker should stop.
    fn handle(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::ApplySettings { settings, reply } => {
                let _ = reply.send(logged("apply_settings", self.engine.apply_settings(&settings)));
            }
            EngineCommand::ListenOn { ports, reply } => {
                let _ = reply.send(logged("listen_on", self.engine.listen_on(ports)));
            }
            EngineCommand::StartService { service, reply } => {
                let _ = reply.send(logged("start_service", self.engine.start_service(service)));
            }
            EngineCommand::StopService { service, reply } => {
                self.engine.stop_service(service);
                let _ = reply.send(());
            }
            EngineCommand::AddDownload { params, reply } => {
                let result = self.engine.add_download(&params);
                if let Ok(id) = result {
                    self.attached = Some(id);
                }
                let _ = reply.send(logged("add_download", result));
            }
            EngineCommand::RemoveDownload {
                delete_files,
                reply,
            } => {
                let result = self.attached().and_then(|id| {
                    self.engine.remove_download(id, delete_files)?;
                    self.attached = None;
                    Ok(())
                });
                let _ = reply.send(logged("remove_download", result));
            }
            EngineCommand::SetSequential { enabled, reply } => {
                let result = self
                    .attached()
                    .and_then(|id| self.engine.set_sequential(id, enabled));
                let _ = reply.send(logged("set_sequential", result));
            }
            EngineCommand::SetFilePriority {
                index,
                priority,
                reply,
            } => {
                let result = self
                    .attached()
                    .and_then(|id| self.engine.set_file_priority(id, index, priority));
                let _ = reply.send(logged("set_file_priority", result));
            }
            EngineCommand::FilePriorities { reply } => {
                let result = self
                    .attached()
                    .and_then(|id| self.engine.file_priorities(id));
                let _ = reply.send(result);
            }
            EngineCommand::Status { reply } => {
                let result = self.attached().and_then(|id| self.engine.status(id));
                let _ = reply.send(result);
            }
            EngineCommand::WaitForFlush { timeout, reply } => {
                let _ = reply.send(self.engine.wait_for_flush(timeout));
            }
            EngineCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn publish(&mut self) {
        let snapshot = match self.attached {
            Some(id) => match self.engine.status(id) {
                Ok(status) => Some(Arc::new(status)),
                Err(err) => {
                    if crate::logging::warn_throttled("engine_snapshot", Duration::from_secs(10)) {
                        tracing::warn!(error = %err, "failed to snapshot engine status");
                    }
                    return;
                }
            },
            None => None,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn logged<T>(op: &'static str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        tracing::warn!(op, error = %err, "engine command failed");
    }
    result
}
