//! Shutdown triggers: process signals, parent-process death and explicit requests all fire one
//! shared [`ShutdownTrigger`]. The first reason wins; later ones are ignored.

use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    ParentExited,
    Requested,
    ServerStopped,
}

impl ShutdownReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::ParentExited => "parent_exited",
            Self::Requested => "requested",
            Self::ServerStopped => "server_stopped",
        }
    }
}

#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call was the one that fired the trigger.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        let fired = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if fired {
            tracing::info!(reason = reason.as_str(), "shutdown requested");
        }
        fired
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    pub async fn fired(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Fires the trigger on Ctrl-C or SIGTERM.
pub fn spawn_signal_listener(trigger: ShutdownTrigger) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let reason = tokio::select! {
            _ = ctrl_c => ShutdownReason::Interrupt,
            _ = terminate => ShutdownReason::Terminate,
        };
        trigger.fire(reason);
    })
}

/// Fires the trigger once the process that launched us is gone (it gets reparented).
#[cfg(unix)]
pub fn spawn_parent_watch(trigger: ShutdownTrigger, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let original = std::os::unix::process::parent_id();
        tracing::debug!(ppid = original, "watching parent process");
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let current = std::os::unix::process::parent_id();
            if current != original {
                tracing::warn!(ppid = original, now = current, "parent process exited");
                trigger.fire(ShutdownReason::ParentExited);
                return;
            }
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_parent_watch(_trigger: ShutdownTrigger, _every: Duration) -> JoinHandle<()> {
    tracing::debug!("parent process watch unsupported on this platform");
    tokio::spawn(async {})
}
