use crate::{
    api::{self, ApiServeDeps},
    config::Config,
    engine::{EngineError, MirrorEngine, start_worker},
    fs::VirtualDirectory,
    pieces::{PriorityScheduler, select_target},
    session::{
        SessionConfig, SessionManager, ShutdownReason, ShutdownTrigger, spawn_parent_watch,
        spawn_signal_listener,
    },
    single_instance::SingleInstanceLock,
};
use anyhow::Context as _;
use std::{sync::Arc, time::Duration};

const PARENT_POLL: Duration = Duration::from_secs(1);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    if config.download.uri.trim().is_empty() {
        anyhow::bail!("no download configured: set download.uri in the config or pass --uri");
    }
    let bind_addr = config.bind_addr()?;
    let save_path = config.save_path();
    tracing::info!(
        save_path = %save_path.display(),
        bind = %bind_addr,
        keep_files = config.download.keep_files,
        "starting"
    );

    let lock = SingleInstanceLock::acquire_in(&save_path)?;
    tracing::debug!(path = %lock.path().display(), "download directory locked");

    let (engine, snapshots, worker) =
        start_worker(MirrorEngine::new(config.mirror_options()), config.poll_interval())
            .context("failed to start engine worker")?;

    let trigger = ShutdownTrigger::new();
    let signals = spawn_signal_listener(trigger.clone());
    let parent_watch = config
        .shutdown
        .watch_parent
        .then(|| spawn_parent_watch(trigger.clone(), PARENT_POLL));

    let session = Arc::new(SessionManager::new(
        engine.clone(),
        snapshots.clone(),
        SessionConfig::from_config(&config),
    ));
    let scheduler = Arc::new(PriorityScheduler::new(engine.clone()));
    let directory = VirtualDirectory::new(snapshots.clone(), config.stream_options());

    let started = async {
        let listener = api::bind(bind_addr).await?;
        session.start().await?;
        anyhow::Ok(listener)
    }
    .await;
    let listener = match started {
        Ok(listener) => listener,
        Err(err) => {
            session.shutdown().await;
            stop_engine(&engine, worker).await;
            signals.abort();
            return Err(err);
        }
    };

    let plan = tokio::spawn(apply_default_plan(
        directory.clone(),
        Arc::clone(&scheduler),
        config.target_file().map(str::to_owned),
    ));

    let stop = {
        let trigger = trigger.clone();
        async move {
            trigger.fired().await;
        }
    };
    let mut server = tokio::spawn(api::serve(
        listener,
        ApiServeDeps {
            engine: engine.clone(),
            directory,
            scheduler,
            shutdown: trigger.clone(),
            status_timeout: config.status_timeout(),
            metadata_wait: config.metadata_wait(),
        },
        stop,
    ));

    let mut server_done = false;
    let reason = tokio::select! {
        reason = trigger.fired() => reason,
        joined = &mut server => {
            server_done = true;
            match joined {
                Ok(Ok(())) => tracing::warn!("http gateway stopped unexpectedly"),
                Ok(Err(err)) => tracing::error!(error = %err, "http gateway failed"),
                Err(err) => tracing::error!(error = %err, "http gateway task panicked"),
            }
            trigger.fire(ShutdownReason::ServerStopped);
            ShutdownReason::ServerStopped
        }
    };
    tracing::info!(reason = reason.as_str(), "shutting down");

    plan.abort();
    let report = session.shutdown().await;
    if !report.errors.is_empty() {
        tracing::warn!(errors = ?report.errors, "cleanup finished with errors");
    }

    // Streams still waiting on pieces end once the worker stops publishing snapshots.
    stop_engine(&engine, worker).await;
    if !server_done && tokio::time::timeout(DRAIN_GRACE, &mut server).await.is_err() {
        tracing::warn!("open streams did not drain in time; dropping them");
        server.abort();
    }

    signals.abort();
    if let Some(watch) = parent_watch {
        watch.abort();
    }
    drop(lock);
    tracing::info!("bye");
    Ok(())
}

async fn stop_engine(engine: &crate::engine::EngineHandle, worker: std::thread::JoinHandle<()>) {
    match engine.shutdown().await {
        Ok(()) | Err(EngineError::ChannelClosed) => {}
        Err(err) => tracing::warn!(error = %err, "engine worker shutdown failed"),
    }
    match tokio::task::spawn_blocking(move || worker.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::warn!("engine worker thread panicked"),
        Err(err) => tracing::warn!(error = %err, "failed joining engine worker"),
    }
}

/// Serves the configured (or largest) file once metadata is known, unless a client already
/// picked one.
async fn apply_default_plan(
    directory: VirtualDirectory,
    scheduler: Arc<PriorityScheduler>,
    target: Option<String>,
) {
    let info = loop {
        match directory.wait_for_info(Duration::from_secs(60)).await {
            Ok(info) => break info,
            Err(_) => {
                tracing::info!("still waiting for swarm metadata");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };
    let Some(index) = select_target(&info, target.as_deref()) else {
        tracing::warn!("swarm has no files to serve");
        return;
    };
    if let Err(err) = scheduler.serve_default(info.files.len(), index).await {
        tracing::warn!(error = %err, file_index = index, "failed to apply priority plan");
    }
}
