//! Download engine collaborator interface.
//!
//! The engine itself (peer wire, discovery, storage) lives behind [`SwarmEngine`]. Its binding
//! is not safe to call from several threads at once, so the trait is `Send` but not `Sync` and
//! every call goes through the single worker in [`worker`].

pub mod error;
pub mod mirror;
pub mod types;
pub mod worker;

use std::{ops::RangeInclusive, time::Duration};

pub use error::EngineError;
pub use mirror::{MirrorControl, MirrorEngine, MirrorOptions};
pub use types::{
    AddDownload, DiscoveryService, EncryptionPolicy, EngineSettings, FileEntry, FilePriority,
    PieceBitfield, StorageMode, SwarmId, SwarmInfo, SwarmState, SwarmStatus, storage_path,
};
pub use worker::{EngineCommand, EngineHandle, SnapshotRx, start_worker};

pub type Result<T> = std::result::Result<T, EngineError>;

pub trait SwarmEngine: Send + 'static {
    fn apply_settings(&mut self, settings: &EngineSettings) -> Result<()>;

    fn listen_on(&mut self, ports: RangeInclusive<u16>) -> Result<u16>;

    fn start_service(&mut self, service: DiscoveryService) -> Result<()>;

    fn stop_service(&mut self, service: DiscoveryService);

    fn add_download(&mut self, params: &AddDownload) -> Result<SwarmId>;

    fn remove_download(&mut self, id: SwarmId, delete_files: bool) -> Result<()>;

    fn set_sequential(&mut self, id: SwarmId, enabled: bool) -> Result<()>;

    fn set_file_priority(&mut self, id: SwarmId, index: usize, priority: FilePriority)
    -> Result<()>;

    fn file_priorities(&self, id: SwarmId) -> Result<Vec<FilePriority>>;

    fn status(&mut self, id: SwarmId) -> Result<SwarmStatus>;

    /// Blocks until the engine confirms pending storage writes were flushed after a removal.
    /// Returns `false` when `timeout` elapses first.
    fn wait_for_flush(&mut self, timeout: Duration) -> bool;
}
