use bitvec::prelude::{BitVec, Msb0};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Piece completion bitmap, MSB-first like the wire bitfield.
pub type PieceBitfield = BitVec<u8, Msb0>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwarmId(pub u64);

impl std::fmt::Display for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "swarm#{}", self.0)
    }
}

/// One file of the swarm's concatenated layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path relative to the save path, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Byte offset of the first byte of this file within the swarm.
    pub offset: u64,
    /// Modification time, unix seconds.
    pub mtime: u64,
}

/// Swarm metadata, known once the engine has resolved the file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmInfo {
    pub name: String,
    pub piece_length: u64,
    pub num_pieces: u32,
    pub save_path: PathBuf,
    pub files: Vec<FileEntry>,
}

impl SwarmInfo {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn file_path(&self, index: usize) -> Option<PathBuf> {
        self.files
            .get(index)
            .map(|f| storage_path(&self.save_path, &f.path))
    }

    pub fn find_file(&self, rel_path: &str) -> Option<(usize, &FileEntry)> {
        let rel_path = rel_path.trim_start_matches('/');
        self.files.iter().enumerate().find(|(_, f)| f.path == rel_path)
    }
}

/// Resolves a `/`-separated entry path under `save_path`.
pub fn storage_path(save_path: &Path, rel_path: &str) -> PathBuf {
    let mut out = save_path.to_path_buf();
    for part in rel_path.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmState {
    QueuedForChecking,
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Allocating,
    CheckingResumeData,
}

impl SwarmState {
    pub fn code(self) -> i32 {
        match self {
            Self::QueuedForChecking => 0,
            Self::CheckingFiles => 1,
            Self::DownloadingMetadata => 2,
            Self::Downloading => 3,
            Self::Finished => 4,
            Self::Seeding => 5,
            Self::Allocating => 6,
            Self::CheckingResumeData => 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwarmStatus {
    pub state: SwarmState,
    /// 0.0..=1.0
    pub progress: f32,
    /// bytes/s
    pub download_rate: u64,
    /// bytes/s
    pub upload_rate: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub pieces: PieceBitfield,
    /// Per-file priorities; empty before metadata.
    pub file_priorities: Vec<FilePriority>,
    pub info: Option<Arc<SwarmInfo>>,
}

impl SwarmStatus {
    pub fn has_metadata(&self) -> bool {
        self.info.is_some()
    }

    /// Whether the engine still fetches file `index`. Unknown files count as wanted.
    pub fn is_wanted(&self, index: usize) -> bool {
        self.file_priorities
            .get(index)
            .is_none_or(|p| p.is_wanted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePriority {
    /// Do not fetch.
    Suppressed,
    /// Engine default before any plan is applied.
    Normal,
    /// Fetch eagerly.
    Active,
}

impl FilePriority {
    pub fn level(self) -> u8 {
        match self {
            Self::Suppressed => 0,
            Self::Normal => 4,
            Self::Active => 6,
        }
    }

    pub fn is_wanted(self) -> bool {
        !matches!(self, Self::Suppressed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscoveryService {
    Dht,
    Lsd,
    Upnp,
    NatPmp,
}

impl DiscoveryService {
    pub const ALL: [DiscoveryService; 4] = [Self::Dht, Self::Lsd, Self::Upnp, Self::NatPmp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dht => "dht",
            Self::Lsd => "lsd",
            Self::Upnp => "upnp",
            Self::NatPmp => "natpmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Sparse,
    Allocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    Enabled,
    Forced,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub connection_speed: u32,
    pub request_timeout: Duration,
    pub peer_connect_timeout: Duration,
    /// bytes/s, 0 = unlimited
    pub download_rate_limit: u64,
    /// bytes/s, 0 = unlimited
    pub upload_rate_limit: u64,
    pub encryption: EncryptionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddDownload {
    pub uri: String,
    pub save_path: PathBuf,
    pub storage_mode: StorageMode,
}
