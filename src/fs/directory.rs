use super::{FsError, StreamOptions, StreamingFile};
use crate::{
    engine::{SnapshotRx, SwarmInfo, storage_path},
    pieces::Availability,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Listing row for one swarm entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub offset: u64,
    pub mtime: u64,
    pub total_pieces: u32,
    pub complete_pieces: u32,
}

/// Flat view of the swarm's file list, backed by the published engine snapshot.
#[derive(Clone)]
pub struct VirtualDirectory {
    snapshots: SnapshotRx,
    opts: StreamOptions,
}

impl VirtualDirectory {
    pub fn new(snapshots: SnapshotRx, opts: StreamOptions) -> Self {
        Self { snapshots, opts }
    }

    pub fn info(&self) -> Result<Arc<SwarmInfo>, FsError> {
        self.snapshots
            .borrow()
            .as_ref()
            .and_then(|s| s.info.clone())
            .ok_or(FsError::NotReady)
    }

    /// Waits up to `timeout` for metadata to resolve.
    pub async fn wait_for_info(&self, timeout: Duration) -> Result<Arc<SwarmInfo>, FsError> {
        let mut rx = self.snapshots.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.as_ref().is_some_and(|s| s.info.is_some())),
        )
        .await;
        match waited {
            Ok(Ok(snap)) => snap
                .as_ref()
                .and_then(|s| s.info.clone())
                .ok_or(FsError::NotReady),
            Ok(Err(_)) | Err(_) => Err(FsError::NotReady),
        }
    }

    /// Entries in swarm order with progress counted from one consistent snapshot.
    pub fn read_dir(&self) -> Result<Vec<DirEntry>, FsError> {
        let snap = self.snapshots.borrow();
        let status = snap.as_deref();
        let info = status
            .and_then(|s| s.info.as_deref())
            .ok_or(FsError::NotReady)?;
        let availability = Availability::from_status(status);
        let entries = (0..info.files.len())
            .filter_map(|index| {
                let file = StreamingFile::for_entry(info, index, self.snapshots.clone(), self.opts)?;
                let range = file.chunk_range()?;
                Some(DirEntry {
                    name: file.name().to_string(),
                    size: file.size(),
                    offset: file.swarm_offset().unwrap_or(0),
                    mtime: file.mtime(),
                    total_pieces: range.total_pieces(),
                    complete_pieces: availability.completed_pieces(range),
                })
            })
            .collect();
        Ok(entries)
    }

    /// Opens a swarm entry by relative path, falling back to a regular file under the save path.
    pub async fn open(&self, path: &str) -> Result<StreamingFile, FsError> {
        let rel = normalize(path).ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let info = self.info()?;
        if let Some((index, _)) = info.find_file(&rel) {
            return StreamingFile::for_entry(&info, index, self.snapshots.clone(), self.opts)
                .ok_or_else(|| FsError::NotFound(rel.clone()));
        }

        let hidden = rel.split('/').any(|part| part.starts_with('.'));
        let local = storage_path(&info.save_path, &rel);
        match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_file() && !hidden => {
                tracing::debug!(path = %rel, "serving local file outside the swarm");
                StreamingFile::open_local(local, rel, self.snapshots.clone(), self.opts).await
            }
            _ => Err(FsError::NotFound(rel)),
        }
    }
}

/// `/`-separated relative path without empty, `.` or `..` components.
fn normalize(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.iter().any(|p| *p == "." || *p == ".." || p.contains('\\')) {
        return None;
    }
    Some(parts.join("/"))
}
