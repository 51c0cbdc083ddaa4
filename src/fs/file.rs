//! Streaming file adapter.
//!
//! A file-like cursor over one swarm entry. Reads block until the chunks under the requested
//! bytes are present in the published snapshot; storage is opened lazily once the engine has
//! created it. A seek that lands in the trailing window while the chunk there is missing arms a
//! one-shot "virtual read": the next read returns `Ok(0)` without blocking, so container probers
//! looking for trailers or indices do not stall on data playback has not reached.

use super::FsError;
use crate::{
    engine::{EngineError, FileEntry, SnapshotRx, SwarmInfo, storage_path},
    pieces::{Availability, ChunkRange, chunk_of, chunks_for_bytes, range_of},
};
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Trailing window (bytes before EOF) in which a seek onto a missing chunk arms a virtual read.
    pub end_window: u64,
    pub poll_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            end_window: 100 * 1024,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Opening,
    Open,
    Closed,
}

enum Backing {
    Swarm {
        index: usize,
        entry: FileEntry,
        piece_length: u64,
        storage: PathBuf,
    },
    Local {
        name: String,
        path: PathBuf,
        size: u64,
        mtime: u64,
    },
}

enum Handle {
    Pending,
    Open(tokio::fs::File),
    Closed,
}

pub struct StreamingFile {
    backing: Backing,
    handle: Handle,
    cursor: u64,
    virtual_read: bool,
    snapshots: SnapshotRx,
    opts: StreamOptions,
}

impl StreamingFile {
    pub(crate) fn for_entry(
        info: &SwarmInfo,
        index: usize,
        snapshots: SnapshotRx,
        opts: StreamOptions,
    ) -> Option<Self> {
        let entry = info.files.get(index)?.clone();
        let storage = storage_path(&info.save_path, &entry.path);
        Some(Self {
            backing: Backing::Swarm {
                index,
                entry,
                piece_length: info.piece_length,
                storage,
            },
            handle: Handle::Pending,
            cursor: 0,
            virtual_read: false,
            snapshots,
            opts,
        })
    }

    /// Plain on-disk file outside the swarm; opened immediately.
    pub(crate) async fn open_local(
        path: PathBuf,
        name: String,
        snapshots: SnapshotRx,
        opts: StreamOptions,
    ) -> Result<Self, FsError> {
        let file = tokio::fs::File::open(&path).await?;
        let meta = file.metadata().await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Self {
            backing: Backing::Local {
                name,
                path,
                size: meta.len(),
                mtime,
            },
            handle: Handle::Open(file),
            cursor: 0,
            virtual_read: false,
            snapshots,
            opts,
        })
    }

    pub fn name(&self) -> &str {
        match &self.backing {
            Backing::Swarm { entry, .. } => &entry.path,
            Backing::Local { name, .. } => name,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.backing {
            Backing::Swarm { entry, .. } => entry.size,
            Backing::Local { size, .. } => *size,
        }
    }

    pub fn mtime(&self) -> u64 {
        match &self.backing {
            Backing::Swarm { entry, .. } => entry.mtime,
            Backing::Local { mtime, .. } => *mtime,
        }
    }

    /// Byte offset within the swarm; `None` for local files.
    pub fn swarm_offset(&self) -> Option<u64> {
        match &self.backing {
            Backing::Swarm { entry, .. } => Some(entry.offset),
            Backing::Local { .. } => None,
        }
    }

    /// Index of the swarm entry; `None` for local files.
    pub fn file_index(&self) -> Option<usize> {
        match &self.backing {
            Backing::Swarm { index, .. } => Some(*index),
            Backing::Local { .. } => None,
        }
    }

    pub fn chunk_range(&self) -> Option<ChunkRange> {
        match &self.backing {
            Backing::Swarm {
                entry,
                piece_length,
                ..
            } => Some(range_of(entry, *piece_length)),
            Backing::Local { .. } => None,
        }
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn state(&self) -> AdapterState {
        match self.handle {
            Handle::Pending => AdapterState::Opening,
            Handle::Open(_) => AdapterState::Open,
            Handle::Closed => AdapterState::Closed,
        }
    }

    pub fn virtual_read_pending(&self) -> bool {
        self.virtual_read
    }

    fn storage(&self) -> &Path {
        match &self.backing {
            Backing::Swarm { storage, .. } => storage,
            Backing::Local { path, .. } => path,
        }
    }

    /// Reads at most one chunk's worth of bytes at the cursor, waiting for the chunks under them.
    /// `Ok(0)` means end of file, or a consumed virtual read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if matches!(self.handle, Handle::Closed) {
            return Err(FsError::Closed);
        }
        if self.virtual_read {
            self.virtual_read = false;
            tracing::debug!(file = %self.name(), offset = self.cursor, "virtual read");
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let want = match &self.backing {
            Backing::Local { .. } => buf.len(),
            Backing::Swarm {
                index,
                entry,
                piece_length,
                ..
            } => {
                let index = *index;
                let remaining = entry.size.saturating_sub(self.cursor);
                if remaining == 0 {
                    return Ok(0);
                }
                let want = (buf.len() as u64).min(*piece_length).min(remaining);
                let (first, last) =
                    chunks_for_bytes(entry.offset, self.cursor, want, *piece_length);
                self.wait_for_chunks(index, first, last).await?;
                want as usize
            }
        };

        let n = {
            let file = self.ensure_open().await?;
            file.read(&mut buf[..want]).await?
        };
        self.cursor += n as u64;
        Ok(n)
    }

    /// Moves the cursor and re-evaluates the virtual-read condition for the new offset.
    /// Never waits for data; that happens on the next read.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        if matches!(self.handle, Handle::Closed) {
            return Err(FsError::Closed);
        }
        let size = self.size();
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.cursor.checked_add_signed(delta),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            FsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ))
        })?;

        self.virtual_read = match &self.backing {
            Backing::Swarm {
                entry,
                piece_length,
                ..
            } if size.saturating_sub(target) < self.opts.end_window => {
                let (chunk, _) = chunk_of(entry.offset, target, *piece_length);
                let snap = self.snapshots.borrow();
                !Availability::from_status(snap.as_deref()).is_present(chunk)
            }
            _ => false,
        };
        if self.virtual_read {
            tracing::debug!(file = %self.name(), offset = target, "virtual seek");
        }

        if let Handle::Open(file) = &mut self.handle {
            file.seek(SeekFrom::Start(target)).await?;
        }
        self.cursor = target;
        Ok(target)
    }

    /// Releases the storage handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if !matches!(self.handle, Handle::Closed) {
            tracing::trace!(file = %self.name(), "closing file");
        }
        self.handle = Handle::Closed;
    }

    /// Waits until chunks `first..=last` are present. Gives up with `Deselected` once the engine
    /// no longer fetches file `index`, since those chunks would never arrive.
    async fn wait_for_chunks(&mut self, index: usize, first: u32, last: u32) -> Result<(), FsError> {
        let mut announced = false;
        loop {
            let (ready, wanted) = {
                let snap = self.snapshots.borrow_and_update();
                let status = snap.as_deref();
                (
                    Availability::from_status(status).all_present(first, last),
                    status.is_none_or(|s| s.is_wanted(index)),
                )
            };
            if ready {
                return Ok(());
            }
            if !wanted {
                tracing::info!(file = %self.name(), first, last, "file deselected while waiting");
                return Err(FsError::Deselected);
            }
            if !announced {
                tracing::debug!(file = %self.name(), first, last, "waiting for pieces");
                announced = true;
            }
            match tokio::time::timeout(self.opts.poll_interval, self.snapshots.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(_)) => return Err(FsError::Engine(EngineError::ChannelClosed)),
            }
        }
    }

    async fn ensure_open(&mut self) -> Result<&mut tokio::fs::File, FsError> {
        if matches!(self.handle, Handle::Pending) {
            let path = self.storage().to_path_buf();
            while !tokio::fs::try_exists(&path).await? {
                if crate::logging::warn_throttled("storage_pending", Duration::from_secs(5)) {
                    tracing::warn!(path = %path.display(), "waiting for storage to be created");
                }
                tokio::time::sleep(self.opts.poll_interval).await;
            }
            let mut file = tokio::fs::File::open(&path).await?;
            if self.cursor > 0 {
                file.seek(SeekFrom::Start(self.cursor)).await?;
            }
            self.handle = Handle::Open(file);
        }
        match &mut self.handle {
            Handle::Open(file) => Ok(file),
            Handle::Pending | Handle::Closed => Err(FsError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        AddDownload, EngineHandle, MirrorControl, MirrorEngine, MirrorOptions, StorageMode,
        start_worker,
    };
    use std::sync::Arc;

    const CHUNK: u64 = 16_384;

    struct Fixture {
        _tmp: tempfile::TempDir,
        handle: EngineHandle,
        control: MirrorControl,
        snapshots: SnapshotRx,
        join: Option<std::thread::JoinHandle<()>>,
    }

    impl Fixture {
        async fn new(size: usize) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let seed = tmp.path().join("movie.mkv");
            std::fs::write(&seed, content(size)).unwrap();
            let engine = MirrorEngine::new(MirrorOptions {
                piece_length: CHUNK,
                rate: 0,
                ..MirrorOptions::default()
            });
            let control = engine.control();
            let (handle, snapshots, join) =
                start_worker(engine, Duration::from_millis(5)).expect("worker");
            handle
                .add_download(AddDownload {
                    uri: seed.display().to_string(),
                    save_path: tmp.path().join("out"),
                    storage_mode: StorageMode::Sparse,
                })
                .await
                .expect("add");
            Self {
                _tmp: tmp,
                handle,
                control,
                snapshots,
                join: Some(join),
            }
        }

        async fn info(&mut self) -> Arc<SwarmInfo> {
            let guard = self
                .snapshots
                .wait_for(|s| s.as_ref().is_some_and(|s| s.info.is_some()))
                .await
                .unwrap();
            let status: Option<Arc<crate::engine::SwarmStatus>> = Option::clone(&guard);
            status.and_then(|s| s.info.clone()).unwrap()
        }

        async fn open(&mut self) -> StreamingFile {
            let info = self.info().await;
            StreamingFile::for_entry(&info, 0, self.snapshots.clone(), opts()).unwrap()
        }

        async fn finish(mut self) {
            self.handle.shutdown().await.unwrap();
            if let Some(join) = self.join.take() {
                join.join().unwrap();
            }
        }
    }

    fn opts() -> StreamOptions {
        StreamOptions {
            end_window: 100 * 1024,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn read_blocks_until_chunk_zero_arrives() {
        let mut fx = Fixture::new(40_000).await;
        let mut file = fx.open().await;
        assert_eq!(file.chunk_range(), Some(ChunkRange { first: 0, last: 3 }));
        assert_eq!(file.state(), AdapterState::Opening);

        let mut buf = [0u8; 100];
        let blocked = tokio::time::timeout(Duration::from_millis(60), file.read(&mut buf)).await;
        assert!(blocked.is_err(), "read must wait for chunk 0");

        fx.control.complete_piece(0).unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), file.read(&mut buf))
            .await
            .expect("read after arrival")
            .expect("read ok");
        assert_eq!(n, 100);
        assert_eq!(&buf[..], &content(40_000)[..100]);
        assert_eq!(file.position(), 100);
        assert_eq!(file.state(), AdapterState::Open);

        file.close();
        fx.finish().await;
    }

    #[tokio::test]
    async fn reads_are_narrowed_to_one_chunk() {
        let mut fx = Fixture::new(40_000).await;
        fx.control.complete_all().unwrap();
        let mut file = fx.open().await;

        let mut buf = vec![0u8; 64 * 1024];
        let mut total = Vec::new();
        loop {
            let n = file.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(n as u64 <= CHUNK);
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, content(40_000));
        fx.finish().await;
    }

    #[tokio::test]
    async fn tail_seek_onto_missing_chunk_yields_one_virtual_read() {
        // Container trailers (e.g. an index at the end of the file) are probed before playback
        // reaches them; the tail window lets the prober see EOF instead of stalling.
        let mut fx = Fixture::new(200_000).await;
        fx.control.complete_piece(0).unwrap();
        let mut file = fx.open().await;

        let pos = file.seek(SeekFrom::End(-1_000)).await.unwrap();
        assert_eq!(pos, 199_000);
        assert!(file.virtual_read_pending());

        let mut buf = [0u8; 512];
        assert_eq!(file.read(&mut buf).await.unwrap(), 0);
        assert!(!file.virtual_read_pending());

        // The following read is a normal one and blocks on the missing tail chunk.
        let blocked = tokio::time::timeout(Duration::from_millis(60), file.read(&mut buf)).await;
        assert!(blocked.is_err());

        let (tail, _) = chunk_of(0, 199_000, CHUNK);
        fx.control.complete_piece(tail).unwrap();
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(n, 512);
        assert_eq!(&buf[..], &content(200_000)[199_000..199_512]);
        fx.finish().await;
    }

    #[tokio::test]
    async fn tail_seek_onto_present_chunk_or_outside_window_reads_normally() {
        let mut fx = Fixture::new(200_000).await;
        let mut file = fx.open().await;

        file.seek(SeekFrom::Start(10)).await.unwrap();
        assert!(!file.virtual_read_pending());

        let (tail, _) = chunk_of(0, 199_000, CHUNK);
        fx.control.complete_piece(tail).unwrap();
        fx.snapshots
            .wait_for(|s| s.as_ref().is_some_and(|s| s.pieces[tail as usize]))
            .await
            .unwrap();
        file.seek(SeekFrom::Start(199_000)).await.unwrap();
        assert!(!file.virtual_read_pending());

        // Disarmed again by a later seek outside the window.
        file.seek(SeekFrom::End(-10)).await.unwrap();
        file.seek(SeekFrom::Start(0)).await.unwrap();
        assert!(!file.virtual_read_pending());
        fx.finish().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_io() {
        let mut fx = Fixture::new(1_000).await;
        fx.control.complete_all().unwrap();
        let mut file = fx.open().await;
        let mut buf = [0u8; 10];
        file.read(&mut buf).await.unwrap();

        file.close();
        file.close();
        assert_eq!(file.state(), AdapterState::Closed);
        assert!(matches!(file.read(&mut buf).await, Err(FsError::Closed)));
        assert!(matches!(
            file.seek(SeekFrom::Start(0)).await,
            Err(FsError::Closed)
        ));
        fx.finish().await;
    }

    #[tokio::test]
    async fn waiting_read_ends_when_file_is_deselected() {
        let mut fx = Fixture::new(40_000).await;
        fx.control.complete_piece(0).unwrap();
        let mut file = fx.open().await;
        fx.handle
            .set_file_priority(0, crate::engine::FilePriority::Suppressed)
            .await
            .unwrap();

        // Chunks already on disk stay readable.
        let mut buf = vec![0u8; CHUNK as usize];
        assert_eq!(file.read(&mut buf).await.unwrap(), CHUNK as usize);

        let next = tokio::time::timeout(Duration::from_secs(2), file.read(&mut buf))
            .await
            .expect("wait must end once the file is deselected");
        assert!(matches!(next, Err(FsError::Deselected)));
        fx.finish().await;
    }

    #[tokio::test]
    async fn seek_before_start_is_rejected() {
        let mut fx = Fixture::new(1_000).await;
        let mut file = fx.open().await;
        assert!(matches!(
            file.seek(SeekFrom::Current(-1)).await,
            Err(FsError::Io(_))
        ));
        fx.finish().await;
    }
}
