//! Engine that "downloads" a swarm from a local seed file or directory.
//!
//! Pieces are copied from the seed into the save path by a filler thread that honours file
//! priorities and sequential mode, which makes it a faithful stand-in for a real engine when
//! serving local content and a controllable one in tests (`rate = 0` plus [`MirrorControl`]).

use super::{
    AddDownload, DiscoveryService, EngineError, EngineSettings, FileEntry, FilePriority,
    PieceBitfield, Result, StorageMode, SwarmEngine, SwarmId, SwarmInfo, SwarmState, SwarmStatus,
    storage_path,
};
use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener},
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
    time::{Duration, Instant, UNIX_EPOCH},
};

const METADATA_POLL: Duration = Duration::from_millis(10);
const IDLE_POLL: Duration = Duration::from_millis(50);
const WRITE_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub piece_length: u64,
    /// Fill rate in bytes/s. `0` leaves piece completion to [`MirrorControl`].
    pub rate: u64,
    pub metadata_delay: Duration,
    /// Keep metadata unresolved until [`MirrorControl::release_metadata`].
    pub hold_metadata: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            piece_length: 256 * 1024,
            rate: 4 * 1024 * 1024,
            metadata_delay: Duration::ZERO,
            hold_metadata: false,
        }
    }
}

struct Swarm {
    info: Arc<SwarmInfo>,
    sources: Vec<PathBuf>,
    metadata_ready: bool,
    hold_metadata: bool,
    metadata_delay: Duration,
    added_at: Instant,
    pieces: PieceBitfield,
    priorities: Vec<FilePriority>,
    sequential: bool,
    storage_mode: StorageMode,
    stopped: bool,
    filling: bool,
    in_flight: Option<u32>,
    downloaded: u64,
    rate_mark: (Instant, u64),
    last_rate: u64,
}

struct SwarmCell {
    swarm: Mutex<Swarm>,
    wake: Condvar,
}

#[derive(Default)]
struct RegistryInner {
    swarms: HashMap<SwarmId, Arc<SwarmCell>>,
    latest: Option<SwarmId>,
    flush_confirmed: bool,
    flush_stalled: bool,
    removals: u32,
}

#[derive(Default)]
struct Registry {
    inner: Mutex<RegistryInner>,
    flushed: Condvar,
}

pub struct MirrorEngine {
    opts: MirrorOptions,
    settings: Option<EngineSettings>,
    listener: Option<TcpListener>,
    services: BTreeSet<DiscoveryService>,
    next_id: u64,
    registry: Arc<Registry>,
    fillers: HashMap<SwarmId, JoinHandle<()>>,
}

/// Test and tooling access to the most recently added swarm of a [`MirrorEngine`].
#[derive(Clone)]
pub struct MirrorControl {
    registry: Arc<Registry>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("mirror engine lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    }
}

impl MirrorEngine {
    pub fn new(opts: MirrorOptions) -> Self {
        Self {
            opts,
            settings: None,
            listener: None,
            services: BTreeSet::new(),
            next_id: 1,
            registry: Arc::new(Registry::default()),
            fillers: HashMap::new(),
        }
    }

    pub fn control(&self) -> MirrorControl {
        MirrorControl {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn running_services(&self) -> Vec<DiscoveryService> {
        self.services.iter().copied().collect()
    }

    fn cell(&self, id: SwarmId) -> Result<Arc<SwarmCell>> {
        lock(&self.registry.inner)
            .swarms
            .get(&id)
            .cloned()
            .ok_or(EngineError::NoDownload)
    }

    fn effective_rate(&self) -> u64 {
        let limit = self
            .settings
            .as_ref()
            .map(|s| s.download_rate_limit)
            .unwrap_or(0);
        match (self.opts.rate, limit) {
            (0, _) => 0,
            (rate, 0) => rate,
            (rate, limit) => rate.min(limit),
        }
    }
}

impl SwarmEngine for MirrorEngine {
    fn apply_settings(&mut self, settings: &EngineSettings) -> Result<()> {
        tracing::debug!(
            connection_speed = settings.connection_speed,
            request_timeout_ms = settings.request_timeout.as_millis() as u64,
            peer_connect_timeout_ms = settings.peer_connect_timeout.as_millis() as u64,
            download_rate_limit = settings.download_rate_limit,
            upload_rate_limit = settings.upload_rate_limit,
            encryption = ?settings.encryption,
            "mirror engine settings applied"
        );
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn listen_on(&mut self, ports: RangeInclusive<u16>) -> Result<u16> {
        if ports.is_empty() {
            return Err(EngineError::command_failed(
                "listen_on",
                "empty port range",
            ));
        }
        let mut last_err = None;
        for port in ports {
            match TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)) {
                Ok(listener) => {
                    let bound = listener.local_addr()?.port();
                    self.listener = Some(listener);
                    return Ok(bound);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(EngineError::command_failed(
            "listen_on",
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no port available".to_string()),
        ))
    }

    fn start_service(&mut self, service: DiscoveryService) -> Result<()> {
        self.services.insert(service);
        Ok(())
    }

    fn stop_service(&mut self, service: DiscoveryService) {
        self.services.remove(&service);
    }

    fn add_download(&mut self, params: &AddDownload) -> Result<SwarmId> {
        let (name, seed) = scan_seed(&params.uri)?;
        if self.opts.piece_length == 0 {
            return Err(EngineError::command_failed(
                "add_download",
                "piece length must be non-zero",
            ));
        }

        let mut files = Vec::with_capacity(seed.len());
        let mut sources = Vec::with_capacity(seed.len());
        let mut offset = 0u64;
        for item in seed {
            files.push(FileEntry {
                path: item.rel_path,
                size: item.size,
                offset,
                mtime: item.mtime,
            });
            offset += item.size;
            sources.push(item.source);
        }
        let num_pieces = offset.div_ceil(self.opts.piece_length) as u32;
        let info = Arc::new(SwarmInfo {
            name,
            piece_length: self.opts.piece_length,
            num_pieces,
            save_path: params.save_path.clone(),
            files,
        });

        let id = SwarmId(self.next_id);
        self.next_id += 1;
        let now = Instant::now();
        let mut swarm = Swarm {
            priorities: vec![FilePriority::Normal; info.files.len()],
            pieces: PieceBitfield::repeat(false, num_pieces as usize),
            info,
            sources,
            metadata_ready: false,
            hold_metadata: self.opts.hold_metadata,
            metadata_delay: self.opts.metadata_delay,
            added_at: now,
            sequential: false,
            storage_mode: params.storage_mode,
            stopped: false,
            filling: false,
            in_flight: None,
            downloaded: 0,
            rate_mark: (now, 0),
            last_rate: 0,
        };
        swarm.ensure_metadata()?;

        let rate = self.effective_rate();
        swarm.filling = rate > 0;
        let cell = Arc::new(SwarmCell {
            swarm: Mutex::new(swarm),
            wake: Condvar::new(),
        });

        {
            let mut inner = lock(&self.registry.inner);
            inner.swarms.insert(id, Arc::clone(&cell));
            inner.latest = Some(id);
        }

        if rate > 0 {
            let filler = std::thread::Builder::new()
                .name(format!("mirror-filler-{}", id.0))
                .spawn(move || run_filler(cell, rate))?;
            self.fillers.insert(id, filler);
        }
        Ok(id)
    }

    fn remove_download(&mut self, id: SwarmId, delete_files: bool) -> Result<()> {
        let cell = {
            let mut inner = lock(&self.registry.inner);
            let cell = inner.swarms.remove(&id).ok_or(EngineError::NoDownload)?;
            if inner.latest == Some(id) {
                inner.latest = None;
            }
            cell
        };
        let info = {
            let mut swarm = lock(&cell.swarm);
            swarm.stopped = true;
            Arc::clone(&swarm.info)
        };
        cell.wake.notify_all();
        if let Some(filler) = self.fillers.remove(&id)
            && filler.join().is_err()
        {
            tracing::warn!(swarm = %id, "mirror filler thread panicked");
        }

        let stalled = {
            let mut inner = lock(&self.registry.inner);
            inner.removals += 1;
            inner.flush_stalled
        };
        if stalled {
            tracing::debug!(swarm = %id, "flush stalled; leaving storage untouched");
            return Ok(());
        }

        if delete_files {
            delete_storage(&info);
        }

        lock(&self.registry.inner).flush_confirmed = true;
        self.registry.flushed.notify_all();
        Ok(())
    }

    fn set_sequential(&mut self, id: SwarmId, enabled: bool) -> Result<()> {
        let cell = self.cell(id)?;
        lock(&cell.swarm).sequential = enabled;
        cell.wake.notify_all();
        Ok(())
    }

    fn set_file_priority(
        &mut self,
        id: SwarmId,
        index: usize,
        priority: FilePriority,
    ) -> Result<()> {
        let cell = self.cell(id)?;
        {
            let mut swarm = lock(&cell.swarm);
            swarm.require_metadata("set_file_priority")?;
            let slot = swarm
                .priorities
                .get_mut(index)
                .ok_or(EngineError::UnknownFile(index))?;
            *slot = priority;
        }
        cell.wake.notify_all();
        Ok(())
    }

    fn file_priorities(&self, id: SwarmId) -> Result<Vec<FilePriority>> {
        let cell = self.cell(id)?;
        let swarm = lock(&cell.swarm);
        swarm.require_metadata("file_priorities")?;
        Ok(swarm.priorities.clone())
    }

    fn status(&mut self, id: SwarmId) -> Result<SwarmStatus> {
        let cell = self.cell(id)?;
        let mut swarm = lock(&cell.swarm);
        swarm.ensure_metadata()?;
        Ok(swarm.status())
    }

    fn wait_for_flush(&mut self, timeout: Duration) -> bool {
        let inner = lock(&self.registry.inner);
        let (mut inner, _) = match self
            .registry
            .flushed
            .wait_timeout_while(inner, timeout, |i| !i.flush_confirmed)
        {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        let confirmed = inner.flush_confirmed;
        inner.flush_confirmed = false;
        confirmed
    }
}

impl Drop for MirrorEngine {
    fn drop(&mut self) {
        let cells: Vec<_> = lock(&self.registry.inner).swarms.values().cloned().collect();
        for cell in cells {
            lock(&cell.swarm).stopped = true;
            cell.wake.notify_all();
        }
        for (_, filler) in self.fillers.drain() {
            let _ = filler.join();
        }
    }
}

impl Swarm {
    fn require_metadata(&self, op: &'static str) -> Result<()> {
        if self.metadata_ready {
            Ok(())
        } else {
            Err(EngineError::command_failed(op, "metadata not yet available"))
        }
    }

    fn ensure_metadata(&mut self) -> std::io::Result<()> {
        if self.metadata_ready
            || self.hold_metadata
            || self.added_at.elapsed() < self.metadata_delay
        {
            return Ok(());
        }
        self.resolve_metadata()
    }

    fn resolve_metadata(&mut self) -> std::io::Result<()> {
        self.metadata_ready = true;
        self.hold_metadata = false;
        for f in &self.info.files {
            let dest = storage_path(&self.info.save_path, &f.path);
            let needs_file = f.size == 0 || matches!(self.storage_mode, StorageMode::Allocate);
            if !needs_file {
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&dest)?;
            if matches!(self.storage_mode, StorageMode::Allocate) {
                out.set_len(f.size)?;
            }
        }
        tracing::debug!(
            name = %self.info.name,
            files = self.info.files.len(),
            pieces = self.info.num_pieces,
            "mirror metadata resolved"
        );
        Ok(())
    }

    fn pick_piece(&self) -> Option<u32> {
        let mut tier = vec![0u8; self.info.num_pieces as usize];
        for (f, priority) in self.info.files.iter().zip(&self.priorities) {
            if !priority.is_wanted() || f.size == 0 {
                continue;
            }
            let pl = self.info.piece_length;
            let first = f.offset / pl;
            let last = (f.offset + f.size - 1) / pl;
            for p in first..=last {
                let slot = &mut tier[p as usize];
                *slot = (*slot).max(priority.level());
            }
        }

        let best = tier
            .iter()
            .enumerate()
            .filter(|&(p, &t)| t > 0 && !self.pieces[p] && self.in_flight != Some(p as u32))
            .map(|(_, &t)| t)
            .max()?;
        let candidates: Vec<u32> = tier
            .iter()
            .enumerate()
            .filter(|&(p, &t)| t == best && !self.pieces[p] && self.in_flight != Some(p as u32))
            .map(|(p, _)| p as u32)
            .collect();

        if self.sequential {
            candidates.first().copied()
        } else {
            candidates.get(fastrand::usize(..candidates.len())).copied()
        }
    }

    fn finish_piece(&mut self, index: u32, bytes: u64) {
        if self.in_flight == Some(index) {
            self.in_flight = None;
        }
        if self.stopped {
            return;
        }
        self.pieces.set(index as usize, true);
        self.downloaded += bytes;
    }

    fn status(&mut self) -> SwarmStatus {
        let now = Instant::now();
        let (mark_at, mark_bytes) = self.rate_mark;
        let elapsed = now.saturating_duration_since(mark_at);
        if elapsed >= Duration::from_secs(1) {
            let delta = self.downloaded.saturating_sub(mark_bytes);
            self.last_rate = delta * 1000 / (elapsed.as_millis().max(1) as u64);
            self.rate_mark = (now, self.downloaded);
        }

        if !self.metadata_ready {
            return SwarmStatus {
                state: SwarmState::DownloadingMetadata,
                progress: 0.0,
                download_rate: 0,
                upload_rate: 0,
                num_peers: u32::from(self.filling),
                num_seeds: u32::from(self.filling),
                pieces: PieceBitfield::new(),
                file_priorities: Vec::new(),
                info: None,
            };
        }

        let have = self.pieces.count_ones();
        let total = self.info.num_pieces as usize;
        let complete = have == total;
        let progress = if total == 0 {
            1.0
        } else {
            have as f32 / total as f32
        };
        let active = self.filling && !complete;
        SwarmStatus {
            state: if complete {
                SwarmState::Seeding
            } else {
                SwarmState::Downloading
            },
            progress,
            download_rate: if complete { 0 } else { self.last_rate },
            upload_rate: 0,
            num_peers: u32::from(active),
            num_seeds: u32::from(active),
            pieces: self.pieces.clone(),
            file_priorities: self.priorities.clone(),
            info: Some(Arc::clone(&self.info)),
        }
    }
}

impl MirrorControl {
    fn latest(&self) -> std::io::Result<Arc<SwarmCell>> {
        let inner = lock(&self.registry.inner);
        inner
            .latest
            .and_then(|id| inner.swarms.get(&id).cloned())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no mirror swarm"))
    }

    pub fn release_metadata(&self) -> std::io::Result<()> {
        let cell = self.latest()?;
        let mut swarm = lock(&cell.swarm);
        if !swarm.metadata_ready {
            swarm.resolve_metadata()?;
        }
        drop(swarm);
        cell.wake.notify_all();
        Ok(())
    }

    /// Copies one piece from the seed into storage and marks it present.
    pub fn complete_piece(&self, index: u32) -> std::io::Result<()> {
        let cell = self.latest()?;
        let (info, sources) = {
            let swarm = lock(&cell.swarm);
            if !swarm.metadata_ready {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "metadata not yet resolved",
                ));
            }
            if index >= swarm.info.num_pieces {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("piece {index} out of range"),
                ));
            }
            (Arc::clone(&swarm.info), swarm.sources.clone())
        };
        let bytes = write_piece(&info, &sources, index)?;
        lock(&cell.swarm).finish_piece(index, bytes);
        cell.wake.notify_all();
        Ok(())
    }

    pub fn complete_all(&self) -> std::io::Result<()> {
        let cell = self.latest()?;
        let num_pieces = lock(&cell.swarm).info.num_pieces;
        for index in 0..num_pieces {
            self.complete_piece(index)?;
        }
        Ok(())
    }

    pub fn set_flush_stalled(&self, stalled: bool) {
        lock(&self.registry.inner).flush_stalled = stalled;
    }

    pub fn removals(&self) -> u32 {
        lock(&self.registry.inner).removals
    }

    pub fn is_sequential(&self) -> bool {
        self.latest()
            .map(|cell| lock(&cell.swarm).sequential)
            .unwrap_or(false)
    }
}

fn run_filler(cell: Arc<SwarmCell>, rate: u64) {
    loop {
        let job = {
            let mut swarm = lock(&cell.swarm);
            if swarm.stopped {
                return;
            }
            if let Err(err) = swarm.ensure_metadata() {
                tracing::warn!(error = %err, "mirror failed to prepare storage");
            }
            let picked = if swarm.metadata_ready {
                swarm.pick_piece()
            } else {
                None
            };
            match picked {
                Some(index) => {
                    swarm.in_flight = Some(index);
                    (index, Arc::clone(&swarm.info), swarm.sources.clone())
                }
                None => {
                    let wait = if swarm.metadata_ready {
                        IDLE_POLL
                    } else {
                        METADATA_POLL
                    };
                    let _ = cell.wake.wait_timeout(swarm, wait);
                    continue;
                }
            }
        };

        let (index, info, sources) = job;
        match write_piece(&info, &sources, index) {
            Ok(bytes) => {
                let mut swarm = lock(&cell.swarm);
                swarm.finish_piece(index, bytes);
                let pace = Duration::from_millis(bytes.saturating_mul(1000) / rate);
                let _ = cell.wake.wait_timeout_while(swarm, pace, |s| !s.stopped);
            }
            Err(err) => {
                tracing::warn!(piece = index, error = %err, "mirror failed to write piece");
                let mut swarm = lock(&cell.swarm);
                swarm.in_flight = None;
                let _ = cell.wake.wait_timeout_while(swarm, WRITE_RETRY, |s| !s.stopped);
            }
        }
    }
}

fn write_piece(info: &SwarmInfo, sources: &[PathBuf], index: u32) -> std::io::Result<u64> {
    let start = index as u64 * info.piece_length;
    let end = (start + info.piece_length).min(info.total_size());
    for (f, source) in info.files.iter().zip(sources) {
        let lo = start.max(f.offset);
        let hi = end.min(f.offset + f.size);
        if lo >= hi {
            continue;
        }
        let local = lo - f.offset;
        let mut buf = vec![0u8; (hi - lo) as usize];
        let mut src = File::open(source)?;
        src.seek(SeekFrom::Start(local))?;
        src.read_exact(&mut buf)?;

        let dest = storage_path(&info.save_path, &f.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&dest)?;
        out.seek(SeekFrom::Start(local))?;
        out.write_all(&buf)?;
    }
    Ok(end.saturating_sub(start))
}

fn delete_storage(info: &SwarmInfo) {
    for f in &info.files {
        let dest = storage_path(&info.save_path, &f.path);
        match fs::remove_file(&dest) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %dest.display(), error = %err, "failed to delete file");
            }
        }
        // Prune now-empty parents up to the save path; non-empty ones refuse removal.
        let mut dir = dest.parent();
        while let Some(d) = dir {
            if d == info.save_path || !d.starts_with(&info.save_path) {
                break;
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

struct SeedFile {
    rel_path: String,
    source: PathBuf,
    size: u64,
    mtime: u64,
}

fn scan_seed(uri: &str) -> Result<(String, Vec<SeedFile>)> {
    let root = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
    let meta = fs::metadata(&root).map_err(|err| {
        EngineError::command_failed(
            "add_download",
            format!("seed {} unavailable: {err}", root.display()),
        )
    })?;
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::command_failed("add_download", "seed has no file name"))?;

    let mut files = Vec::new();
    if meta.is_file() {
        files.push(seed_file(name.clone(), root.clone(), &meta));
    } else {
        collect_seed_dir(&root, &name, &mut files)?;
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    }
    if files.is_empty() {
        return Err(EngineError::command_failed(
            "add_download",
            format!("seed {} contains no files", root.display()),
        ));
    }
    Ok((name, files))
}

fn collect_seed_dir(dir: &Path, prefix: &str, out: &mut Vec<SeedFile>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let rel = format!("{prefix}/{}", entry.file_name().to_string_lossy());
        if meta.is_dir() {
            collect_seed_dir(&entry.path(), &rel, out)?;
        } else if meta.is_file() {
            out.push(seed_file(rel, entry.path(), &meta));
        }
    }
    Ok(())
}

fn seed_file(rel_path: String, source: PathBuf, meta: &fs::Metadata) -> SeedFile {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    SeedFile {
        rel_path,
        source,
        size: meta.len(),
        mtime,
    }
}
