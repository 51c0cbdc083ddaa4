use crate::{
    engine::{EncryptionPolicy, EngineSettings, MirrorOptions, StorageMode},
    fs::StreamOptions,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, ops::RangeInclusive, path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:5001".to_string()
}
fn default_listen_port_start() -> u16 {
    6881
}
fn default_listen_port_end() -> u16 {
    6891
}
fn default_connection_speed() -> u32 {
    // New peer connection attempts per second.
    500
}
fn default_request_timeout_secs() -> u64 {
    3
}
fn default_peer_connect_timeout_secs() -> u64 {
    3
}
fn default_encryption() -> EncryptionPolicy {
    EncryptionPolicy::Enabled
}
fn default_piece_length() -> u64 {
    256 * 1024
}
fn default_mirror_rate() -> u64 {
    4 * 1024 * 1024
}
fn default_save_path() -> String {
    "downloads".to_string()
}
fn default_sparse() -> bool {
    true
}
fn default_end_window_bytes() -> u64 {
    // Container trailers and seek indices sit within the last ~100 KiB of most media files.
    100 * 1024
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_metadata_wait_secs() -> u64 {
    30
}
fn default_status_timeout_ms() -> u64 {
    2000
}
fn default_flush_timeout_secs() -> u64 {
    30
}
fn default_watch_parent() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub http: HttpConfig,
    pub engine: EngineConfig,
    pub download: DownloadConfig,
    pub stream: StreamConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_port_start: u16,
    pub listen_port_end: u16,
    pub connection_speed: u32,
    pub request_timeout_secs: u64,
    pub peer_connect_timeout_secs: u64,
    /// Bytes/s, `0` = unlimited.
    pub download_rate_limit: u64,
    pub upload_rate_limit: u64,
    pub encryption: EncryptionPolicy,

    /// Mirror engine only.
    pub piece_length: u64,
    /// Mirror fill rate in bytes/s. `0` completes pieces only on request.
    pub mirror_rate: u64,
    pub metadata_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub uri: String,
    pub save_path: String,
    /// Keep downloaded data on disk when the session ends.
    pub keep_files: bool,
    pub sparse: bool,
    /// Entry to serve by default; empty selects the largest file.
    pub target_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub end_window_bytes: u64,
    pub poll_interval_ms: u64,
    pub metadata_wait_secs: u64,
    pub status_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub flush_timeout_secs: u64,
    /// Shut down when the parent process goes away.
    pub watch_parent: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port_start: default_listen_port_start(),
            listen_port_end: default_listen_port_end(),
            connection_speed: default_connection_speed(),
            request_timeout_secs: default_request_timeout_secs(),
            peer_connect_timeout_secs: default_peer_connect_timeout_secs(),
            download_rate_limit: 0,
            upload_rate_limit: 0,
            encryption: default_encryption(),
            piece_length: default_piece_length(),
            mirror_rate: default_mirror_rate(),
            metadata_delay_ms: 0,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            save_path: default_save_path(),
            keep_files: false,
            sparse: default_sparse(),
            target_file: String::new(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            end_window_bytes: default_end_window_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            metadata_wait_secs: default_metadata_wait_secs(),
            status_timeout_ms: default_status_timeout_ms(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            flush_timeout_secs: default_flush_timeout_secs(),
            watch_parent: default_watch_parent(),
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.http
            .bind
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid http.bind '{}': {err}", self.http.bind))
    }

    pub fn save_path(&self) -> PathBuf {
        PathBuf::from(&self.download.save_path)
    }

    pub fn target_file(&self) -> Option<&str> {
        let t = self.download.target_file.trim();
        (!t.is_empty()).then_some(t)
    }

    pub fn storage_mode(&self) -> StorageMode {
        if self.download.sparse {
            StorageMode::Sparse
        } else {
            StorageMode::Allocate
        }
    }

    pub fn listen_ports(&self) -> RangeInclusive<u16> {
        let start = self.engine.listen_port_start;
        start..=self.engine.listen_port_end.max(start)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            connection_speed: self.engine.connection_speed,
            request_timeout: Duration::from_secs(self.engine.request_timeout_secs),
            peer_connect_timeout: Duration::from_secs(self.engine.peer_connect_timeout_secs),
            download_rate_limit: self.engine.download_rate_limit,
            upload_rate_limit: self.engine.upload_rate_limit,
            encryption: self.engine.encryption,
        }
    }

    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            piece_length: self.engine.piece_length,
            rate: self.engine.mirror_rate,
            metadata_delay: Duration::from_millis(self.engine.metadata_delay_ms),
            hold_metadata: false,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            end_window: self.stream.end_window_bytes,
            poll_interval: self.poll_interval(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream.poll_interval_ms.max(1))
    }

    pub fn metadata_wait(&self) -> Duration {
        Duration::from_secs(self.stream.metadata_wait_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.status_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.flush_timeout_secs)
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) general.log_level from config.toml
    // 3) info
    //
    // Example:
    // RUST_LOG=info,swarm_stream::fs=debug
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.general.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .try_init();
}
