use anyhow::Context as _;
use fs2::FileExt as _;
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

pub const LOCK_FILE_NAME: &str = ".swarm-stream.lock";

/// Exclusive advisory lock on a download directory, held for the life of the value.
#[derive(Debug)]
pub struct SingleInstanceLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl SingleInstanceLock {
    pub fn acquire_in(save_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::acquire(save_path.as_ref().join(LOCK_FILE_NAME))
    }

    pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        // The OS drops advisory locks with the process, so a crash never leaves a stale lock.
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(anyhow::anyhow!(
                "another swarm-stream process is using this download directory (lock held at {})",
                path.display()
            )),
            Err(e) => Err(anyhow::anyhow!(e))
                .with_context(|| format!("failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
