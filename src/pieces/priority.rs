//! Priority scheduler.
//!
//! Keeps the availability scan's sequential assumption true: exactly one served file is fetched
//! eagerly, every other file is suppressed, and the engine runs in sequential mode so the
//! earliest missing chunk of the served file is the one in flight.

use crate::engine::{EngineError, EngineHandle, FileEntry, FilePriority, SwarmInfo};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityPlan {
    priorities: Vec<FilePriority>,
}

impl PriorityPlan {
    pub fn for_target(num_files: usize, target: usize) -> Self {
        let priorities = (0..num_files)
            .map(|i| {
                if i == target {
                    FilePriority::Active
                } else {
                    FilePriority::Suppressed
                }
            })
            .collect();
        Self { priorities }
    }

    pub fn priorities(&self) -> &[FilePriority] {
        &self.priorities
    }

    pub fn active(&self) -> Option<usize> {
        self.priorities
            .iter()
            .position(|p| matches!(p, FilePriority::Active))
    }

    /// File priorities that differ from `current`, in index order.
    pub fn changes(&self, current: &[FilePriority]) -> Vec<(usize, FilePriority)> {
        self.priorities
            .iter()
            .enumerate()
            .filter(|&(i, p)| current.get(i) != Some(p))
            .map(|(i, p)| (i, *p))
            .collect()
    }
}

/// Largest entry by size; ties go to the first occurrence.
pub fn largest_file(files: &[FileEntry]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, f) in files.iter().enumerate() {
        if best.is_none_or(|(_, size)| f.size > size) {
            best = Some((i, f.size));
        }
    }
    best.map(|(i, _)| i)
}

/// Explicit path when it names an entry, otherwise the largest file.
pub fn select_target(info: &SwarmInfo, explicit: Option<&str>) -> Option<usize> {
    if let Some(path) = explicit.filter(|p| !p.trim().is_empty()) {
        match info.find_file(path) {
            Some((index, _)) => return Some(index),
            None => {
                tracing::warn!(path, "configured target file is not in the swarm; using largest")
            }
        }
    }
    largest_file(&info.files)
}

pub struct PriorityScheduler {
    engine: EngineHandle,
    served: Mutex<Option<usize>>,
}

impl PriorityScheduler {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            served: Mutex::new(None),
        }
    }

    pub async fn served(&self) -> Option<usize> {
        *self.served.lock().await
    }

    /// Makes `target` the served file. Only priorities that differ from the engine's current
    /// ones are sent, so re-applying is a no-op apart from re-asserting sequential mode.
    /// Returns the number of file priorities changed.
    pub async fn serve(&self, num_files: usize, target: usize) -> Result<usize, EngineError> {
        if target >= num_files {
            return Err(EngineError::UnknownFile(target));
        }
        // Held across the whole apply so concurrent selections cannot interleave.
        let mut served = self.served.lock().await;
        self.apply(&mut served, num_files, target).await
    }

    /// Like [`serve`](Self::serve), but only when no file has been selected yet. Returns
    /// `Ok(None)` when an earlier selection is kept.
    pub async fn serve_default(
        &self,
        num_files: usize,
        target: usize,
    ) -> Result<Option<usize>, EngineError> {
        if target >= num_files {
            return Err(EngineError::UnknownFile(target));
        }
        let mut served = self.served.lock().await;
        if let Some(current) = *served {
            tracing::debug!(file_index = current, "keeping selected file over default");
            return Ok(None);
        }
        self.apply(&mut served, num_files, target).await.map(Some)
    }

    async fn apply(
        &self,
        served: &mut Option<usize>,
        num_files: usize,
        target: usize,
    ) -> Result<usize, EngineError> {
        let plan = PriorityPlan::for_target(num_files, target);
        let current = self.engine.file_priorities().await?;
        let changes = plan.changes(&current);
        for &(index, priority) in &changes {
            self.engine.set_file_priority(index, priority).await?;
        }
        self.engine.set_sequential(true).await?;
        if *served != Some(target) {
            tracing::info!(file_index = target, changed = changes.len(), "served file selected");
        }
        *served = Some(target);
        Ok(changes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        AddDownload, MirrorEngine, MirrorOptions, StorageMode, start_worker,
    };
    use std::time::Duration;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            offset: 0,
            mtime: 0,
        }
    }

    #[test]
    fn plan_has_exactly_one_active_file() {
        let plan = PriorityPlan::for_target(4, 2);
        assert_eq!(plan.active(), Some(2));
        assert_eq!(
            plan.priorities()
                .iter()
                .filter(|p| matches!(p, FilePriority::Active))
                .count(),
            1
        );
    }

    #[test]
    fn changes_skip_priorities_already_in_place() {
        let plan = PriorityPlan::for_target(3, 1);
        let current = [
            FilePriority::Suppressed,
            FilePriority::Normal,
            FilePriority::Normal,
        ];
        assert_eq!(
            plan.changes(&current),
            vec![(1, FilePriority::Active), (2, FilePriority::Suppressed)]
        );
        assert!(plan.changes(plan.priorities()).is_empty());
    }

    #[test]
    fn largest_file_breaks_ties_by_first_occurrence() {
        let files = [entry("a", 10), entry("b", 30), entry("c", 30), entry("d", 5)];
        assert_eq!(largest_file(&files), Some(1));
        assert_eq!(largest_file(&[]), None);
    }

    #[test]
    fn explicit_target_wins_over_largest() {
        let info = SwarmInfo {
            name: "s".to_string(),
            piece_length: 16_384,
            num_pieces: 1,
            save_path: "out".into(),
            files: vec![entry("s/big.mkv", 100), entry("s/small.srt", 1)],
        };
        assert_eq!(select_target(&info, Some("s/small.srt")), Some(1));
        assert_eq!(select_target(&info, Some("/s/small.srt")), Some(1));
        assert_eq!(select_target(&info, Some("s/missing")), Some(0));
        assert_eq!(select_target(&info, None), Some(0));
    }

    #[tokio::test]
    async fn applying_the_same_plan_twice_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let seed = tmp.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        for (name, len) in [("a.bin", 10usize), ("b.bin", 20), ("c.bin", 30)] {
            std::fs::write(seed.join(name), vec![1u8; len]).unwrap();
        }
        let engine = MirrorEngine::new(MirrorOptions {
            piece_length: 16,
            rate: 0,
            ..MirrorOptions::default()
        });
        let control = engine.control();
        let (handle, _snapshots, join) =
            start_worker(engine, Duration::from_millis(5)).expect("worker");
        handle
            .add_download(AddDownload {
                uri: seed.display().to_string(),
                save_path: tmp.path().join("out"),
                storage_mode: StorageMode::Sparse,
            })
            .await
            .expect("add");

        let scheduler = PriorityScheduler::new(handle.clone());
        assert_eq!(scheduler.serve(3, 2).await.unwrap(), 3);
        let once = handle.file_priorities().await.unwrap();
        assert_eq!(scheduler.serve(3, 2).await.unwrap(), 0);
        let twice = handle.file_priorities().await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(
            twice,
            vec![
                FilePriority::Suppressed,
                FilePriority::Suppressed,
                FilePriority::Active
            ]
        );
        assert!(control.is_sequential());
        assert_eq!(scheduler.served().await, Some(2));

        // Switching target touches only the two files whose priority flips.
        assert_eq!(scheduler.serve(3, 0).await.unwrap(), 2);
        assert!(matches!(
            scheduler.serve(3, 9).await,
            Err(EngineError::UnknownFile(9))
        ));

        handle.shutdown().await.unwrap();
        join.join().unwrap();
    }

    #[tokio::test]
    async fn default_plan_never_overrides_a_client_selection() {
        let tmp = tempfile::tempdir().unwrap();
        let seed = tmp.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        for (name, len) in [("a.bin", 10usize), ("b.bin", 20), ("c.bin", 30)] {
            std::fs::write(seed.join(name), vec![1u8; len]).unwrap();
        }
        let engine = MirrorEngine::new(MirrorOptions {
            piece_length: 16,
            rate: 0,
            ..MirrorOptions::default()
        });
        let (handle, _snapshots, join) =
            start_worker(engine, Duration::from_millis(5)).expect("worker");
        handle
            .add_download(AddDownload {
                uri: seed.display().to_string(),
                save_path: tmp.path().join("out"),
                storage_mode: StorageMode::Sparse,
            })
            .await
            .expect("add");

        // Whichever runs first, the client's choice is what remains.
        let scheduler = PriorityScheduler::new(handle.clone());
        let (client, default) = tokio::join!(scheduler.serve(3, 0), scheduler.serve_default(3, 2));
        client.unwrap();
        default.unwrap();
        assert_eq!(scheduler.served().await, Some(0));
        assert_eq!(
            handle.file_priorities().await.unwrap(),
            vec![
                FilePriority::Active,
                FilePriority::Suppressed,
                FilePriority::Suppressed
            ]
        );

        // Once a file is served, the default plan is a no-op.
        assert_eq!(scheduler.serve_default(3, 2).await.unwrap(), None);
        assert_eq!(scheduler.served().await, Some(0));

        let fresh = PriorityScheduler::new(handle.clone());
        assert_eq!(fresh.serve_default(3, 1).await.unwrap(), Some(2));
        assert_eq!(fresh.served().await, Some(1));

        handle.shutdown().await.unwrap();
        join.join().unwrap();
    }
}
