#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use buzzer_contracts::pitch::{NextPitchSnapshot, PitchDocument};
use tracing::{info, warn};

use crate::persist::{read_json_if_exists, write_json_atomic};

/// Single-slot cache of the pitch currently announced to devices.
///
/// Constructed once per registry process and shared by `Arc`; there is no
/// teardown beyond dropping it, since every accepted `set` has already been
/// written to disk.
#[derive(Debug)]
pub struct NextPitchCache {
    current: Mutex<NextPitchSnapshot>,
    path: Option<PathBuf>,
    changes: AtomicU64,
}

impl NextPitchCache {
    pub fn new_in_memory() -> Self {
        Self {
            current: Mutex::new(NextPitchSnapshot::empty()),
            path: None,
            changes: AtomicU64::new(0),
        }
    }

    /// Recovers the last announced pitch from `path`. A missing file starts
    /// empty; an unreadable one is logged and also starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = match read_json_if_exists::<PitchDocument>(&path) {
            Ok(Some(doc)) => match NextPitchSnapshot::from_document(doc) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding invalid next pitch snapshot");
                    NextPitchSnapshot::empty()
                }
            },
            Ok(None) => NextPitchSnapshot::empty(),
            Err(err) => {
                warn!(error = %err, "next pitch snapshot unreadable, starting empty");
                NextPitchSnapshot::empty()
            }
        };
        info!(path = %path.display(), id = snapshot.id_str(), "next pitch cache loaded");
        Self {
            current: Mutex::new(snapshot),
            path: Some(path),
            changes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> NextPitchSnapshot {
        self.lock().clone()
    }

    /// Replaces the snapshot when the candidate's id differs from the current
    /// one and reports whether it did. Repeat deliveries of the same id are
    /// no-ops.
    ///
    /// The snapshot is written to disk before it is published. A failed write
    /// is logged and the in-memory update still happens, so a crash right
    /// after such a failure recovers the previous snapshot.
    pub fn set(&self, candidate: NextPitchSnapshot) -> bool {
        let mut current = self.lock();
        if current.id_str() == candidate.id_str() {
            return false;
        }
        if let Some(path) = &self.path {
            if let Err(err) = write_json_atomic(path, &candidate.to_document()) {
                warn!(error = %err, id = candidate.id_str(), "next pitch snapshot not persisted");
            }
        }
        info!(from = current.id_str(), to = candidate.id_str(), "next pitch changed");
        *current = candidate;
        self.changes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of accepted `set` calls since construction.
    pub fn change_count(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, NextPitchSnapshot> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buzzer_contracts::pitch::{Pitch, PitchDraft, PitchId};
    use chrono::{TimeZone, Utc};

    fn snapshot(id: &str) -> NextPitchSnapshot {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        NextPitchSnapshot::of(Pitch::from_draft(
            PitchId::new(id).unwrap(),
            PitchDraft::v1("Ada", "Engines", at),
            at,
        ))
    }

    #[test]
    fn at_next_01_same_id_is_single_change() {
        let cache = NextPitchCache::new_in_memory();
        assert!(cache.set(snapshot("202401")));
        assert!(!cache.set(snapshot("202401")));
        assert_eq!(cache.change_count(), 1);
        assert_eq!(cache.get().id_str(), "202401");
    }

    #[test]
    fn at_next_02_empty_candidate_clears_current() {
        let cache = NextPitchCache::new_in_memory();
        assert!(!cache.set(NextPitchSnapshot::empty()));
        cache.set(snapshot("202401"));
        assert!(cache.set(NextPitchSnapshot::empty()));
        assert_eq!(cache.get(), NextPitchSnapshot::empty());
    }

    #[test]
    fn at_next_03_unwritable_path_keeps_memory_update() {
        let dir = std::env::temp_dir().join(format!(
            "buzzer_next_unwritable_{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        // The snapshot path is an existing directory, so the rename fails.
        let cache = NextPitchCache::load(&dir);
        assert!(cache.set(snapshot("202402")));
        assert_eq!(cache.get().id_str(), "202402");
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_file(dir.with_extension("tmp"));
    }
}
