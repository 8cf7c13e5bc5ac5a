#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use buzzer_contracts::pitch::{Pitch, PitchDraft, PitchId, PITCH_CONTRACT_VERSION};
use buzzer_contracts::{ContractViolation, Validate};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::persist::{read_json_if_exists, write_json_atomic};
use crate::StorageError;

/// On-disk form of the whole collection. `retired_ids` keeps deleted ids out
/// of future allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PitchCollection {
    schema_version: u32,
    pitches: Vec<Pitch>,
    #[serde(default)]
    retired_ids: BTreeSet<PitchId>,
}

impl PitchCollection {
    fn empty() -> Self {
        Self {
            schema_version: PITCH_CONTRACT_VERSION.0,
            pitches: Vec::new(),
            retired_ids: BTreeSet::new(),
        }
    }

    fn is_allocated(&self, id: &str) -> bool {
        self.pitches.iter().any(|p| p.id.as_str() == id)
            || self.retired_ids.iter().any(|r| r.as_str() == id)
    }

    fn position(&self, id: &PitchId) -> Result<usize, StorageError> {
        self.pitches
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| StorageError::NotFound {
                id: id.as_str().to_string(),
            })
    }

    fn sort(&mut self) {
        // Stable, so pitches sharing a slot keep insertion order.
        self.pitches.sort_by_key(|p| p.scheduled_at);
    }
}

/// Durable, ordered pitch registry.
///
/// Every mutation clones the collection, applies the change, persists the
/// clone and only then swaps it in, all under one writer lock. Readers never
/// see a partially applied change and a failed write leaves the previous
/// collection untouched.
#[derive(Debug)]
pub struct PitchStore {
    inner: Mutex<PitchCollection>,
    path: Option<PathBuf>,
}

impl PitchStore {
    pub fn new_in_memory() -> Self {
        Self {
            inner: Mutex::new(PitchCollection::empty()),
            path: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut collection: PitchCollection =
            read_json_if_exists(&path)?.unwrap_or_else(PitchCollection::empty);
        if collection.schema_version != PITCH_CONTRACT_VERSION.0 {
            return Err(StorageError::persistence(
                &path,
                format!(
                    "unsupported pitch store schema_version={}",
                    collection.schema_version
                ),
            ));
        }
        collection.sort();
        info!(
            path = %path.display(),
            pitches = collection.pitches.len(),
            "pitch store opened"
        );
        Ok(Self {
            inner: Mutex::new(collection),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add(&self, draft: PitchDraft, now: DateTime<Utc>) -> Result<Pitch, StorageError> {
        draft.validate_at(now)?;
        self.mutate(|c| {
            let id = allocate_id(c, now)?;
            let pitch = Pitch::from_draft(id, draft, now);
            c.pitches.push(pitch.clone());
            c.sort();
            Ok(pitch)
        })
    }

    pub fn list(&self) -> Vec<Pitch> {
        self.lock().pitches.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().pitches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &PitchId) -> Result<Pitch, StorageError> {
        let c = self.lock();
        let idx = c.position(id)?;
        Ok(c.pitches[idx].clone())
    }

    /// Not idempotent: a second call for the same id is `AlreadyReleased`.
    pub fn release(&self, id: &PitchId, now: DateTime<Utc>) -> Result<Pitch, StorageError> {
        self.mutate(|c| {
            let idx = c.position(id)?;
            let pitch = &mut c.pitches[idx];
            if pitch.is_released() {
                return Err(StorageError::AlreadyReleased {
                    id: id.as_str().to_string(),
                });
            }
            pitch.released_at = Some(now);
            Ok(pitch.clone())
        })
    }

    pub fn delete(&self, id: &PitchId) -> Result<Pitch, StorageError> {
        self.mutate(|c| {
            let idx = c.position(id)?;
            let removed = c.pitches.remove(idx);
            c.retired_ids.insert(removed.id.clone());
            Ok(removed)
        })
    }

    /// First pitch scheduled strictly after `now`. Released pitches are not
    /// skipped.
    pub fn next(&self, now: DateTime<Utc>) -> Option<Pitch> {
        self.lock()
            .pitches
            .iter()
            .find(|p| p.scheduled_at > now)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, PitchCollection> {
        // The guarded value is only ever replaced wholesale, so a panic while
        // holding the lock cannot leave it half-mutated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut PitchCollection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        if let Some(path) = &self.path {
            write_json_atomic(path, &next)?;
            debug!(path = %path.display(), pitches = next.pitches.len(), "pitch store persisted");
        }
        *guard = next;
        Ok(out)
    }
}

fn allocate_id(c: &PitchCollection, now: DateTime<Utc>) -> Result<PitchId, StorageError> {
    let mut candidate = i64::from(now.year()) * 100 + 1;
    while c.is_allocated(&candidate.to_string()) {
        candidate = candidate.checked_add(1).ok_or(ContractViolation::InvalidValue {
            field: "pitch.id",
            reason: "id space exhausted",
        })?;
    }
    Ok(PitchId::new(candidate.to_string())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn draft(speaker: &str, days: i64) -> PitchDraft {
        PitchDraft::v1(speaker, "Talk", now() + chrono::Duration::days(days))
    }

    fn id(raw: &str) -> PitchId {
        PitchId::new(raw).unwrap()
    }

    #[test]
    fn at_store_01_allocates_from_year_base() {
        let s = PitchStore::new_in_memory();
        assert_eq!(s.add(draft("a", 3), now()).unwrap().id.as_str(), "202401");
        assert_eq!(s.add(draft("b", 1), now()).unwrap().id.as_str(), "202402");
    }

    #[test]
    fn at_store_02_list_sorted_by_schedule() {
        let s = PitchStore::new_in_memory();
        s.add(draft("late", 9), now()).unwrap();
        s.add(draft("early", 1), now()).unwrap();
        s.add(draft("mid", 4), now()).unwrap();
        let speakers: Vec<_> = s.list().into_iter().map(|p| p.speaker).collect();
        assert_eq!(speakers, vec!["early", "mid", "late"]);
    }

    #[test]
    fn at_store_03_deleted_ids_are_never_reused() {
        let s = PitchStore::new_in_memory();
        let first = s.add(draft("a", 1), now()).unwrap();
        s.delete(&first.id).unwrap();
        let second = s.add(draft("b", 1), now()).unwrap();
        assert_eq!(second.id.as_str(), "202402");
    }

    #[test]
    fn at_store_04_release_is_not_idempotent() {
        let s = PitchStore::new_in_memory();
        let p = s.add(draft("a", 1), now()).unwrap();
        let released = s.release(&p.id, now()).unwrap();
        assert_eq!(released.released_at, Some(now()));
        assert!(matches!(
            s.release(&p.id, now()),
            Err(StorageError::AlreadyReleased { id }) if id == "202401"
        ));
    }

    #[test]
    fn at_store_05_missing_ids_are_not_found() {
        let s = PitchStore::new_in_memory();
        assert!(matches!(
            s.release(&id("202499"), now()),
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            s.delete(&id("202499")),
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(s.get(&id("202499")), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn at_store_06_validation_rejects_past_and_blank() {
        let s = PitchStore::new_in_memory();
        assert!(matches!(
            s.add(draft("a", 0), now()),
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            s.add(draft("", 2), now()),
            Err(StorageError::Validation(_))
        ));
        assert!(s.is_empty());
    }

    #[test]
    fn at_store_07_next_includes_released_pitches() {
        let s = PitchStore::new_in_memory();
        let first = s.add(draft("a", 1), now()).unwrap();
        s.add(draft("b", 2), now()).unwrap();
        s.release(&first.id, now()).unwrap();
        assert_eq!(s.next(now()).unwrap().id, first.id);
        let later = now() + chrono::Duration::days(1);
        assert_eq!(s.next(later).unwrap().speaker, "b");
        assert!(s.next(now() + chrono::Duration::days(5)).is_none());
    }
}
