#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use buzzer_contracts::pitch::{PitchDraft, PitchId};
use buzzer_storage::{PitchStore, StorageError};
use chrono::{DateTime, TimeZone, Utc};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

fn draft(speaker: &str, hours: i64) -> PitchDraft {
    PitchDraft::v1(speaker, "Talk", now() + chrono::Duration::hours(hours))
}

fn temp_store_path(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir().join(format!("buzzer_store_{tag}_{nanos}.json"))
}

#[test]
fn at_store_db_01_reopen_recovers_collection_and_retired_ids() {
    let path = temp_store_path("reopen");
    {
        let s = PitchStore::open(&path).unwrap();
        let a = s.add(draft("a", 5), now()).unwrap();
        s.add(draft("b", 2), now()).unwrap();
        s.release(&a.id, now()).unwrap();
        let c = s.add(draft("c", 9), now()).unwrap();
        s.delete(&c.id).unwrap();
    }

    let reopened = PitchStore::open(&path).unwrap();
    let all = reopened.list();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].speaker, "b");
    assert_eq!(all[1].speaker, "a");
    assert!(all[1].is_released());
    // 202403 was deleted before the restart and must stay retired.
    let d = reopened.add(draft("d", 1), now()).unwrap();
    assert_eq!(d.id.as_str(), "202404");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_store_db_02_concurrent_adds_do_not_lose_updates() {
    let path = temp_store_path("concurrent");
    let s = Arc::new(PitchStore::open(&path).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let s = s.clone();
            thread::spawn(move || {
                for j in 0..5 {
                    s.add(draft(&format!("t{i}-{j}"), 1 + i * 5 + j), now())
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let all = s.list();
    assert_eq!(all.len(), 40);
    let mut ids: Vec<_> = all.iter().map(|p| p.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 40);
    assert!(all.windows(2).all(|w| w[0].scheduled_at <= w[1].scheduled_at));
    assert_eq!(PitchStore::open(&path).unwrap().len(), 40);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_store_db_03_sorted_and_unique_after_every_mutation() {
    let s = PitchStore::new_in_memory();
    let offsets = [7, 3, 11, 1, 5, 9];
    let mut added = Vec::new();
    for (i, h) in offsets.iter().enumerate() {
        added.push(s.add(draft(&format!("s{i}"), *h), now()).unwrap());
        assert_sorted_unique(&s);
    }
    for p in added.iter().step_by(2) {
        s.delete(&p.id).unwrap();
        assert_sorted_unique(&s);
    }
    assert_eq!(s.len(), 3);
}

fn assert_sorted_unique(s: &PitchStore) {
    let all = s.list();
    assert!(all.windows(2).all(|w| w[0].scheduled_at <= w[1].scheduled_at));
    let mut ids: Vec<_> = all.iter().map(|p| p.id.as_str().to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), all.len());
}

#[test]
fn at_store_db_04_corrupt_file_is_persistence_error() {
    let path = temp_store_path("corrupt");
    std::fs::write(&path, b"{not json").unwrap();
    assert!(matches!(
        PitchStore::open(&path),
        Err(StorageError::Persistence { .. })
    ));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_store_db_05_failed_release_leaves_file_untouched() {
    let path = temp_store_path("untouched");
    let s = PitchStore::open(&path).unwrap();
    s.add(draft("a", 1), now()).unwrap();
    let before = std::fs::read(&path).unwrap();
    let missing = PitchId::new("209999").unwrap();
    assert!(matches!(
        s.release(&missing, now()),
        Err(StorageError::NotFound { .. })
    ));
    assert_eq!(std::fs::read(&path).unwrap(), before);
    let _ = std::fs::remove_file(&path);
}
