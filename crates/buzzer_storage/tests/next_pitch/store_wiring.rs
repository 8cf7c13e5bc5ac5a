#![forbid(unsafe_code)]

use std::path::PathBuf;

use buzzer_contracts::pitch::{NextPitchSnapshot, Pitch, PitchDraft, PitchId};
use buzzer_storage::NextPitchCache;
use chrono::{TimeZone, Utc};

fn snapshot(id: &str) -> NextPitchSnapshot {
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    NextPitchSnapshot::of(Pitch::from_draft(
        PitchId::new(id).unwrap(),
        PitchDraft::v1("Ada", "Engines", at),
        at - chrono::Duration::days(30),
    ))
}

fn temp_cache_path(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir().join(format!("buzzer_next_{tag}_{nanos}.cache"))
}

#[test]
fn at_next_db_01_restart_recovers_last_announced_pitch() {
    let path = temp_cache_path("restart");
    {
        let cache = NextPitchCache::load(&path);
        assert_eq!(cache.get(), NextPitchSnapshot::empty());
        assert!(cache.set(snapshot("202401")));
    }

    let restarted = NextPitchCache::load(&path);
    assert_eq!(restarted.get().id_str(), "202401");
    assert_eq!(restarted.get(), snapshot("202401"));
    assert_eq!(restarted.change_count(), 0);
    // Replaying the same announcement after restart is still a no-op.
    assert!(!restarted.set(snapshot("202401")));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_next_db_02_snapshot_file_is_wire_document() {
    let path = temp_cache_path("wire");
    let cache = NextPitchCache::load(&path);
    cache.set(snapshot("202405"));
    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["id"], "202405");
    assert_eq!(raw["speaker"], "Ada");
    assert_eq!(raw["started"], false);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_next_db_03_corrupt_snapshot_starts_empty() {
    let path = temp_cache_path("corrupt");
    std::fs::write(&path, b"garbage").unwrap();
    let cache = NextPitchCache::load(&path);
    assert_eq!(cache.get(), NextPitchSnapshot::empty());
    assert!(cache.set(snapshot("202401")));
    assert_eq!(NextPitchCache::load(&path).get().id_str(), "202401");
    let _ = std::fs::remove_file(&path);
}
