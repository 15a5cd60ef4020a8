//! File-backed storage, session bookkeeping and config loading on disk.

use stillwater::config::Config;
use stillwater::history::{self, SessionRecord};
use stillwater::meditation::{GuidanceLevel, Technique};
use stillwater::speech::VoiceName;
use stillwater::storage::{FileStorage, Storage};
use stillwater::StorageError;
use tempfile::TempDir;

fn session(timestamp: &str) -> SessionRecord {
    SessionRecord {
        timestamp: timestamp.into(),
        topic: "gratitude".into(),
        technique: Technique::LovingKindness,
        guidance_level: GuidanceLevel::Low,
        duration_minutes: 5,
        voice: None,
        script_chars: 800,
        generation_ms: 2100,
        playback_ms: 0,
        completed: true,
    }
}

#[test]
fn file_storage_persists_across_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nested").join("storage.json");

    {
        let mut storage = FileStorage::open(&path).expect("open");
        assert!(storage.is_empty());
        storage.set_item("last-voice", "gentle").expect("write");
        storage.set_item("streak", "3").expect("write");
        storage.remove_item("streak");
    }

    let storage = FileStorage::open(&path).expect("reopen");
    assert_eq!(storage.len(), 1);
    assert_eq!(storage.get_item("last-voice").as_deref(), Some("gentle"));
    assert_eq!(storage.key(0).as_deref(), Some("last-voice"));
}

#[test]
fn clear_empties_the_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("storage.json");

    let mut storage = FileStorage::open(&path).expect("open");
    storage.set_item("a", "1").expect("write");
    storage.clear();

    assert!(FileStorage::open(&path).expect("reopen").is_empty());
}

#[test]
fn corrupt_file_is_a_serialization_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("storage.json");
    std::fs::write(&path, "[1, 2").expect("write fixture");

    assert!(matches!(
        FileStorage::open(&path),
        Err(StorageError::Serialization(_))
    ));
}

#[test]
fn sessions_survive_in_file_storage() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("storage.json");

    let mut storage = FileStorage::open(&path).expect("open");
    history::save_session(&mut storage, &session("2026-10-18T06:30:00.000000")).expect("save");
    drop(storage);

    let storage = FileStorage::open(&path).expect("reopen");
    let sessions = history::load_sessions(&storage);
    assert_eq!(sessions, vec![session("2026-10-18T06:30:00.000000")]);
    assert!(history::generate_report(&storage).contains("- loving-kindness: 1"));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "api:\n  base_url: http://localhost:9999\n  timeout_secs: 30\nspeech:\n  enabled: false\n  voice: bright\nstorage:\n  path: /tmp/stillwater-test.json\n",
    )
    .expect("write config");

    let config = Config::load(Some(&path));
    assert_eq!(config.api.base_url, "http://localhost:9999");
    assert_eq!(config.api.timeout_secs, Some(30));
    assert_eq!(config.api.model, "claude-3-5-sonnet-20241022");
    assert!(!config.speech.enabled);
    assert_eq!(config.speech.voice, VoiceName::Bright);
    assert_eq!(
        config.storage.resolved_path(),
        std::path::PathBuf::from("/tmp/stillwater-test.json")
    );
}

#[test]
fn unparsable_config_falls_back_to_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "api: [not, a, map").expect("write config");

    let config = Config::load(Some(&path));
    assert_eq!(config.api.base_url, "https://api.anthropic.com");
}
