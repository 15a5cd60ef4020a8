//! Session bookkeeping and reporting.
//!
//! Each finished meditation is stored as one JSON value under
//! `session:<timestamp>` in a [`Storage`]. There is no other format.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::meditation::{GuidanceLevel, Technique};
use crate::speech::VoiceName;
use crate::storage::Storage;

pub const SESSION_PREFIX: &str = "session:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub timestamp: String,
    pub topic: String,
    pub technique: Technique,
    pub guidance_level: GuidanceLevel,
    pub duration_minutes: u32,
    pub voice: Option<VoiceName>,
    pub script_chars: usize,
    pub generation_ms: u64,
    pub playback_ms: u64,
    pub completed: bool,
}

impl SessionRecord {
    pub fn key(&self) -> String {
        format!("{SESSION_PREFIX}{}", self.timestamp)
    }
}

/// Whole milliseconds in `elapsed`, saturating at `u64::MAX`.
pub fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

pub fn now_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

pub fn save_session(storage: &mut dyn Storage, record: &SessionRecord) -> Result<(), StorageError> {
    let json = serde_json::to_string(record)?;
    storage.set_item(&record.key(), &json)?;
    debug!("Saved session record {}", record.key());
    Ok(())
}

/// All session records, oldest first. Malformed entries are skipped.
pub fn load_sessions(storage: &dyn Storage) -> Vec<SessionRecord> {
    (0..storage.len())
        .filter_map(|i| storage.key(i))
        .filter(|key| key.starts_with(SESSION_PREFIX))
        .filter_map(|key| {
            let value = storage.get_item(&key)?;
            match serde_json::from_str::<SessionRecord>(&value) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping malformed session entry {key}: {e}");
                    None
                }
            }
        })
        .collect()
}

fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let minutes = (seconds / 60.0) as u64;
        let secs = seconds % 60.0;
        if minutes < 60 {
            format!("{minutes}m {secs:.0}s")
        } else {
            let hours = minutes / 60;
            let mins = minutes % 60;
            format!("{hours}h {mins}m")
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// Markdown summary of every recorded session.
pub fn generate_report(storage: &dyn Storage) -> String {
    let records = load_sessions(storage);
    if records.is_empty() {
        return "# Meditation Report\n\nNo sessions recorded.".to_string();
    }

    let total = records.len();
    let completed = records.iter().filter(|r| r.completed).count();
    let planned_minutes: u32 = records.iter().map(|r| r.duration_minutes).sum();
    let listened: f64 = records.iter().map(|r| r.playback_ms as f64).sum::<f64>() / 1000.0;
    let avg_generation: f64 =
        records.iter().map(|r| r.generation_ms as f64).sum::<f64>() / total as f64;

    let mut by_technique: BTreeMap<&str, usize> = BTreeMap::new();
    for r in &records {
        *by_technique.entry(r.technique.label()).or_insert(0) += 1;
    }

    let mut lines = vec![
        "# Meditation Report".to_string(),
        String::new(),
        "## Summary".to_string(),
        format!("- **Sessions**: {total}"),
        format!("- **Completed**: {completed}"),
        format!("- **Planned time**: {planned_minutes} min"),
        format!("- **Time listened**: {}", format_duration(listened)),
        format!("- **Average generation latency**: {avg_generation:.0}ms"),
        String::new(),
        "## Techniques".to_string(),
    ];
    lines.extend(by_technique.iter().map(|(t, n)| format!("- {t}: {n}")));

    lines.extend([
        String::new(),
        "## Session Log".to_string(),
        String::new(),
        "| Time | Topic | Technique | Minutes | Completed |".to_string(),
        "|------|-------|-----------|---------|-----------|".to_string(),
    ]);

    for r in &records {
        let time_str = r.timestamp.get(..19).unwrap_or(&r.timestamp);
        lines.push(format!(
            "| {time_str} | {} | {} | {} | {} |",
            truncate(&r.topic, 30),
            r.technique,
            r.duration_minutes,
            if r.completed { "yes" } else { "no" }
        ));
    }

    lines.join("\n")
}
