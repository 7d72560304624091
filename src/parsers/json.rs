//! `achievements.json` in its native, Epic and GOG flavours.

use serde_json::Value;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use super::RawEntry;
use crate::achievements::{coerce_earned, normalize_epoch};
use crate::error::{Error, Result};

/// Writers often truncate-then-fill, so a read can see half a document.
const READ_ATTEMPTS: u32 = 6;
const READ_BACKOFF: Duration = Duration::from_millis(25);

const EARNED_KEYS: &[&str] = &["achieved", "Achieved", "earned", "unlocked"];
const TIME_KEYS: &[&str] = &["UnlockTime", "unlockTime", "unlocktime", "earned_time", "unlock_time", "time"];
const PROGRESS_KEYS: &[&str] = &["progress", "CurProgress", "curProgress"];
const MAX_PROGRESS_KEYS: &[&str] = &["max_progress", "MaxProgress", "maxProgress"];

/// A candidate interpretation of a JSON save document.
trait JsonShape {
    fn name(&self) -> &'static str;
    fn applies(&self, root: &Value) -> bool;
    fn interpret(&self, root: &Value) -> Vec<RawEntry>;
}

/// `[{name, achieved, UnlockTime}]` rows, or Goldberg's `{name: {earned, earned_time}}` map.
struct NativeShape;

/// Epic rows keyed by `AchievementId`; a positive unlock time implies earned.
struct EpicShape;

/// GOG objects carrying `unlocked` / `unlock_time`.
struct GogShape;

const SHAPES: &[&dyn JsonShape] = &[&NativeShape, &EpicShape, &GogShape];

impl JsonShape for NativeShape {
    fn name(&self) -> &'static str {
        "native"
    }

    fn applies(&self, root: &Value) -> bool {
        if let Some(rows) = rows(root) {
            return rows
                .iter()
                .any(|row| row.get("name").is_some() && !is_gog_row(row));
        }
        object_entries(root).any(|(_, v)| v.get("earned").is_some())
    }

    fn interpret(&self, root: &Value) -> Vec<RawEntry> {
        if let Some(rows) = rows(root) {
            return rows
                .iter()
                .filter_map(|row| {
                    let key = key_string(row.get("name")?)?;
                    Some(read_row(key, row))
                })
                .collect();
        }

        object_entries(root)
            .filter(|(_, v)| v.get("earned").is_some())
            .map(|(key, row)| read_row(key.clone(), row))
            .collect()
    }
}

impl JsonShape for EpicShape {
    fn name(&self) -> &'static str {
        "epic"
    }

    fn applies(&self, root: &Value) -> bool {
        rows(root)
            .map(|rows| rows.iter().any(|row| row.get("AchievementId").is_some()))
            .unwrap_or(false)
    }

    fn interpret(&self, root: &Value) -> Vec<RawEntry> {
        rows(root)
            .into_iter()
            .flatten()
            .filter_map(|row| {
                let key = key_string(row.get("AchievementId")?)?;
                let time = row.get("UnlockTime").map(time_value).unwrap_or(0);
                let flagged = first(row, &["Achieved", "achieved", "bAchieved"])
                    .map(coerce_earned)
                    .unwrap_or(false);
                Some(RawEntry::new(key).earned(flagged || time > 0, time))
            })
            .collect()
    }
}

impl JsonShape for GogShape {
    fn name(&self) -> &'static str {
        "gog"
    }

    fn applies(&self, root: &Value) -> bool {
        match rows(root) {
            Some(rows) => rows.iter().any(is_gog_row),
            None => object_entries(root).any(|(_, v)| is_gog_row(v)),
        }
    }

    fn interpret(&self, root: &Value) -> Vec<RawEntry> {
        let gog_row = |key: String, row: &Value| {
            let time = row.get("unlock_time").map(time_value).unwrap_or(0);
            let earned = match row.get("unlocked") {
                Some(flag) => coerce_earned(flag),
                None => time > 0,
            };
            RawEntry::new(key).earned(earned, time)
        };

        match rows(root) {
            Some(rows) => rows
                .iter()
                .filter_map(|row| {
                    let key = key_string(row.get("name").or_else(|| row.get("id"))?)?;
                    Some(gog_row(key, row))
                })
                .collect(),
            None => object_entries(root)
                .filter(|(_, v)| v.is_object())
                .map(|(key, row)| gog_row(key.clone(), row))
                .collect(),
        }
    }
}

/// Read and interpret a JSON save file, retrying while the document is incomplete.
pub fn read_entries(path: &Path) -> Result<Vec<RawEntry>> {
    let root = read_json_with_retry(path)?;
    interpret(&root)
}

/// Try each shape in order and return the first that yields entries.
pub fn interpret(root: &Value) -> Result<Vec<RawEntry>> {
    for shape in SHAPES {
        if !shape.applies(root) {
            continue;
        }
        let entries = shape.interpret(root);
        if !entries.is_empty() {
            tracing::trace!(shape = shape.name(), count = entries.len(), "interpreted JSON save");
            return Ok(entries);
        }
    }
    Err(Error::parse("json", "no known achievement shape matched"))
}

pub fn parse_str(contents: &str) -> Result<Vec<RawEntry>> {
    let root: Value = serde_json::from_str(contents.trim_start_matches('\u{feff}'))?;
    interpret(&root)
}

fn read_json_with_retry(path: &Path) -> Result<Value> {
    let mut last_error = None;

    for attempt in 1..=READ_ATTEMPTS {
        let result = fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|contents| {
                serde_json::from_str::<Value>(contents.trim_start_matches('\u{feff}'))
                    .map_err(Error::from)
            });

        match result {
            Ok(value) => return Ok(value),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Io(e));
            }
            Err(e) => {
                tracing::trace!(path = %path.display(), attempt, "JSON read failed: {}", e);
                last_error = Some(e);
                if attempt < READ_ATTEMPTS {
                    thread::sleep(READ_BACKOFF * attempt);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::parse("json", "unreadable file")))
}

/// GOG spells its fields `unlocked` / `unlock_time` and never carries the native earned flags.
fn is_gog_row(row: &Value) -> bool {
    let gog_fields = row.get("unlock_time").is_some() || row.get("unlocked").is_some();
    gog_fields && first(row, &["achieved", "Achieved", "earned"]).is_none()
}

fn rows(root: &Value) -> Option<&Vec<Value>> {
    root.as_array()
        .or_else(|| root.get("achievements").and_then(Value::as_array))
}

fn object_entries(root: &Value) -> impl Iterator<Item = (&String, &Value)> {
    root.as_object().into_iter().flatten()
}

fn first<'a>(row: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| row.get(*key))
}

fn read_row(key: String, row: &Value) -> RawEntry {
    let earned = first(row, EARNED_KEYS).map(coerce_earned).unwrap_or(false);
    let time = first(row, TIME_KEYS).map(time_value).unwrap_or(0);
    let progress = first(row, PROGRESS_KEYS).and_then(number_value);
    let max_progress = first(row, MAX_PROGRESS_KEYS).and_then(number_value);

    RawEntry::new(key)
        .earned(earned, time)
        .progress(progress, max_progress)
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Epoch seconds/millis as a number or numeric string, or an RFC 3339 date.
fn time_value(value: &Value) -> i64 {
    if let Some(n) = number_value(value) {
        return normalize_epoch(n as i64);
    }
    value
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|dt| normalize_epoch(dt.timestamp_millis()))
        .unwrap_or(0)
}
