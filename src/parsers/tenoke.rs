//! Tenoke `user_stats.ini`: `[STATS]` / `[ACHIEVEMENTS]` sections whose values are
//! either scalars or `{unlocked = true, time = 1700000000}` brace objects.

use indexmap::IndexMap;
use std::fs;
use std::path::Path;

use super::RawEntry;
use crate::achievements::{coerce_earned_str, normalize_epoch};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TenokeValue {
    Scalar(String),
    Object(IndexMap<String, String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenokeSave {
    pub stats: IndexMap<String, TenokeValue>,
    pub achievements: IndexMap<String, TenokeValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    None,
    Stats,
    Achievements,
    Other,
}

/// True if `text` has an `[ACHIEVEMENTS]` header and at least one brace value.
pub fn looks_like_tenoke(text: &str) -> bool {
    let has_header = text
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("[achievements]"));
    has_header && text.lines().any(|line| line.contains("= {") || line.contains("={"))
}

pub fn read_entries(path: &Path) -> Result<Vec<RawEntry>> {
    let contents = fs::read_to_string(path)?;
    let save = scan(&contents);
    let entries = into_entries(&save);
    if entries.is_empty() {
        return Err(Error::parse("tenoke", "no [ACHIEVEMENTS] entries"));
    }
    Ok(entries)
}

/// Line scanner; a brace value may continue over several lines until its closing `}`.
pub fn scan(contents: &str) -> TenokeSave {
    let mut save = TenokeSave::default();
    let mut block = Block::None;
    let mut pending: Option<(String, String)> = None;

    for raw_line in contents.trim_start_matches('\u{feff}').lines() {
        let line = raw_line.trim();

        if let Some((key, mut body)) = pending.take() {
            body.push(' ');
            body.push_str(line);
            if line.contains('}') {
                insert(&mut save, block, key, parse_value(&body));
            } else {
                pending = Some((key, body));
            }
            continue;
        }

        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            block = match line[1..line.len() - 1].trim().to_ascii_uppercase().as_str() {
                "STATS" => Block::Stats,
                "ACHIEVEMENTS" => Block::Achievements,
                _ => Block::Other,
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = unquote(key).to_string();
        let value = value.trim();

        if value.starts_with('{') && !value.contains('}') {
            pending = Some((key, value.to_string()));
        } else {
            insert(&mut save, block, key, parse_value(value));
        }
    }

    if let Some((key, body)) = pending {
        tracing::debug!(key = %key, "unterminated brace value in tenoke save");
        insert(&mut save, block, key, parse_value(&body));
    }

    save
}

fn insert(save: &mut TenokeSave, block: Block, key: String, value: TenokeValue) {
    match block {
        Block::Stats => {
            save.stats.insert(key, value);
        }
        Block::Achievements => {
            save.achievements.insert(key, value);
        }
        Block::None | Block::Other => {}
    }
}

fn parse_value(raw: &str) -> TenokeValue {
    let raw = raw.trim();
    let Some(inner) = raw.strip_prefix('{') else {
        return TenokeValue::Scalar(unquote(raw).to_string());
    };
    let inner = inner.trim_end().trim_end_matches('}');

    let fields = inner
        .split([',', ';'])
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (unquote(k).to_ascii_lowercase(), unquote(v).to_string()))
        .collect();
    TenokeValue::Object(fields)
}

fn into_entries(save: &TenokeSave) -> Vec<RawEntry> {
    save.achievements
        .iter()
        .map(|(key, value)| match value {
            TenokeValue::Scalar(flag) => RawEntry::new(key.as_str()).earned(coerce_earned_str(flag), 0),
            TenokeValue::Object(fields) => {
                let number = |name: &str| fields.get(name).and_then(|v| v.parse::<f64>().ok());
                let earned = fields
                    .get("unlocked")
                    .or_else(|| fields.get("achieved"))
                    .map(|v| coerce_earned_str(v))
                    .unwrap_or(false);
                let time = number("time").map(|t| normalize_epoch(t as i64)).unwrap_or(0);

                RawEntry::new(key.as_str())
                    .earned(earned, time)
                    .progress(number("progress"), number("max_progress"))
            }
        })
        .collect()
}

fn unquote(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}
