//! `achievements.ini` in its two emulator flavours.
//!
//! Type 2 sections carry plain fields (`Achieved=1`, `UnlockTime=1700000000`). Type 1
//! sections store `State`/`CurProgress`/`MaxProgress`/`Time` as little-endian hex dumps
//! (`State=0x01000000`) with a plain-number fallback.

use regex::Regex;
use std::fs;
use std::path::Path;

use super::RawEntry;
use crate::achievements::{coerce_earned_str, normalize_epoch};
use crate::error::{Error, Result};

const TYPE2_KEYS: &[&str] = &["achieved", "unlocked", "unlocktime", "unlock_time", "timestamp"];
const TYPE1_KEYS: &[&str] = &["state", "curprogress", "maxprogress", "time"];

/// Sections that hold emulator bookkeeping rather than achievements.
const SKIPPED_SECTIONS: &[&str] = &["steamachievements", "steam_achievements", "stats"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Hex,
    Plain,
}

#[derive(Debug, Default)]
struct Section<'a> {
    title: &'a str,
    fields: Vec<(String, &'a str)>,
}

impl<'a> Section<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    fn get_any(&self, keys: &[&str]) -> Option<&'a str> {
        keys.iter().find_map(|key| self.get(key))
    }

    fn has_any(&self, keys: &[&str]) -> bool {
        self.get_any(keys).is_some()
    }

    fn kind(&self) -> SectionKind {
        if self.has_any(TYPE2_KEYS) && !self.has_any(TYPE1_KEYS) {
            SectionKind::Plain
        } else {
            SectionKind::Hex
        }
    }
}

pub fn read_entries(path: &Path) -> Result<Vec<RawEntry>> {
    let contents = fs::read_to_string(path)?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Vec<RawEntry>> {
    let sections = split_sections(contents.trim_start_matches('\u{feff}'))?;

    let entries: Vec<RawEntry> = sections
        .iter()
        .filter(|s| !SKIPPED_SECTIONS.contains(&s.title.to_lowercase().as_str()))
        .filter(|s| !s.fields.is_empty())
        .map(|section| match section.kind() {
            SectionKind::Plain => read_plain(section),
            SectionKind::Hex => read_hex(section),
        })
        .collect();

    if entries.is_empty() {
        return Err(Error::parse("ini", "no achievement sections"));
    }
    Ok(entries)
}

fn split_sections(contents: &str) -> Result<Vec<Section<'_>>> {
    let section_regex = Regex::new(r"(?m)^[ \t]*\[([^\]\r\n]+)\][ \t]*\r?$")
        .map_err(|e| Error::parse("ini", format!("failed to create regex: {}", e)))?;

    let headers: Vec<_> = section_regex
        .captures_iter(contents)
        .filter_map(|cap| Some((cap.get(0)?, cap.get(1)?.as_str().trim())))
        .collect();

    let mut sections = Vec::with_capacity(headers.len());
    for (i, (header, title)) in headers.iter().enumerate() {
        let body_end = headers
            .get(i + 1)
            .map(|(next, _)| next.start())
            .unwrap_or(contents.len());
        let body = &contents[header.end()..body_end];

        let fields = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(';') && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim()))
            .collect();

        sections.push(Section {
            title: *title,
            fields,
        });
    }

    Ok(sections)
}

fn read_plain(section: &Section<'_>) -> RawEntry {
    let earned = section
        .get_any(&["achieved", "unlocked"])
        .map(coerce_earned_str)
        .unwrap_or(false);
    let time = section
        .get_any(&["unlocktime", "unlock_time", "timestamp"])
        .and_then(|v| unquote(v).parse::<i64>().ok())
        .map(normalize_epoch)
        .unwrap_or(0);
    let progress = section.get("curprogress").and_then(plain_number);
    let max_progress = section.get("maxprogress").and_then(plain_number);

    RawEntry::new(section.title)
        .earned(earned, time)
        .progress(progress, max_progress)
}

fn read_hex(section: &Section<'_>) -> RawEntry {
    let state = section.get("state").and_then(decode_field).unwrap_or(0.0);
    let progress = section.get("curprogress").and_then(decode_field);
    let max_progress = section.get("maxprogress").and_then(decode_field);
    let time = section
        .get("time")
        .and_then(decode_field)
        .map(|t| normalize_epoch(t as i64))
        .or_else(|| {
            section
                .get_any(&["unlocktime", "unlock_time"])
                .and_then(|v| unquote(v).parse::<i64>().ok())
                .map(normalize_epoch)
        })
        .unwrap_or(0);

    let completed = match (progress, max_progress) {
        (Some(p), Some(max)) => max > 0.0 && p >= max,
        _ => false,
    };
    let earned = section.get("achieved").map(|v| unquote(v) == "1").unwrap_or(false)
        || section.get("unlocked").map(coerce_earned_str).unwrap_or(false)
        || state > 0.0
        || completed;

    RawEntry::new(section.title)
        .earned(earned, time)
        .progress(progress, max_progress)
}

/// Decode a type-1 field: 8+ hex digits are a little-endian u32 dump, anything else a number.
pub fn decode_field(raw: &str) -> Option<f64> {
    let value = unquote(raw);
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    if hex.len() >= 8 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        return Some(f64::from(u32::from_le_bytes(bytes)));
    }

    plain_number(value)
}

fn plain_number(raw: &str) -> Option<f64> {
    let value = unquote(raw);
    value.parse::<f64>().ok().or_else(|| {
        if coerce_earned_str(value) {
            Some(1.0)
        } else {
            None
        }
    })
}

fn unquote(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}
