//! Per-format save parsers.
//!
//! Every format has a fallible reader producing [`RawEntry`] rows keyed by whatever
//! identifier the format stores. [`ParseContext::assemble`] canonicalizes those keys
//! against the schema and merges the result over the previous snapshot, and
//! [`parse_source`] wraps the whole thing so a malformed or half-written file only
//! ever yields the previous snapshot back.

pub mod gpd;
pub mod ini;
pub mod json;
pub mod ps3;
pub mod ps4;
pub mod registry;
pub mod stats_bin;
pub mod steam_appcache;
pub mod tenoke;

use std::collections::HashMap;

use crate::achievements::{
    merge_with_fallback, AchievementSchema, AchievementState, Snapshot,
};
use crate::canonical::NameIndex;
use crate::error::Result;
use crate::sources::SaveSource;

/// One achievement row as read from a save file, before canonicalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawEntry {
    pub key: String,
    pub earned: bool,
    /// Unix milliseconds, 0 when unknown.
    pub earned_time: i64,
    pub progress: Option<f64>,
    pub max_progress: Option<f64>,
}

impl RawEntry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn earned(mut self, earned: bool, earned_time: i64) -> Self {
        self.earned = earned;
        self.earned_time = if earned { earned_time.max(0) } else { 0 };
        self
    }

    pub fn progress(mut self, progress: Option<f64>, max_progress: Option<f64>) -> Self {
        self.progress = progress;
        self.max_progress = max_progress;
        self
    }

    fn into_state(self) -> AchievementState {
        AchievementState {
            earned: self.earned,
            earned_time: self.earned_time,
            progress: self.progress,
            max_progress: self.max_progress,
        }
    }
}

/// Per-game lookup data shared by all parsers.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    pub game: String,
    index: NameIndex,
    crc_names: HashMap<u32, String>,
}

impl ParseContext {
    pub fn new(game: impl Into<String>, schema: &AchievementSchema) -> Self {
        let crc_names = schema
            .entries
            .iter()
            .map(|entry| (crc32fast::hash(entry.name.as_bytes()), entry.name.clone()))
            .collect();

        Self {
            game: game.into(),
            index: NameIndex::from_schema(&schema.entries),
            crc_names,
        }
    }

    pub fn index(&self) -> &NameIndex {
        &self.index
    }

    /// Canonical name for a CRC32 found in a binary stats blob.
    pub fn name_for_crc(&self, crc: u32) -> Option<&str> {
        self.crc_names.get(&crc).map(String::as_str)
    }

    pub fn canonicalize(&self, raw: &str) -> String {
        self.index.resolve(raw)
    }

    /// Canonicalize raw rows and merge them over `fallback`.
    pub fn assemble(&self, entries: Vec<RawEntry>, fallback: &Snapshot) -> Snapshot {
        let mut current = Snapshot::new();
        let mut unresolved = 0usize;

        for entry in entries {
            let name = match self.index.lookup(&entry.key) {
                Some(name) => name,
                None => {
                    if !self.index.is_empty() {
                        unresolved += 1;
                        tracing::debug!(game = %self.game, key = %entry.key, "achievement key not in schema");
                    }
                    entry.key.clone()
                }
            };

            let state = entry.into_state();
            match current.get_mut(&name) {
                // Two raw keys landing on one name: an earned row wins.
                Some(existing) if existing.earned && !state.earned => {}
                Some(existing) => *existing = state,
                None => {
                    current.insert(name, state);
                }
            }
        }

        if unresolved > 0 {
            tracing::warn!(game = %self.game, unresolved, "some achievement keys could not be mapped to the schema");
        }

        merge_with_fallback(current, fallback)
    }
}

/// `crc32(name)` as the zero-padded lowercase hex key used by binary stats blobs.
pub fn crc_key(name: &str) -> String {
    format!("{:08x}", crc32fast::hash(name.as_bytes()))
}

fn read_entries(source: &SaveSource, ctx: &ParseContext) -> Result<Vec<RawEntry>> {
    match source {
        SaveSource::Json(path) => json::read_entries(path),
        SaveSource::Ini(path) => ini::read_entries(path),
        SaveSource::Tenoke(path) => tenoke::read_entries(path),
        SaveSource::StatsBin(path) => stats_bin::read_entries(path, ctx),
        SaveSource::SteamAppcache { schema, user_stats } => {
            steam_appcache::read_entries(schema, user_stats)
        }
        SaveSource::Gpd(path) => gpd::read_entries(path),
        SaveSource::Ps3 { dir } => ps3::read_entries(dir),
        SaveSource::Ps4 { xml_dir } => ps4::read_entries(xml_dir),
        SaveSource::Registry { key } => Err(crate::error::Error::Registry(format!(
            "registry source '{}' must be read asynchronously",
            key
        ))),
    }
}

/// Parse a file-backed save source. Never fails: any error yields `fallback` unchanged.
pub fn parse_source(source: &SaveSource, fallback: &Snapshot, ctx: &ParseContext) -> Snapshot {
    match read_entries(source, ctx) {
        Ok(entries) => ctx.assemble(entries, fallback),
        Err(e) => {
            tracing::debug!(game = %ctx.game, format = source.format_name(), "parse failed, keeping previous snapshot: {}", e);
            fallback.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::achievements::{AchievementSchemaEntry, LocalizedText};

    fn schema(names: &[&str]) -> AchievementSchema {
        let entries = names
            .iter()
            .map(|name| AchievementSchemaEntry {
                name: name.to_string(),
                display_name: LocalizedText::Plain(format!("{} display", name)),
                description: LocalizedText::default(),
                icon: None,
                icon_gray: None,
                hidden: false,
            })
            .collect();
        AchievementSchema::new(entries, Default::default())
    }

    #[test]
    fn crc_key_matches_lookup_table() {
        let ctx = ParseContext::new("game", &schema(&["ACH_WIN_GAME"]));
        let key = crc_key("ACH_WIN_GAME");
        assert_eq!(key.len(), 8);
        let crc = u32::from_str_radix(&key, 16).unwrap();
        assert_eq!(ctx.name_for_crc(crc), Some("ACH_WIN_GAME"));
    }

    #[test]
    fn assemble_canonicalizes_and_keeps_unknown_keys() {
        let ctx = ParseContext::new("game", &schema(&["10", "ACH_B"]));
        let entries = vec![
            RawEntry::new("Ach_10").earned(true, 1_000),
            RawEntry::new("ach_b"),
            RawEntry::new("mystery"),
        ];
        let snapshot = ctx.assemble(entries, &Snapshot::new());
        assert!(snapshot["10"].earned);
        assert!(!snapshot["ACH_B"].earned);
        assert!(snapshot.contains_key("mystery"));
    }

    #[test]
    fn assemble_prefers_earned_duplicate() {
        let ctx = ParseContext::new("game", &schema(&["A"]));
        let entries = vec![
            RawEntry::new("A").earned(true, 5),
            RawEntry::new("a"),
        ];
        let snapshot = ctx.assemble(entries, &Snapshot::new());
        assert!(snapshot["A"].earned);
    }

    #[test]
    fn assemble_is_monotonic_over_fallback() {
        let ctx = ParseContext::new("game", &schema(&["A"]));
        let mut previous = Snapshot::new();
        previous.insert("A".into(), AchievementState::earned_at(1_700_000_000));

        let snapshot = ctx.assemble(vec![RawEntry::new("A")], &previous);
        assert!(snapshot["A"].earned);
        assert_eq!(snapshot["A"].earned_time, 1_700_000_000_000);
    }

    #[test]
    fn parse_source_returns_fallback_on_missing_file() {
        let ctx = ParseContext::new("game", &schema(&["A"]));
        let mut previous = Snapshot::new();
        previous.insert("A".into(), AchievementState::earned_at(1));
        let source = SaveSource::Json("/definitely/not/here/achievements.json".into());
        assert_eq!(parse_source(&source, &previous, &ctx), previous);
    }
}
