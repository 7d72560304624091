//! Maps raw achievement identifiers found in save data to schema names.

use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

use crate::achievements::AchievementSchemaEntry;

/// Lookup tables built once per game from its schema.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    by_name: HashMap<String, String>,
    by_display: HashMap<String, String>,
}

impl NameIndex {
    pub fn from_schema(entries: &[AchievementSchemaEntry]) -> Self {
        let mut index = Self::default();

        for entry in entries {
            index
                .by_name
                .entry(normalize_key(&entry.name))
                .or_insert_with(|| entry.name.clone());

            for text in entry.display_name.variants() {
                index
                    .by_display
                    .entry(normalize_key(text))
                    .or_insert_with(|| entry.name.clone());
            }
        }

        index
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Resolve a raw key, or return it unchanged when nothing matches.
    pub fn resolve(&self, raw: &str) -> String {
        self.lookup(raw).unwrap_or_else(|| raw.to_string())
    }

    /// Resolve a raw key only if it maps onto the schema.
    pub fn lookup(&self, raw: &str) -> Option<String> {
        let key = normalize_key(raw);
        if let Some(name) = self.by_name.get(&key).or_else(|| self.by_display.get(&key)) {
            return Some(name.clone());
        }

        aliases(raw).into_iter().find_map(|alias| {
            let alias = normalize_key(&alias);
            self.by_name
                .get(&alias)
                .or_else(|| self.by_display.get(&alias))
                .cloned()
        })
    }
}

/// NFKC, ellipsis folded to "...", whitespace runs collapsed, trimmed, lowercased.
pub fn normalize_key(raw: &str) -> String {
    let folded: String = raw.nfkc().collect::<String>().replace('\u{2026}', "...");
    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn aliases(raw: &str) -> Vec<String> {
    let mut out = Vec::new();

    let stripped = raw
        .strip_prefix("ach_")
        .or_else(|| raw.strip_prefix("Ach_"))
        .unwrap_or(raw);
    if stripped != raw && !stripped.is_empty() {
        out.push(stripped.to_string());
    }

    if let Some((head, digits)) = stripped.rsplit_once('_') {
        let numeric = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
        if numeric && head.chars().any(|c| c.is_alphabetic()) {
            out.push(digits.to_string());
        }
    }

    out
}
