use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::GameConfig;
use crate::error::{Error, Result};

/// Epoch values below this are seconds, everything else is already milliseconds.
const SECONDS_THRESHOLD: i64 = 10_000_000_000;

/// Display text that is either a single string or a language -> text map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedText {
    Plain(String),
    Localized(IndexMap<String, String>),
}

impl Default for LocalizedText {
    fn default() -> Self {
        LocalizedText::Plain(String::new())
    }
}

impl LocalizedText {
    /// Resolve for `language`, falling back to english, then the first non-empty value.
    pub fn resolve(&self, language: &str) -> Option<&str> {
        match self {
            LocalizedText::Plain(text) => Some(text.as_str()).filter(|t| !t.trim().is_empty()),
            LocalizedText::Localized(map) => map
                .get(language)
                .filter(|t| !t.trim().is_empty())
                .or_else(|| map.get("english").filter(|t| !t.trim().is_empty()))
                .or_else(|| map.values().find(|t| !t.trim().is_empty()))
                .map(String::as_str),
        }
    }

    /// Every non-empty text variant, used to build display-name lookups.
    pub fn variants(&self) -> Vec<&str> {
        let all: Vec<&str> = match self {
            LocalizedText::Plain(text) => vec![text.as_str()],
            LocalizedText::Localized(map) => map.values().map(String::as_str).collect(),
        };
        all.into_iter().filter(|t| !t.trim().is_empty()).collect()
    }
}

/// One achievement as described by the game's schema file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementSchemaEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: LocalizedText,
    #[serde(default)]
    pub description: LocalizedText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_gray: Option<String>,
    #[serde(default, deserialize_with = "flag_from_any", serialize_with = "flag_as_number")]
    pub hidden: bool,
}

/// The loaded schema of a game plus the directory it was read from.
#[derive(Debug, Clone, Default)]
pub struct AchievementSchema {
    pub entries: Vec<AchievementSchemaEntry>,
    pub dir: PathBuf,
}

impl AchievementSchema {
    pub fn new(entries: Vec<AchievementSchemaEntry>, dir: PathBuf) -> Self {
        Self { entries, dir }
    }

    /// Load `achievements.json` from the config path, or its appid / platform nested variants.
    pub fn load(config: &GameConfig) -> Result<Self> {
        for path in Self::candidate_paths(config) {
            if !path.is_file() {
                continue;
            }

            let contents = fs::read_to_string(&path)?;
            let entries: Vec<AchievementSchemaEntry> = serde_json::from_str(&contents)?;
            tracing::debug!(game = %config.name, path = %path.display(), count = entries.len(), "loaded achievement schema");

            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| config.config_path.clone());
            return Ok(Self { entries, dir });
        }

        Err(Error::SchemaNotFound(config.config_path.clone()))
    }

    fn candidate_paths(config: &GameConfig) -> Vec<PathBuf> {
        let base = &config.config_path;
        vec![
            base.join("achievements.json"),
            base.join(&config.appid).join("achievements.json"),
            base.join(config.platform.as_str())
                .join(&config.appid)
                .join("achievements.json"),
        ]
    }

    pub fn get(&self, name: &str) -> Option<&AchievementSchemaEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical runtime state of one achievement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AchievementState {
    pub earned: bool,
    /// Unix milliseconds, 0 when unknown.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub earned_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_progress: Option<f64>,
}

impl AchievementState {
    pub fn earned_at(earned_time: i64) -> Self {
        Self {
            earned: true,
            earned_time: normalize_epoch(earned_time),
            progress: None,
            max_progress: None,
        }
    }

    pub fn locked() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: Option<f64>, max_progress: Option<f64>) -> Self {
        self.progress = progress;
        self.max_progress = max_progress;
        self
    }
}

/// Canonical achievement name -> state for one game.
pub type Snapshot = IndexMap<String, AchievementState>;

/// Normalize an epoch-like timestamp to milliseconds. Non-positive values mean unknown.
pub fn normalize_epoch(value: i64) -> i64 {
    if value <= 0 {
        0
    } else if value < SECONDS_THRESHOLD {
        value.saturating_mul(1000)
    } else {
        value
    }
}

/// Shared earned-flag rule: `true`, numeric 1, or "1"/"true"/"yes" in any case.
pub fn coerce_earned(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64() == Some(1.0),
        serde_json::Value::String(s) => coerce_earned_str(s),
        _ => false,
    }
}

pub fn coerce_earned_str(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Merge a freshly parsed snapshot over the previous one.
///
/// Earned entries never regress, and entries missing from `current` are carried
/// forward, so a partial read cannot lose state.
pub fn merge_with_fallback(current: Snapshot, fallback: &Snapshot) -> Snapshot {
    let mut merged = current;

    for (name, previous) in fallback {
        match merged.get_mut(name) {
            Some(state) => {
                if previous.earned && !state.earned {
                    state.earned = true;
                    state.earned_time = previous.earned_time;
                } else if previous.earned && state.earned && state.earned_time <= 0 {
                    state.earned_time = previous.earned_time;
                }
            }
            None => {
                merged.insert(name.clone(), *previous);
            }
        }
    }

    merged
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn flag_from_any<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_earned(&value))
}

fn flag_as_number<S>(flag: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(u8::from(*flag))
}

fn null_as_zero<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.map(|v| v as i64).unwrap_or(0))
}
