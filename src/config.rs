use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Where a game's save data comes from, which decides candidate paths and parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Steam,
    Epic,
    Gog,
    #[serde(alias = "lumaplay")]
    Luma,
    #[serde(alias = "ps3")]
    Rpcs3,
    #[serde(alias = "ps4")]
    Shadps4,
    #[serde(alias = "xbox360")]
    Xenia,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Steam => "steam",
            Platform::Epic => "epic",
            Platform::Gog => "gog",
            Platform::Luma => "luma",
            Platform::Rpcs3 => "rpcs3",
            Platform::Shadps4 => "shadps4",
            Platform::Xenia => "xenia",
        }
    }

    /// Console containers carry their own trophy/achievement metadata.
    pub fn is_console(&self) -> bool {
        matches!(self, Platform::Rpcs3 | Platform::Shadps4 | Platform::Xenia)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tracked game as handed over by the configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub name: String,
    pub appid: String,
    pub platform: Platform,
    pub config_path: PathBuf,
    #[serde(default)]
    pub save_path: PathBuf,
    /// Registry user segment for LumaPlay keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_achievement_duration")]
    pub achievement_duration: u32,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_icon: Option<PathBuf>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_pending_recheck_secs")]
    pub pending_recheck_secs: u64,
    #[serde(default = "default_registry_poll_secs")]
    pub registry_poll_secs: u64,
    #[serde(default)]
    pub games: Vec<GameConfig>,
}

fn default_language() -> String {
    "english".to_string()
}

fn default_achievement_duration() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_preset() -> String {
    "default".to_string()
}

fn default_position() -> String {
    "bottom-right".to_string()
}

fn default_debounce_ms() -> u64 {
    150
}

fn default_cooldown_ms() -> u64 {
    200
}

fn default_retry_delay_ms() -> u64 {
    220
}

fn default_pending_recheck_secs() -> u64 {
    600
}

fn default_registry_poll_secs() -> u64 {
    5
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            achievement_duration: default_achievement_duration(),
            notifications_enabled: true,
            preset: default_preset(),
            position: default_position(),
            sound: None,
            cache_dir: None,
            fallback_icon: None,
            debounce_ms: default_debounce_ms(),
            cooldown_ms: default_cooldown_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            pending_recheck_secs: default_pending_recheck_secs(),
            registry_poll_secs: default_registry_poll_secs(),
            games: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn notification_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.achievement_duration))
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("achievement-companion")
                .join("cache")
        })
    }

    /// Reject configs the watcher could never attach.
    pub fn validate(&self) -> Result<()> {
        for game in &self.games {
            if game.name.trim().is_empty() {
                return Err(Error::Config(format!(
                    "game with appid '{}' has an empty name",
                    game.appid
                )));
            }
            if game.appid.trim().is_empty() {
                return Err(Error::Config(format!("game '{}' has no appid", game.name)));
            }
        }
        Ok(())
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    pub fn new() -> Self {
        let config_path = Self::get_config_path();
        let config = Self::load_from_file(&config_path);

        Self {
            config_path,
            config,
        }
    }

    pub fn with_path(config_path: PathBuf) -> Self {
        let config = Self::load_from_file(&config_path);
        Self {
            config_path,
            config,
        }
    }

    fn get_config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("achievement-companion");

        fs::create_dir_all(&config_dir).ok();
        config_dir.join("config.json")
    }

    fn load_from_file(path: &Path) -> AppConfig {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "invalid config, using defaults: {}", e);
                AppConfig::default()
            }),
            Err(_) => AppConfig::default(),
        }
    }

    fn save_to_file(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.config_path, json)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn get_all(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn set_all(&mut self, config: AppConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save_to_file()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
