//! LumaPlay keeps achievements as registry values under the current user's hive.

use std::sync::Arc;

#[cfg(target_os = "windows")]
use winreg::enums::*;
#[cfg(target_os = "windows")]
use winreg::types::FromRegValue;
#[cfg(target_os = "windows")]
use winreg::RegKey;

use super::RawEntry;
use crate::achievements::coerce_earned_str;
use crate::config::GameConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryData {
    Dword(u32),
    Sz(String),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryValue {
    pub name: String,
    pub data: RegistryData,
}

/// Given a key path under HKCU, list its values.
pub trait RegistryQuery: Send + Sync {
    fn query(&self, key: &str) -> Result<Vec<RegistryValue>>;
}

/// Reads the real registry; errors on every other platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRegistry;

impl RegistryQuery for SystemRegistry {
    #[cfg(target_os = "windows")]
    fn query(&self, key: &str) -> Result<Vec<RegistryValue>> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let subkey = hkcu
            .open_subkey_with_flags(key, KEY_READ)
            .map_err(|e| Error::Registry(format!("{}: {}", key, e)))?;

        let mut values = Vec::new();
        for item in subkey.enum_values() {
            let (name, value) = item.map_err(|e| Error::Registry(e.to_string()))?;
            let data = match value.vtype {
                REG_DWORD => u32::from_reg_value(&value)
                    .map(RegistryData::Dword)
                    .map_err(|e| Error::Registry(e.to_string()))?,
                REG_SZ | REG_EXPAND_SZ => String::from_reg_value(&value)
                    .map(RegistryData::Sz)
                    .map_err(|e| Error::Registry(e.to_string()))?,
                _ => RegistryData::Other(value.to_string()),
            };
            values.push(RegistryValue { name, data });
        }
        Ok(values)
    }

    #[cfg(not(target_os = "windows"))]
    fn query(&self, key: &str) -> Result<Vec<RegistryValue>> {
        Err(Error::Registry(format!(
            "registry is not available on this platform ({})",
            key
        )))
    }
}

/// `Software\LumaPlay\<user>\<appid>\Achievements`, without the user segment when none is set.
pub fn luma_key_path(config: &GameConfig) -> String {
    match config.user.as_deref().filter(|u| !u.is_empty()) {
        Some(user) => format!(r"Software\LumaPlay\{}\{}\Achievements", user, config.appid),
        None => format!(r"Software\LumaPlay\{}\Achievements", config.appid),
    }
}

pub fn entries_from_values(values: &[RegistryValue]) -> Vec<RawEntry> {
    values
        .iter()
        .filter(|v| !v.name.is_empty())
        .map(|v| {
            let earned = match &v.data {
                RegistryData::Dword(n) => coerce_earned_str(&n.to_string()),
                RegistryData::Sz(s) | RegistryData::Other(s) => coerce_earned_str(s),
            };
            RawEntry::new(v.name.as_str()).earned(earned, 0)
        })
        .collect()
}

/// Query off the async runtime; the registry call blocks.
pub async fn read(registry: Arc<dyn RegistryQuery>, key: String) -> Result<Vec<RawEntry>> {
    let values = tokio::task::spawn_blocking(move || registry.query(&key))
        .await
        .map_err(|e| Error::Other(format!("registry task failed: {}", e)))??;
    Ok(entries_from_values(&values))
}
