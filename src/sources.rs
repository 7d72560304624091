//! Where a game's save data lives, in priority order, and which parser reads it.

use std::fs;
use std::path::{Path, PathBuf};

use crate::achievements::AchievementSchema;
use crate::config::{GameConfig, Platform};
use crate::error::{Error, Result};
use crate::parsers::{gpd, ps3, ps4, registry, steam_appcache, tenoke};

/// A concrete, existing save location bound to the parser that understands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveSource {
    Json(PathBuf),
    Ini(PathBuf),
    Tenoke(PathBuf),
    StatsBin(PathBuf),
    SteamAppcache { schema: PathBuf, user_stats: PathBuf },
    Gpd(PathBuf),
    Ps3 { dir: PathBuf },
    Ps4 { xml_dir: PathBuf },
    Registry { key: String },
}

impl SaveSource {
    pub fn format_name(&self) -> &'static str {
        match self {
            SaveSource::Json(_) => "json",
            SaveSource::Ini(_) => "ini",
            SaveSource::Tenoke(_) => "tenoke",
            SaveSource::StatsBin(_) => "stats.bin",
            SaveSource::SteamAppcache { .. } => "appcache",
            SaveSource::Gpd(_) => "gpd",
            SaveSource::Ps3 { .. } => "tropusr",
            SaveSource::Ps4 { .. } => "trophy xml",
            SaveSource::Registry { .. } => "registry",
        }
    }

    pub fn exists(&self) -> bool {
        match self {
            SaveSource::Json(path)
            | SaveSource::Ini(path)
            | SaveSource::Tenoke(path)
            | SaveSource::StatsBin(path)
            | SaveSource::Gpd(path) => path.is_file(),
            SaveSource::SteamAppcache { schema, user_stats } => {
                schema.is_file() && user_stats.is_file()
            }
            SaveSource::Ps3 { dir } => ps3::find_file(dir, ps3::USER_FILE).is_some(),
            SaveSource::Ps4 { xml_dir } => has_trophy_xml(xml_dir),
            SaveSource::Registry { .. } => true,
        }
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, SaveSource::Registry { .. })
    }

    /// Whether the data carries achievement names of its own.
    pub fn can_derive_schema(&self) -> bool {
        matches!(
            self,
            SaveSource::Ps3 { .. }
                | SaveSource::Ps4 { .. }
                | SaveSource::Gpd(_)
                | SaveSource::SteamAppcache { .. }
        )
    }

    /// Build a schema from the save data itself when the game has no schema file.
    pub fn derive_schema(&self) -> Result<AchievementSchema> {
        let (entries, dir) = match self {
            SaveSource::Ps3 { dir } => (ps3::derive_schema(dir)?, dir.clone()),
            SaveSource::Ps4 { xml_dir } => (
                ps4::derive_schema(xml_dir)?,
                xml_dir.parent().unwrap_or(xml_dir).to_path_buf(),
            ),
            SaveSource::Gpd(path) => (
                gpd::derive_schema(path)?,
                path.parent().unwrap_or(path).to_path_buf(),
            ),
            SaveSource::SteamAppcache { schema, .. } => (
                steam_appcache::derive_schema(schema)?,
                schema.parent().unwrap_or(schema).to_path_buf(),
            ),
            other => {
                return Err(Error::Other(format!(
                    "cannot derive a schema from {} data",
                    other.format_name()
                )))
            }
        };
        Ok(AchievementSchema::new(entries, dir))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Candidate {
    Json(PathBuf),
    /// Either flavour of emulator INI, or Tenoke if the content says so.
    Ini(PathBuf),
    Tenoke(PathBuf),
    StatsBin(PathBuf),
    SteamAppcache { dir: PathBuf },
    Gpd(PathBuf),
    AnyGpd { dir: PathBuf },
    Ps3 { dir: PathBuf },
    Ps4 { xml_dir: PathBuf },
    Registry { key: String },
}

impl Candidate {
    fn materialize(&self, appid: &str) -> Option<SaveSource> {
        match self {
            Candidate::Json(path) => path.is_file().then(|| SaveSource::Json(path.clone())),
            Candidate::Ini(path) => {
                if !path.is_file() {
                    return None;
                }
                let text = fs::read(path).ok()?;
                if tenoke::looks_like_tenoke(&String::from_utf8_lossy(&text)) {
                    Some(SaveSource::Tenoke(path.clone()))
                } else {
                    Some(SaveSource::Ini(path.clone()))
                }
            }
            Candidate::Tenoke(path) => path.is_file().then(|| SaveSource::Tenoke(path.clone())),
            Candidate::StatsBin(path) => path.is_file().then(|| SaveSource::StatsBin(path.clone())),
            Candidate::SteamAppcache { dir } => {
                let schema = dir.join(format!("UserGameStatsSchema_{}.bin", appid));
                if !schema.is_file() {
                    return None;
                }
                let user_stats = newest_user_stats(dir, appid)?;
                Some(SaveSource::SteamAppcache { schema, user_stats })
            }
            Candidate::Gpd(path) => path.is_file().then(|| SaveSource::Gpd(path.clone())),
            Candidate::AnyGpd { dir } => first_gpd(dir).map(SaveSource::Gpd),
            Candidate::Ps3 { dir } => ps3::find_file(dir, ps3::USER_FILE)
                .map(|_| SaveSource::Ps3 { dir: dir.clone() }),
            Candidate::Ps4 { xml_dir } => has_trophy_xml(xml_dir).then(|| SaveSource::Ps4 {
                xml_dir: xml_dir.clone(),
            }),
            Candidate::Registry { key } => Some(SaveSource::Registry { key: key.clone() }),
        }
    }
}

/// A game config plus its candidate save locations, most preferred first.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub config: GameConfig,
    candidates: Vec<Candidate>,
}

impl WatchTarget {
    pub fn build(config: &GameConfig) -> Self {
        let base = config.save_path.clone();
        let appid = config.appid.as_str();

        let candidates = match config.platform {
            Platform::Steam | Platform::Epic | Platform::Gog => {
                let levels = [
                    base.clone(),
                    base.join(appid),
                    base.join("steam_settings").join(appid),
                ];
                let mut c: Vec<Candidate> = levels
                    .iter()
                    .map(|dir| Candidate::Json(dir.join("achievements.json")))
                    .collect();
                c.extend(levels.iter().map(|dir| Candidate::Ini(dir.join("achievements.ini"))));
                c.push(Candidate::Ini(base.join("Stats").join("achievements.ini")));
                c.push(Candidate::Ini(base.join("stats").join("achievements.ini")));
                c.push(Candidate::Tenoke(base.join("SteamData").join("user_stats.ini")));
                c.extend(levels.iter().map(|dir| Candidate::StatsBin(dir.join("stats.bin"))));
                c.push(Candidate::SteamAppcache {
                    dir: base.join("appcache").join("stats"),
                });
                c.push(Candidate::SteamAppcache { dir: base.clone() });
                c
            }
            Platform::Rpcs3 => vec![
                Candidate::Ps3 { dir: base.clone() },
                Candidate::Ps3 { dir: base.join(appid) },
            ],
            Platform::Shadps4 => vec![
                Candidate::Ps4 { xml_dir: base.join("Xml") },
                Candidate::Ps4 {
                    xml_dir: base.join(appid).join("Xml"),
                },
                Candidate::Ps4 { xml_dir: base.clone() },
            ],
            Platform::Xenia => vec![
                Candidate::Gpd(base.join(format!("{}.gpd", appid))),
                Candidate::Gpd(base.join(format!("{}.gpd", appid.to_ascii_uppercase()))),
                Candidate::AnyGpd { dir: base.clone() },
            ],
            Platform::Luma => vec![Candidate::Registry {
                key: registry::luma_key_path(config),
            }],
        };

        Self {
            config: config.clone(),
            candidates,
        }
    }

    /// First candidate that exists right now.
    pub fn resolve(&self) -> Option<SaveSource> {
        self.candidates
            .iter()
            .find_map(|c| c.materialize(&self.config.appid))
    }

    /// Directory to subscribe to, `None` for registry-backed games or a missing save dir.
    pub fn watch_root(&self) -> Option<PathBuf> {
        if self.config.platform == Platform::Luma {
            return None;
        }
        let base = &self.config.save_path;
        (!base.as_os_str().is_empty() && base.is_dir()).then(|| base.clone())
    }

    /// Whether a filesystem event on `path` could change this game's save data.
    pub fn is_relevant(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let lower = name.to_ascii_lowercase();
        match self.config.platform {
            Platform::Steam | Platform::Epic | Platform::Gog => {
                matches!(
                    lower.as_str(),
                    "achievements.json" | "achievements.ini" | "stats.bin" | "user_stats.ini"
                ) || (lower.starts_with("usergamestats") && lower.ends_with(".bin"))
            }
            Platform::Rpcs3 => lower == "tropusr.dat" || lower == "tropconf.sfm",
            Platform::Shadps4 => ps4::language_for_file(name).is_some(),
            Platform::Xenia => lower.ends_with(".gpd"),
            Platform::Luma => false,
        }
    }
}

fn has_trophy_xml(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| ps4::language_for_file(n).is_some())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn newest_user_stats(dir: &Path, appid: &str) -> Option<PathBuf> {
    let suffix = format!("_{}.bin", appid);
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with("UserGameStats_") && n.ends_with(&suffix))
                .unwrap_or(false)
        })
        .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())
        .map(|e| e.path())
}

fn first_gpd(dir: &Path) -> Option<PathBuf> {
    let mut gpds: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("gpd"))
                .unwrap_or(false)
        })
        .collect();
    gpds.sort();
    gpds.into_iter().next()
}
