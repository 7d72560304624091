//! Xbox 360 GPD files (XDBF resource tables) as written by Xenia.

use chrono::{DateTime, Datelike};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::RawEntry;
use crate::achievements::{AchievementSchemaEntry, LocalizedText};
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"XDBF";
pub const HEADER_LEN: usize = 0x18;
pub const ENTRY_LEN: usize = 18;
pub const FREE_ENTRY_LEN: usize = 8;

pub const NS_ACHIEVEMENT: u16 = 1;
pub const NS_IMAGE: u16 = 2;
pub const NS_STRING: u16 = 5;
pub const TITLE_ID: u64 = 0x8000;

pub const FLAG_EARNED: u32 = 0x20000;
const ACHIEVEMENT_HEADER_LEN: usize = 0x1C;

/// Sync records share the achievement namespace.
const FIRST_SYNC_ID: u64 = 0x1_0000_0000;

const FILETIME_EPOCH_MS: i64 = 11_644_473_600_000;
const DOTNET_EPOCH_MS: i64 = 62_135_596_800_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    fn u16(self, bytes: &[u8], offset: usize) -> Option<u16> {
        let b: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
        Some(match self {
            Endian::Big => u16::from_be_bytes(b),
            Endian::Little => u16::from_le_bytes(b),
        })
    }

    fn u32(self, bytes: &[u8], offset: usize) -> Option<u32> {
        let b: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self {
            Endian::Big => u32::from_be_bytes(b),
            Endian::Little => u32::from_le_bytes(b),
        })
    }

    fn u64(self, bytes: &[u8], offset: usize) -> Option<u64> {
        let b: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
        Some(match self {
            Endian::Big => u64::from_be_bytes(b),
            Endian::Little => u64::from_le_bytes(b),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdbfHeader {
    pub endian: Endian,
    pub version: u32,
    pub entry_table_len: u32,
    pub entry_count: u32,
    pub free_table_len: u32,
    pub free_count: u32,
}

impl XdbfHeader {
    fn read(bytes: &[u8], endian: Endian) -> Option<Self> {
        Some(Self {
            endian,
            version: endian.u32(bytes, 4)?,
            entry_table_len: endian.u32(bytes, 8)?,
            entry_count: endian.u32(bytes, 12)?,
            free_table_len: endian.u32(bytes, 16)?,
            free_count: endian.u32(bytes, 20)?,
        })
    }

    pub fn data_start(&self) -> usize {
        HEADER_LEN
            + self.entry_table_len as usize * ENTRY_LEN
            + self.free_table_len as usize * FREE_ENTRY_LEN
    }

    /// Sanity score for this reading of the header; negative means implausible.
    fn plausibility(&self, file_len: usize) -> i32 {
        if self.version > 0x10000
            || self.entry_table_len > 10_000
            || self.free_table_len > 10_000
            || self.entry_count > self.entry_table_len
            || self.free_count > self.free_table_len
            || self.data_start() > file_len
        {
            return -1;
        }
        let mut score = 1;
        if self.version == 0x10000 {
            score += 2;
        }
        if self.entry_count > 0 {
            score += 1;
        }
        score
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpdAchievement {
    pub id: u32,
    pub image_id: u32,
    pub gamerscore: u32,
    pub flags: u32,
    /// Unix milliseconds, 0 when unknown.
    pub unlock_time: i64,
    pub name: String,
    pub locked_description: String,
    pub unlocked_description: String,
}

impl GpdAchievement {
    pub fn earned(&self) -> bool {
        self.flags & FLAG_EARNED != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpdFile {
    pub title: Option<String>,
    pub achievements: Vec<GpdAchievement>,
    pub images: IndexMap<u64, Vec<u8>>,
}

/// Pick the byte order whose header reading is plausible, preferring big-endian on ties.
pub fn read_header(bytes: &[u8]) -> Result<XdbfHeader> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(Error::parse("gpd", "missing XDBF magic"));
    }

    let candidates: Vec<(XdbfHeader, i32)> = [Endian::Big, Endian::Little]
        .into_iter()
        .filter_map(|endian| XdbfHeader::read(bytes, endian))
        .map(|header| {
            let score = header.plausibility(bytes.len());
            (header, score)
        })
        .filter(|(_, score)| *score >= 0)
        .collect();

    match candidates.as_slice() {
        [] => Err(Error::parse("gpd", "header is implausible in both byte orders")),
        [(only, _)] => Ok(*only),
        [(big, big_score), (little, little_score), ..] => {
            if big_score == little_score {
                tracing::warn!(score = big_score, "GPD byte order is ambiguous, assuming big-endian");
            }
            Ok(if little_score > big_score { *little } else { *big })
        }
    }
}

pub fn parse(bytes: &[u8]) -> Result<GpdFile> {
    let header = read_header(bytes)?;
    let endian = header.endian;
    let data_start = header.data_start();
    let mut gpd = GpdFile::default();

    for i in 0..header.entry_count as usize {
        let at = HEADER_LEN + i * ENTRY_LEN;
        let (Some(namespace), Some(id), Some(offset), Some(length)) = (
            endian.u16(bytes, at),
            endian.u64(bytes, at + 2),
            endian.u32(bytes, at + 10),
            endian.u32(bytes, at + 14),
        ) else {
            return Err(Error::parse("gpd", "entry table truncated"));
        };

        let start = data_start + offset as usize;
        let Some(payload) = bytes.get(start..start + length as usize) else {
            tracing::debug!(namespace, id, "GPD entry points outside the file");
            continue;
        };

        match namespace {
            NS_ACHIEVEMENT if id < FIRST_SYNC_ID => {
                if let Some(achievement) = read_achievement(payload, endian) {
                    gpd.achievements.push(achievement);
                }
            }
            NS_IMAGE => {
                gpd.images.insert(id, payload.to_vec());
            }
            NS_STRING if id == TITLE_ID => {
                gpd.title = Some(utf16be_strings(payload).next().unwrap_or_default());
            }
            _ => {}
        }
    }

    Ok(gpd)
}

fn read_achievement(payload: &[u8], endian: Endian) -> Option<GpdAchievement> {
    let size = endian.u32(payload, 0)? as usize;
    let strings_at = if (ACHIEVEMENT_HEADER_LEN..payload.len()).contains(&size) {
        size
    } else {
        ACHIEVEMENT_HEADER_LEN
    };
    let raw_time = endian.u64(payload, 20)? as i64;

    let mut strings = utf16be_strings(payload.get(strings_at..)?);
    Some(GpdAchievement {
        id: endian.u32(payload, 4)?,
        image_id: endian.u32(payload, 8)?,
        gamerscore: endian.u32(payload, 12)?,
        flags: endian.u32(payload, 16)?,
        unlock_time: ticks_to_unix_ms(raw_time),
        name: strings.next().unwrap_or_default(),
        locked_description: strings.next().unwrap_or_default(),
        unlocked_description: strings.next().unwrap_or_default(),
    })
}

/// Null-terminated UTF-16BE strings laid back to back.
fn utf16be_strings(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let mut parts: Vec<String> = units
        .split(|&u| u == 0)
        .map(String::from_utf16_lossy)
        .collect();
    // trailing terminator leaves an empty tail
    if parts.last().map(String::is_empty).unwrap_or(false) {
        parts.pop();
    }
    parts.into_iter()
}

/// Interpret 100ns ticks as FILETIME or .NET ticks, keeping whichever lands in 2000-2100.
pub fn ticks_to_unix_ms(raw: i64) -> i64 {
    if raw <= 0 {
        return 0;
    }
    let filetime = raw / 10_000 - FILETIME_EPOCH_MS;
    let dotnet = raw / 10_000 - DOTNET_EPOCH_MS;

    let plausible = |ms: i64| {
        DateTime::from_timestamp_millis(ms)
            .map(|dt| (2000..=2100).contains(&dt.year()))
            .unwrap_or(false)
    };

    if plausible(filetime) {
        filetime
    } else if plausible(dotnet) {
        dotnet
    } else {
        0
    }
}

pub fn read_entries(path: &Path) -> Result<Vec<RawEntry>> {
    let gpd = parse(&fs::read(path)?)?;
    if gpd.achievements.is_empty() {
        return Err(Error::parse("gpd", "no achievement records"));
    }
    Ok(gpd
        .achievements
        .iter()
        .map(|a| RawEntry::new(a.id.to_string()).earned(a.earned(), a.unlock_time))
        .collect())
}

/// Where image entries of the GPD at `path` are unpacked, one folder per file.
pub fn icon_cache_dir(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("gpd");
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("achievement-companion")
        .join("gpd-icons")
        .join(stem)
}

/// Schema entries taken from the GPD itself, for games without a schema file.
pub fn derive_schema(path: &Path) -> Result<Vec<AchievementSchemaEntry>> {
    derive_schema_with_icons(path, &icon_cache_dir(path))
}

/// Like [`derive_schema`], writing the embedded achievement images under `icon_dir`.
pub fn derive_schema_with_icons(path: &Path, icon_dir: &Path) -> Result<Vec<AchievementSchemaEntry>> {
    let gpd = parse(&fs::read(path)?)?;
    let icons = export_images(&gpd.images, icon_dir);
    tracing::info!(
        title = gpd.title.as_deref().unwrap_or("unknown title"),
        achievements = gpd.achievements.len(),
        icons = icons.len(),
        "deriving schema from GPD"
    );

    Ok(gpd
        .achievements
        .into_iter()
        .map(|a| {
            let description = if a.unlocked_description.is_empty() {
                a.locked_description
            } else {
                a.unlocked_description
            };
            AchievementSchemaEntry {
                name: a.id.to_string(),
                display_name: LocalizedText::Plain(a.name),
                description: LocalizedText::Plain(description),
                icon: icons
                    .get(&u64::from(a.image_id))
                    .map(|p| p.to_string_lossy().into_owned()),
                icon_gray: None,
                hidden: false,
            }
        })
        .collect())
}

/// Image entries are PNG blobs keyed by image id.
fn export_images(images: &IndexMap<u64, Vec<u8>>, dir: &Path) -> HashMap<u64, PathBuf> {
    if images.is_empty() {
        return HashMap::new();
    }
    if let Err(e) = fs::create_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), "cannot create GPD icon folder: {}", e);
        return HashMap::new();
    }

    images
        .iter()
        .filter_map(|(id, bytes)| {
            let path = dir.join(format!("{}.png", id));
            match fs::write(&path, bytes) {
                Ok(()) => Some((*id, path)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cannot write GPD icon: {}", e);
                    None
                }
            }
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::encode::*;
    use super::*;
    use crate::achievements::Snapshot;
    use crate::diff::diff;
    use crate::parsers::ParseContext;

    const T: i64 = 1_700_000_000_000;

    fn records(flags5: u32) -> Vec<Record> {
        vec![
            Record { id: 1, flags: FLAG_EARNED, ticks: filetime(T), name: "First" },
            Record { id: 5, flags: flags5, ticks: if flags5 & FLAG_EARNED != 0 { dotnet(T) } else { 0 }, name: "Fifth" },
        ]
    }

    #[test]
    fn parses_big_endian_container() {
        let gpd = parse(&encode::gpd("Halo", &records(0), Endian::Big)).unwrap();
        assert_eq!(gpd.title.as_deref(), Some("Halo"));
        assert_eq!(gpd.achievements.len(), 2);
        assert_eq!(gpd.achievements[0].name, "First");
        assert_eq!(gpd.achievements[0].unlocked_description, "unlocked");
        assert!(gpd.achievements[0].earned());
        assert_eq!(gpd.achievements[0].unlock_time, T);
        assert!(!gpd.achievements[1].earned());
    }

    #[test]
    fn parses_little_endian_container() {
        let gpd = parse(&encode::gpd("Halo", &records(0), Endian::Little)).unwrap();
        assert_eq!(gpd.achievements.len(), 2);
        assert_eq!(gpd.achievements[1].id, 5);
    }

    #[test]
    fn tick_conversions_pick_plausible_year() {
        assert_eq!(ticks_to_unix_ms(filetime(T)), T);
        assert_eq!(ticks_to_unix_ms(dotnet(T)), T);
        assert_eq!(ticks_to_unix_ms(0), 0);
        assert_eq!(ticks_to_unix_ms(12345), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(parse(b"XDBX\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0").is_err());
        assert!(parse(b"XD").is_err());
    }

    #[test]
    fn second_read_reports_new_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4D5307E6.gpd");
        let schema = crate::achievements::AchievementSchema::new(Vec::new(), Default::default());
        let ctx = ParseContext::new("halo", &schema);

        std::fs::write(&path, encode::gpd("Halo", &records(0), Endian::Big)).unwrap();
        let first = ctx.assemble(read_entries(&path).unwrap(), &Snapshot::new());

        std::fs::write(&path, encode::gpd("Halo", &records(FLAG_EARNED), Endian::Big)).unwrap();
        let second = ctx.assemble(read_entries(&path).unwrap(), &first);

        let d = diff(&first, &second);
        assert_eq!(d.earned, vec!["5".to_string()]);
        assert_eq!(second["5"].earned_time, T);
    }

    #[test]
    fn derives_schema_from_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.gpd");
        std::fs::write(&path, encode::gpd("Halo", &records(0), Endian::Big)).unwrap();
        let icons = dir.path().join("icons");
        let entries = derive_schema_with_icons(&path, &icons).unwrap();
        assert_eq!(entries[1].name, "5");
        assert_eq!(entries[1].display_name.resolve("english"), Some("Fifth"));
        assert_eq!(entries[1].icon, None);
        assert!(!icons.exists());
    }

    #[test]
    fn embedded_images_become_icons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4D5307E6.gpd");
        let png: &[u8] = b"\x89PNG\r\n\x1a\nfake";
        std::fs::write(
            &path,
            encode::gpd_with_images("Halo", &records(0), &[(105, png)], Endian::Big),
        )
        .unwrap();

        let gpd = parse(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(gpd.images.get(&105).map(Vec::as_slice), Some(png));

        let icons = dir.path().join("icons");
        let entries = derive_schema_with_icons(&path, &icons).unwrap();
        assert_eq!(entries[0].icon, None);
        let icon = PathBuf::from(entries[1].icon.as_deref().unwrap());
        assert_eq!(icon, icons.join("105.png"));
        assert_eq!(std::fs::read(&icon).unwrap(), png);
    }

    #[test]
    fn icon_folder_follows_file_stem() {
        let dir = icon_cache_dir(Path::new("/saves/4D5307E6.gpd"));
        assert!(dir.ends_with("achievement-companion/gpd-icons/4D5307E6"));
    }
}
