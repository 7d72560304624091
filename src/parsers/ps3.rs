//! RPCS3 trophy sets: `TROPCONF.SFM` for the trophy list and `TROPUSR.DAT` for
//! the user's unlock records.
//!
//! `TROPUSR.DAT` has no documented layout. The record table is located through its
//! type-6 descriptor and the id/flag field offsets are picked by scoring every
//! candidate against the expectation that record `i` describes trophy `i`.

use indexmap::IndexMap;
use regex::Regex;
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use super::RawEntry;
use crate::achievements::{AchievementSchemaEntry, LocalizedText};
use crate::error::{Error, Result};

pub const CONF_FILE: &str = "TROPCONF.SFM";
pub const USER_FILE: &str = "TROPUSR.DAT";

const DESCRIPTOR_SCAN_LIMIT: usize = 0x600;
const DESCRIPTOR_TYPE: u32 = 6;
const MIN_STRIDE: usize = 0x10;
const MAX_STRIDE: usize = 0x400;
const MAX_RECORDS: usize = 1024;
const SAMPLE_RECORDS: usize = 64;
const LOW_CONFIDENCE: f64 = 0.8;

const DOTNET_EPOCH_MS: i64 = 62_135_596_800_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TrophyDef {
    pub id: u32,
    pub ttype: String,
    pub hidden: bool,
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrophyConf {
    pub title: Option<String>,
    pub trophies: Vec<TrophyDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TropusrLayout {
    pub table_offset: usize,
    pub stride: usize,
    pub count: usize,
    pub id_offset: usize,
    pub flag_offset: usize,
    pub time_offset: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrophyUnlock {
    pub earned: bool,
    /// Unix milliseconds, 0 when unknown.
    pub time: i64,
}

/// Best-guess decoding of `TROPUSR.DAT`.
#[derive(Debug, Clone, PartialEq)]
pub struct TropusrScan {
    pub layout: TropusrLayout,
    pub unlocks: IndexMap<u32, TrophyUnlock>,
    /// Share of sampled records whose id matched their index.
    pub confidence: f64,
}

impl TropusrScan {
    pub fn is_confident(&self) -> bool {
        self.confidence >= LOW_CONFIDENCE
    }
}

pub fn parse_conf(text: &str) -> Result<TrophyConf> {
    let trophy_re = Regex::new(r"(?s)<trophy\s([^>]*)>(.*?)</trophy>")
        .map_err(|e| Error::parse("tropconf", e.to_string()))?;
    let attr_re = Regex::new(r#"([A-Za-z_-]+)\s*=\s*"([^"]*)""#)
        .map_err(|e| Error::parse("tropconf", e.to_string()))?;
    let title_re = Regex::new(r"(?s)<title-name>(.*?)</title-name>")
        .map_err(|e| Error::parse("tropconf", e.to_string()))?;

    let child = |body: &str, tag: &str| -> String {
        let open = format!("<{}>", tag);
        let close = format!("</{}>", tag);
        body.find(&open)
            .and_then(|start| {
                let rest = &body[start + open.len()..];
                rest.find(&close).map(|end| unescape(rest[..end].trim()))
            })
            .unwrap_or_default()
    };

    let mut conf = TrophyConf {
        title: title_re
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| unescape(m.as_str().trim())),
        trophies: Vec::new(),
    };

    for cap in trophy_re.captures_iter(text) {
        let (Some(attrs), Some(body)) = (cap.get(1), cap.get(2)) else {
            continue;
        };
        let attrs: IndexMap<&str, &str> = attr_re
            .captures_iter(attrs.as_str())
            .filter_map(|a| Some((a.get(1)?.as_str(), a.get(2)?.as_str())))
            .collect();
        let Some(id) = attrs.get("id").and_then(|id| id.trim().parse::<u32>().ok()) else {
            continue;
        };

        conf.trophies.push(TrophyDef {
            id,
            ttype: attrs.get("ttype").copied().unwrap_or_default().to_string(),
            hidden: attrs.get("hidden").map(|h| h.eq_ignore_ascii_case("yes")).unwrap_or(false),
            name: child(body.as_str(), "name"),
            detail: child(body.as_str(), "detail"),
        });
    }

    if conf.trophies.is_empty() {
        return Err(Error::parse("tropconf", "no <trophy> entries"));
    }
    Ok(conf)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn be_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

/// Find the `(table offset, stride, count)` of the first plausible type-6 descriptor.
fn find_descriptor(bytes: &[u8]) -> Option<(usize, usize, usize)> {
    let limit = DESCRIPTOR_SCAN_LIMIT.min(bytes.len());
    (0..limit).step_by(4).find_map(|at| {
        if be_u32(bytes, at)? != DESCRIPTOR_TYPE {
            return None;
        }
        let stride = be_u32(bytes, at + 4)? as usize;
        let count = be_u32(bytes, at + 12)? as usize;
        let offset = usize::try_from(be_u64(bytes, at + 16)?).ok()?;

        let plausible = (MIN_STRIDE..=MAX_STRIDE).contains(&stride)
            && (1..=MAX_RECORDS).contains(&count)
            && offset >= at
            && offset
                .checked_add(stride * count)
                .map(|end| end <= bytes.len())
                .unwrap_or(false);
        plausible.then_some((offset, stride, count))
    })
}

/// Score every (id, flag) offset pair and keep the best.
pub fn scan_tropusr(bytes: &[u8]) -> Result<TropusrScan> {
    let (table_offset, stride, count) = find_descriptor(bytes)
        .ok_or_else(|| Error::parse("tropusr", "no plausible record descriptor"))?;
    let sample = count.min(SAMPLE_RECORDS);
    let field = |i: usize, off: usize| be_u32(bytes, table_offset + i * stride + off);

    let mut best: Option<((usize, usize, bool, bool, Reverse<usize>), usize, usize)> = None;
    for id_offset in (0..stride.saturating_sub(4)).step_by(4) {
        for flag_offset in (id_offset + 4..=id_offset + 12).step_by(4) {
            if flag_offset + 4 > stride {
                break;
            }
            let mut id_matches = 0;
            let mut flag_binary = 0;
            let mut has_one = false;
            for i in 0..sample {
                if field(i, id_offset) == Some(i as u32) {
                    id_matches += 1;
                }
                match field(i, flag_offset) {
                    Some(0) => flag_binary += 1,
                    Some(1) => {
                        flag_binary += 1;
                        has_one = true;
                    }
                    _ => {}
                }
            }
            let score = (
                id_matches,
                flag_binary,
                has_one,
                flag_offset == id_offset + 4,
                Reverse(id_offset),
            );
            if best.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
                best = Some((score, id_offset, flag_offset));
            }
        }
    }

    let Some(((id_matches, ..), id_offset, flag_offset)) = best else {
        return Err(Error::parse("tropusr", "record stride too small"));
    };
    let time_offset = Some(id_offset + 16).filter(|off| off + 8 <= stride);
    let layout = TropusrLayout {
        table_offset,
        stride,
        count,
        id_offset,
        flag_offset,
        time_offset,
    };

    let mut unlocks = IndexMap::new();
    for i in 0..count {
        let base = table_offset + i * stride;
        let (Some(id), Some(flag)) = (field(i, id_offset), field(i, flag_offset)) else {
            break;
        };
        let time = time_offset
            .and_then(|off| be_u64(bytes, base + off))
            .map(microseconds_to_unix_ms)
            .unwrap_or(0);
        unlocks.insert(
            id,
            TrophyUnlock {
                earned: flag == 1,
                time,
            },
        );
    }

    let confidence = id_matches as f64 / sample as f64;
    let scan = TropusrScan {
        layout,
        unlocks,
        confidence,
    };
    if !scan.is_confident() {
        tracing::warn!(
            confidence = scan.confidence,
            id_offset,
            flag_offset,
            "TROPUSR.DAT layout validation inconclusive, using best guess"
        );
    }
    Ok(scan)
}

/// Microseconds since 0001-01-01 to Unix milliseconds.
fn microseconds_to_unix_ms(raw: u64) -> i64 {
    if raw == 0 {
        return 0;
    }
    let ms = (raw / 1000) as i64 - DOTNET_EPOCH_MS;
    ms.max(0)
}

/// Look up a file by name ignoring case, since dumps differ in casing.
pub(crate) fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = dir.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
}

fn read_conf(dir: &Path) -> Result<TrophyConf> {
    let path = find_file(dir, CONF_FILE).ok_or_else(|| Error::SaveDirNotFound(dir.join(CONF_FILE)))?;
    parse_conf(&String::from_utf8_lossy(&fs::read(path)?))
}

pub fn read_entries(dir: &Path) -> Result<Vec<RawEntry>> {
    let user = find_file(dir, USER_FILE).ok_or_else(|| Error::SaveDirNotFound(dir.join(USER_FILE)))?;
    let scan = scan_tropusr(&fs::read(user)?)?;

    let mut entries: Vec<RawEntry> = scan
        .unlocks
        .iter()
        .map(|(id, unlock)| RawEntry::new(id.to_string()).earned(unlock.earned, unlock.time))
        .collect();

    // trophies listed in the config but missing from the user file are locked
    if let Ok(conf) = read_conf(dir) {
        for trophy in conf.trophies {
            if !scan.unlocks.contains_key(&trophy.id) {
                entries.push(RawEntry::new(trophy.id.to_string()));
            }
        }
    }
    Ok(entries)
}

pub fn derive_schema(dir: &Path) -> Result<Vec<AchievementSchemaEntry>> {
    let conf = read_conf(dir)?;
    Ok(conf
        .trophies
        .into_iter()
        .map(|t| AchievementSchemaEntry {
            name: t.id.to_string(),
            display_name: LocalizedText::Plain(t.name),
            description: LocalizedText::Plain(t.detail),
            icon: Some(format!("TROP{:03}.PNG", t.id)),
            icon_gray: None,
            hidden: t.hidden,
        })
        .collect())
}
