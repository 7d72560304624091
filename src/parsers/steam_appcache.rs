//! Steam's `appcache/stats` binary key-value files.
//!
//! `UserGameStatsSchema_<appid>.bin` describes which bit of which stat is which
//! achievement; `UserGameStats_<user>_<appid>.bin` holds the packed stat values and
//! per-bit unlock times.

use indexmap::IndexMap;
use std::fs;
use std::path::Path;

use super::RawEntry;
use crate::achievements::{normalize_epoch, AchievementSchemaEntry, LocalizedText};
use crate::error::{Error, Result};

const TAG_OBJECT: u8 = 0x00;
const TAG_STRING: u8 = 0x01;
const TAG_INT32: u8 = 0x02;
const TAG_FLOAT32: u8 = 0x03;
const TAG_UINT64: u8 = 0x07;
const TAG_END: u8 = 0x08;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Object(IndexMap<String, KvValue>),
    String(String),
    Int32(i32),
    Float32(f32),
    UInt64(u64),
}

impl KvValue {
    pub fn get(&self, key: &str) -> Option<&KvValue> {
        match self {
            KvValue::Object(map) => map
                .get(key)
                .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v)),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, KvValue>> {
        match self {
            KvValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KvValue::Int32(v) => Some(i64::from(*v)),
            KvValue::UInt64(v) => i64::try_from(*v).ok(),
            KvValue::Float32(v) => Some(*v as i64),
            KvValue::String(s) => s.trim().parse().ok(),
            KvValue::Object(_) => None,
        }
    }

    /// Depth-first search for the first object stored under `key`.
    fn find(&self, key: &str) -> Option<&KvValue> {
        let map = self.as_object()?;
        if let Some(found) = map.get(key).filter(|v| v.as_object().is_some()) {
            return Some(found);
        }
        map.values().find_map(|child| child.find(key))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or_else(|| Error::parse("appcache", "unexpected end of data"))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::parse("appcache", "unterminated string"))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    fn object(&mut self, depth: usize) -> Result<IndexMap<String, KvValue>> {
        if depth > MAX_DEPTH {
            return Err(Error::parse("appcache", "nesting too deep"));
        }

        let mut map = IndexMap::new();
        loop {
            let tag = match self.byte() {
                None if depth == 0 => break,
                None => return Err(Error::parse("appcache", "unterminated object")),
                Some(TAG_END) => break,
                Some(tag) => tag,
            };
            let key = self.cstring()?;
            let value = match tag {
                TAG_OBJECT => KvValue::Object(self.object(depth + 1)?),
                TAG_STRING => KvValue::String(self.cstring()?),
                TAG_INT32 => KvValue::Int32(i32::from_le_bytes(self.take()?)),
                TAG_FLOAT32 => KvValue::Float32(f32::from_le_bytes(self.take()?)),
                TAG_UINT64 => KvValue::UInt64(u64::from_le_bytes(self.take()?)),
                other => {
                    return Err(Error::parse(
                        "appcache",
                        format!("unknown tag 0x{:02x} at offset {}", other, self.pos),
                    ))
                }
            };
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Parse a binary KV blob into a tree rooted at an unnamed object.
pub fn parse_kv(bytes: &[u8]) -> Result<KvValue> {
    let mut reader = Reader { bytes, pos: 0 };
    Ok(KvValue::Object(reader.object(0)?))
}

/// One achievement bit from the stats schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaBit {
    pub stat_id: String,
    pub bit: u32,
    pub name: String,
    pub display_name: Option<String>,
}

pub fn extract_schema(tree: &KvValue) -> Vec<SchemaBit> {
    let Some(stats) = tree.find("stats").and_then(KvValue::as_object) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (stat_id, stat) in stats {
        let Some(bits) = stat.get("bits").and_then(KvValue::as_object) else {
            continue;
        };
        for (bit_key, bit) in bits {
            let Some(name) = bit.get("name").and_then(KvValue::as_str) else {
                continue;
            };
            let bit_index = bit
                .get("bit")
                .and_then(KvValue::as_i64)
                .or_else(|| bit_key.parse().ok())
                .and_then(|b| u32::try_from(b).ok())
                .filter(|b| *b < 32);
            let Some(bit_index) = bit_index else {
                continue;
            };
            let display_name = bit
                .get("display")
                .and_then(|d| d.get("name"))
                .and_then(|n| n.get("english").or(Some(n)))
                .and_then(KvValue::as_str)
                .map(str::to_string);

            out.push(SchemaBit {
                stat_id: stat_id.clone(),
                bit: bit_index,
                name: name.to_string(),
                display_name,
            });
        }
    }
    out
}

/// Packed value and per-bit unlock times for one stat id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserStat {
    pub value: u32,
    pub times: IndexMap<u32, i64>,
}

pub fn extract_user_stats(tree: &KvValue) -> IndexMap<String, UserStat> {
    let root = tree.find("cache").unwrap_or(tree);
    let Some(map) = root.as_object() else {
        return IndexMap::new();
    };

    map.iter()
        .filter(|(key, _)| key.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|(key, stat)| {
            let value = stat.get("data")?.as_i64()? as u32;
            let times = stat
                .get("AchievementTimes")
                .and_then(KvValue::as_object)
                .map(|times| {
                    times
                        .iter()
                        .filter_map(|(bit, t)| Some((bit.parse().ok()?, t.as_i64()?)))
                        .collect::<IndexMap<u32, i64>>()
                })
                .unwrap_or_default();
            Some((key.clone(), UserStat { value, times }))
        })
        .collect()
}

pub fn read_entries(schema_path: &Path, user_stats_path: &Path) -> Result<Vec<RawEntry>> {
    let schema = extract_schema(&parse_kv(&fs::read(schema_path)?)?);
    if schema.is_empty() {
        return Err(Error::parse("appcache", "stats schema has no achievement bits"));
    }
    let stats = extract_user_stats(&parse_kv(&fs::read(user_stats_path)?)?);
    Ok(combine(&schema, &stats))
}

/// Schema entries named from the stats schema, for games without a schema file.
pub fn derive_schema(schema_path: &Path) -> Result<Vec<AchievementSchemaEntry>> {
    let bits = extract_schema(&parse_kv(&fs::read(schema_path)?)?);
    if bits.is_empty() {
        return Err(Error::parse("appcache", "stats schema has no achievement bits"));
    }
    Ok(bits
        .into_iter()
        .map(|bit| AchievementSchemaEntry {
            display_name: LocalizedText::Plain(bit.display_name.unwrap_or_else(|| bit.name.clone())),
            name: bit.name,
            description: LocalizedText::Plain(String::new()),
            icon: None,
            icon_gray: None,
            hidden: false,
        })
        .collect())
}

pub fn combine(schema: &[SchemaBit], stats: &IndexMap<String, UserStat>) -> Vec<RawEntry> {
    schema
        .iter()
        .map(|bit| {
            let stat = stats.get(&bit.stat_id);
            let earned = stat.map(|s| (s.value >> bit.bit) & 1 == 1).unwrap_or(false);
            let time = stat
                .and_then(|s| s.times.get(&bit.bit))
                .map(|t| normalize_epoch(*t))
                .unwrap_or(0);
            RawEntry::new(bit.name.as_str()).earned(earned, time)
        })
        .collect()
}
