//! `stats.bin`: a u32 record count followed by fixed 24-byte records keyed by the
//! CRC32 of the achievement name.

use std::fs;
use std::path::Path;

use super::{ParseContext, RawEntry};
use crate::achievements::normalize_epoch;
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 4;
pub const RECORD_LEN: usize = 24;

const CRC_OFFSET: usize = 0;
const TIME_OFFSET: usize = 8;
const ACHIEVED_OFFSET: usize = 20;

/// One decoded record before the CRC is mapped back to a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsRecord {
    pub crc: u32,
    pub unlock_time: i32,
    pub achieved: bool,
}

pub fn read_entries(path: &Path, ctx: &ParseContext) -> Result<Vec<RawEntry>> {
    let bytes = fs::read(path)?;
    let records = decode(&bytes)?;

    let mut unresolved = Vec::new();
    let entries = records
        .into_iter()
        .map(|record| {
            let key = match ctx.name_for_crc(record.crc) {
                Some(name) => name.to_string(),
                None => {
                    let hex = format!("{:08x}", record.crc);
                    unresolved.push(hex.clone());
                    hex
                }
            };
            let time = normalize_epoch(i64::from(record.unlock_time));
            RawEntry::new(key).earned(record.achieved, time)
        })
        .collect();

    if !unresolved.is_empty() {
        tracing::warn!(game = %ctx.game, count = unresolved.len(), "stats.bin records with unknown CRC: {}", unresolved.join(", "));
    }
    Ok(entries)
}

/// Decode all records; records whose achieved field is not 0 or 1 are dropped.
pub fn decode(bytes: &[u8]) -> Result<Vec<StatsRecord>> {
    let count = read_u32_le(bytes, 0)
        .ok_or_else(|| Error::parse("stats.bin", "file shorter than header"))? as usize;

    let available = (bytes.len() - HEADER_LEN) / RECORD_LEN;
    if count > available {
        return Err(Error::parse(
            "stats.bin",
            format!("header claims {} records, file holds {}", count, available),
        ));
    }

    let records = (0..count)
        .filter_map(|i| {
            let base = HEADER_LEN + i * RECORD_LEN;
            let achieved = read_u32_le(bytes, base + ACHIEVED_OFFSET)? as i32;
            if achieved != 0 && achieved != 1 {
                return None;
            }
            Some(StatsRecord {
                // written byte-reversed relative to the rest of the record
                crc: u32::from_be_bytes(bytes[base + CRC_OFFSET..base + CRC_OFFSET + 4].try_into().ok()?),
                unlock_time: read_u32_le(bytes, base + TIME_OFFSET)? as i32,
                achieved: achieved == 1,
            })
        })
        .collect();

    Ok(records)
}

/// Inverse of [`decode`], used to build fixtures and by tooling.
pub fn encode(records: &[StatsRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + records.len() * RECORD_LEN);
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        let mut buf = [0u8; RECORD_LEN];
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&record.crc.to_be_bytes());
        buf[TIME_OFFSET..TIME_OFFSET + 4].copy_from_slice(&record.unlock_time.to_le_bytes());
        buf[ACHIEVED_OFFSET..ACHIEVED_OFFSET + 4]
            .copy_from_slice(&i32::from(record.achieved).to_le_bytes());
        out.extend_from_slice(&buf);
    }
    out
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::achievements::{AchievementSchema, AchievementSchemaEntry, LocalizedText};

    fn ctx(names: &[&str]) -> ParseContext {
        let entries = names
            .iter()
            .map(|name| AchievementSchemaEntry {
                name: name.to_string(),
                display_name: LocalizedText::default(),
                description: LocalizedText::default(),
                icon: None,
                icon_gray: None,
                hidden: false,
            })
            .collect();
        ParseContext::new("game", &AchievementSchema::new(entries, Default::default()))
    }

    #[test]
    fn resolves_crc_to_schema_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.bin");
        let crc = crc32fast::hash(b"ACH_WIN_GAME");
        std::fs::write(
            &path,
            encode(&[StatsRecord { crc, unlock_time: 1_700_000_000, achieved: true }]),
        )
        .unwrap();

        let entries = read_entries(&path, &ctx(&["ACH_WIN_GAME"])).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "ACH_WIN_GAME");
        assert!(entries[0].earned);
        assert_eq!(entries[0].earned_time, 1_700_000_000_000);
    }

    #[test]
    fn unknown_crc_is_kept_as_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.bin");
        std::fs::write(
            &path,
            encode(&[StatsRecord { crc: 0xdeadbeef, unlock_time: 0, achieved: false }]),
        )
        .unwrap();

        let entries = read_entries(&path, &ctx(&["OTHER"])).unwrap();
        assert_eq!(entries[0].key, "deadbeef");
        assert!(!entries[0].earned);
    }

    #[test]
    fn invalid_achieved_values_are_skipped() {
        let mut bytes = encode(&[
            StatsRecord { crc: 1, unlock_time: 0, achieved: true },
            StatsRecord { crc: 2, unlock_time: 0, achieved: false },
        ]);
        let second = HEADER_LEN + RECORD_LEN + ACHIEVED_OFFSET;
        bytes[second..second + 4].copy_from_slice(&7i32.to_le_bytes());

        let records = decode(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].crc, 1);
    }

    #[test]
    fn truncated_blobs_are_errors() {
        assert!(decode(&[1, 0]).is_err());
        let mut bytes = encode(&[StatsRecord { crc: 1, unlock_time: 0, achieved: true }]);
        bytes.truncate(10);
        assert!(decode(&bytes).is_err());
    }
}
