//! shadPS4 trophy sets: one `TROP.XML` / `TROP_NN.XML` per language under `Xml/`,
//! each carrying the unlock state alongside the localized text.

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs;
use std::path::Path;

use super::RawEntry;
use crate::achievements::{normalize_epoch, AchievementSchemaEntry, LocalizedText};
use crate::error::{Error, Result};

const FALLBACK_LANGUAGE: &str = "english";

/// `TROP_NN.XML` suffix to language name.
const LANGUAGES: &[(&str, &str)] = &[
    ("00", "japanese"),
    ("01", "english"),
    ("02", "french"),
    ("03", "spanish"),
    ("04", "german"),
    ("05", "italian"),
    ("06", "dutch"),
    ("07", "portuguese"),
    ("08", "russian"),
    ("09", "korean"),
    ("10", "tchinese"),
    ("11", "schinese"),
    ("12", "finnish"),
    ("13", "swedish"),
    ("14", "danish"),
    ("15", "norwegian"),
    ("16", "polish"),
    ("17", "brazilian"),
    ("18", "english"),
    ("19", "turkish"),
    ("20", "latam"),
    ("21", "arabic"),
    ("22", "french"),
    ("23", "czech"),
    ("24", "hungarian"),
    ("25", "greek"),
    ("26", "romanian"),
    ("27", "thai"),
    ("28", "vietnamese"),
    ("29", "indonesian"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ps4Trophy {
    pub id: u32,
    pub ttype: String,
    pub hidden: bool,
    pub unlocked: bool,
    /// Unix milliseconds, 0 when unknown.
    pub timestamp: i64,
    pub names: IndexMap<String, String>,
    pub details: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ps4TrophySet {
    pub title: Option<String>,
    pub trophies: IndexMap<u32, Ps4Trophy>,
}

/// Language for a trophy file name, `None` if it is not a trophy file.
pub fn language_for_file(file_name: &str) -> Option<&'static str> {
    let upper = file_name.to_ascii_uppercase();
    if upper == "TROP.XML" {
        return Some(FALLBACK_LANGUAGE);
    }
    let code = upper.strip_prefix("TROP_")?.strip_suffix(".XML")?;
    LANGUAGES
        .iter()
        .find(|(nn, _)| *nn == code)
        .map(|(_, language)| *language)
}

/// Parse one language file into per-trophy records.
pub fn parse_trop_xml(xml: &str, language: &str) -> Result<(Option<String>, Vec<Ps4Trophy>)> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut title = None;
    let mut trophies = Vec::new();
    let mut current: Option<Ps4Trophy> = None;
    let mut text_target: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"trophy" => current = Some(trophy_from_attributes(&e)?),
                b"name" | b"detail" | b"title-name" => {
                    text_target = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"trophy" => {
                trophies.push(trophy_from_attributes(&e)?);
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| Error::parse("trophy xml", e.to_string()))?
                    .trim()
                    .to_string();
                match (text_target.as_deref(), current.as_mut()) {
                    (Some("name"), Some(trophy)) => {
                        trophy.names.insert(language.to_string(), text);
                    }
                    (Some("detail"), Some(trophy)) => {
                        trophy.details.insert(language.to_string(), text);
                    }
                    (Some("title-name"), _) => title = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"trophy" {
                    trophies.extend(current.take());
                }
                text_target = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::parse("trophy xml", e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok((title, trophies))
}

fn trophy_from_attributes(e: &BytesStart<'_>) -> Result<Ps4Trophy> {
    let mut trophy = Ps4Trophy::default();
    let mut has_id = false;

    for attr in e.attributes().flatten() {
        let value = attr
            .unescape_value()
            .map_err(|e| Error::parse("trophy xml", e.to_string()))?;
        let value = value.trim();
        match attr.key.as_ref() {
            b"id" => {
                trophy.id = value
                    .parse()
                    .map_err(|_| Error::parse("trophy xml", format!("bad trophy id '{}'", value)))?;
                has_id = true;
            }
            b"ttype" => trophy.ttype = value.to_string(),
            b"hidden" => trophy.hidden = value.eq_ignore_ascii_case("yes"),
            b"unlockstate" => trophy.unlocked = crate::achievements::coerce_earned_str(value),
            b"timestamp" => trophy.timestamp = normalize_timestamp(value.parse().unwrap_or(0)),
            _ => {}
        }
    }

    if !has_id {
        return Err(Error::parse("trophy xml", "trophy without id"));
    }
    Ok(trophy)
}

/// Timestamps show up in seconds, milliseconds or microseconds.
fn normalize_timestamp(mut value: i64) -> i64 {
    while value > 100_000_000_000_000 {
        value /= 1000;
    }
    normalize_epoch(value)
}

/// Read and merge every language file under `xml_dir`.
pub fn read_set(xml_dir: &Path) -> Result<Ps4TrophySet> {
    let mut files: Vec<(String, &'static str)> = fs::read_dir(xml_dir)?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let language = language_for_file(&name)?;
            Some((name, language))
        })
        .collect();
    // TROP.XML first so explicit language files override it
    files.sort_by_key(|(name, _)| (name.len() > "TROP.XML".len(), name.to_ascii_uppercase()));

    if files.is_empty() {
        return Err(Error::SaveDirNotFound(xml_dir.join("TROP.XML")));
    }

    let mut set = Ps4TrophySet::default();
    for (name, language) in files {
        let xml = fs::read_to_string(xml_dir.join(&name))?;
        let (title, trophies) = match parse_trop_xml(&xml, language) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(file = %name, "skipping trophy file: {}", e);
                continue;
            }
        };
        if set.title.is_none() {
            set.title = title;
        }
        for trophy in trophies {
            merge_trophy(&mut set, trophy);
        }
    }

    fill_missing_languages(&mut set);
    Ok(set)
}

fn merge_trophy(set: &mut Ps4TrophySet, trophy: Ps4Trophy) {
    match set.trophies.get_mut(&trophy.id) {
        Some(existing) => {
            existing.unlocked |= trophy.unlocked;
            existing.timestamp = existing.timestamp.max(trophy.timestamp);
            existing.hidden |= trophy.hidden;
            if existing.ttype.is_empty() {
                existing.ttype = trophy.ttype;
            }
            existing.names.extend(trophy.names);
            existing.details.extend(trophy.details);
        }
        None => {
            set.trophies.insert(trophy.id, trophy);
        }
    }
}

fn fill_missing_languages(set: &mut Ps4TrophySet) {
    let mut languages: Vec<String> = Vec::new();
    for trophy in set.trophies.values() {
        for language in trophy.names.keys().chain(trophy.details.keys()) {
            if !languages.contains(language) {
                languages.push(language.clone());
            }
        }
    }

    for trophy in set.trophies.values_mut() {
        for text in [&mut trophy.names, &mut trophy.details] {
            let Some(english) = text.get(FALLBACK_LANGUAGE).cloned() else {
                continue;
            };
            for language in &languages {
                text.entry(language.clone()).or_insert_with(|| english.clone());
            }
        }
    }
}

pub fn read_entries(xml_dir: &Path) -> Result<Vec<RawEntry>> {
    let set = read_set(xml_dir)?;
    if set.trophies.is_empty() {
        return Err(Error::parse("trophy xml", "no trophies"));
    }
    Ok(set
        .trophies
        .values()
        .map(|t| RawEntry::new(t.id.to_string()).earned(t.unlocked, t.timestamp))
        .collect())
}

pub fn derive_schema(xml_dir: &Path) -> Result<Vec<AchievementSchemaEntry>> {
    let set = read_set(xml_dir)?;
    Ok(set
        .trophies
        .into_values()
        .map(|t| AchievementSchemaEntry {
            name: t.id.to_string(),
            display_name: LocalizedText::Localized(t.names),
            description: LocalizedText::Localized(t.details),
            icon: Some(format!("Icons/TROP{:03}.PNG", t.id)),
            icon_gray: None,
            hidden: t.hidden,
        })
        .collect())
}
