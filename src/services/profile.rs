use crate::core::error::Result;
use crate::core::io::Storage;
use crate::core::state::{Character, Gender};
use crate::services::matcher::{matches_character, normalize_name};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const PROFILE_VERSION: u32 = 2;

/// Cross-session character record: which voice a character had, how much it
/// spoke, and in which books it appeared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterEntry {
    pub canonical: String,
    pub voice: String,
    pub gender: Gender,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub lines: usize,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub last_seen_in: String,
    #[serde(default)]
    pub book_appearances: usize,
}

/// Versioned on-disk profile, keyed by normalised canonical name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub version: u32,
    pub narrator_voice: String,
    pub total_lines: usize,
    #[serde(default)]
    pub characters: HashMap<String, CharacterEntry>,
}

impl CharacterProfile {
    pub fn new(narrator_voice: &str) -> Self {
        Self {
            version: PROFILE_VERSION,
            narrator_voice: narrator_voice.to_string(),
            total_lines: 0,
            characters: HashMap::new(),
        }
    }

    /// Folds one finished conversion into the profile: line counts
    /// accumulate, aliases union, and every entry's percentage is recomputed
    /// against the new total.
    pub fn merge_session(
        &mut self,
        characters: &[Character],
        voice_map: &HashMap<String, String>,
        line_counts: &HashMap<String, usize>,
        narrator_voice: &str,
        book_name: &str,
    ) {
        self.narrator_voice = narrator_voice.to_string();
        let mut session_total = 0usize;

        for character in characters {
            let lines = line_counts.get(&character.name).copied().unwrap_or(0);
            session_total += lines;
            let voice = voice_map.get(&character.name).cloned().unwrap_or_default();

            let key = self
                .find_entry_key(character)
                .unwrap_or_else(|| normalize_name(&character.name));

            let entry = self.characters.entry(key).or_insert_with(|| CharacterEntry {
                canonical: character.name.clone(),
                voice: voice.clone(),
                gender: character.gender,
                aliases: Vec::new(),
                lines: 0,
                percentage: 0.0,
                last_seen_in: String::new(),
                book_appearances: 0,
            });

            entry.voice = voice;
            if !entry.gender.is_known() && character.gender.is_known() {
                entry.gender = character.gender;
            }
            for alias in &character.variations {
                if !entry.aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
                    entry.aliases.push(alias.clone());
                }
            }
            entry.lines += lines;
            if entry.last_seen_in != book_name {
                entry.book_appearances += 1;
                entry.last_seen_in = book_name.to_string();
            }
        }

        self.total_lines += session_total;
        self.recompute_percentages();
    }

    /// Existing entry for this character, matched through canonical name or
    /// any alias on either side.
    fn find_entry_key(&self, character: &Character) -> Option<String> {
        self.characters
            .iter()
            .find(|(_, entry)| {
                matches_character(&entry.canonical, character)
                    || entry
                        .aliases
                        .iter()
                        .any(|a| matches_character(a, character))
            })
            .map(|(k, _)| k.clone())
    }

    fn recompute_percentages(&mut self) {
        let total = self.total_lines.max(1) as f64;
        for entry in self.characters.values_mut() {
            entry.percentage = entry.lines as f64 / total * 100.0;
        }
    }
}

pub async fn load_or_new(
    storage: &dyn Storage,
    path: &Path,
    narrator_voice: &str,
) -> CharacterProfile {
    match storage.read_to_string(path).await {
        Ok(content) => match serde_json::from_str::<CharacterProfile>(&content) {
            Ok(profile) if profile.version == PROFILE_VERSION => profile,
            Ok(profile) => {
                log::warn!(
                    "profile {:?} has version {}, starting fresh",
                    path,
                    profile.version
                );
                CharacterProfile::new(narrator_voice)
            }
            Err(e) => {
                log::warn!("profile {:?} unreadable ({}), starting fresh", path, e);
                CharacterProfile::new(narrator_voice)
            }
        },
        Err(_) => CharacterProfile::new(narrator_voice),
    }
}

pub async fn save(storage: &dyn Storage, path: &Path, profile: &CharacterProfile) -> Result<()> {
    let content = serde_json::to_string_pretty(profile)
        .map_err(|e| crate::core::error::ConvertError::Other(e.into()))?;
    storage.write(path, content.as_bytes()).await
}
