use crate::core::config::VoiceDef;
use crate::core::state::{Character, Gender};
use std::collections::{HashMap, HashSet};

/// Sentinel keys in every voice map, shared by all unnamed speakers.
pub const MALE_UNNAMED: &str = "MALE_UNNAMED";
pub const FEMALE_UNNAMED: &str = "FEMALE_UNNAMED";
pub const UNKNOWN_UNNAMED: &str = "UNKNOWN_UNNAMED";

/// Voice ids look like `"<locale>, <name>"`. The comma split is the only
/// structure the format guarantees.
pub fn voice_parts(id: &str) -> (&str, &str) {
    match id.split_once(',') {
        Some((locale, name)) => (locale.trim(), name.trim()),
        None => ("", id.trim()),
    }
}

fn voice_lang(id: &str) -> &str {
    let (locale, _) = voice_parts(id);
    locale.split('-').next().unwrap_or(locale)
}

fn is_multilingual(id: &str) -> bool {
    let (_, name) = voice_parts(id);
    name.contains("Multilingual")
}

/// Key identifying a native/multilingual variant pair.
fn variant_key(id: &str) -> String {
    let (_, name) = voice_parts(id);
    name.replace("Multilingual", "").to_lowercase()
}

/// Gender-partitioned priority pool, deduplicated against variant pairs and
/// ordered: native non-multilingual, multilingual matching the book
/// language, foreign multilingual.
#[derive(Debug, Clone, Default)]
pub struct VoicePool {
    pub male: Vec<String>,
    pub female: Vec<String>,
}

impl VoicePool {
    pub fn build(enabled: &[VoiceDef], language: &str) -> VoicePool {
        let mut pool = VoicePool::default();
        for gender in [Gender::Male, Gender::Female] {
            let bucket = Self::build_bucket(enabled, language, gender);
            match gender {
                Gender::Male => pool.male = bucket,
                Gender::Female => pool.female = bucket,
                Gender::Unknown => unreachable!(),
            }
        }
        pool
    }

    fn build_bucket(enabled: &[VoiceDef], language: &str, gender: Gender) -> Vec<String> {
        let mut ranked: Vec<(u8, &str)> = Vec::new();
        for def in enabled.iter().filter(|d| d.gender == gender) {
            let lang_match = voice_lang(&def.id).eq_ignore_ascii_case(language);
            let rank = match (lang_match, is_multilingual(&def.id)) {
                (true, false) => 0,
                (true, true) => 1,
                (false, true) => 2,
                // A foreign voice that cannot speak other languages is
                // useless for this book.
                (false, false) => continue,
            };
            ranked.push((rank, def.id.as_str()));
        }
        ranked.sort_by_key(|(rank, _)| *rank);

        // First occurrence in priority order wins a variant pair: the
        // language-matching sibling, and non-multilingual among those.
        let mut seen = HashSet::new();
        ranked
            .into_iter()
            .filter(|(_, id)| seen.insert(variant_key(id)))
            .map(|(_, id)| id.to_string())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.male.len() + self.female.len()
    }

    pub fn bucket(&self, gender: Gender) -> &[String] {
        match gender {
            Gender::Male => &self.male,
            Gender::Female => &self.female,
            Gender::Unknown => &self.male,
        }
    }
}

/// Result of an allocation pass. `voice_map` covers every canonical name,
/// every variation, and the three unnamed-speaker sentinels.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub voice_map: HashMap<String, String>,
    pub rare_voices: Vec<String>,
    pub unique_count: usize,
}

/// Walks one gender bucket handing out unused voices first, cycling with a
/// per-gender counter once the bucket is exhausted.
struct BucketWalker<'a> {
    voices: &'a [String],
    used: &'a mut HashSet<String>,
    cycle_cursor: usize,
}

impl<'a> BucketWalker<'a> {
    fn next(&mut self) -> Option<(String, bool)> {
        if self.voices.is_empty() {
            return None;
        }
        for v in self.voices {
            if !self.used.contains(v) {
                self.used.insert(v.clone());
                return Some((v.clone(), true));
            }
        }
        let v = self.voices[self.cycle_cursor % self.voices.len()].clone();
        self.cycle_cursor += 1;
        Some((v, false))
    }
}

struct Allocator<'a> {
    pool: &'a VoicePool,
    used: HashSet<String>,
    male_cursor: usize,
    female_cursor: usize,
    male_assigned: usize,
    female_assigned: usize,
}

impl<'a> Allocator<'a> {
    fn new(pool: &'a VoicePool, narrator_voice: &str) -> Self {
        let mut used = HashSet::new();
        used.insert(narrator_voice.to_string());
        Self {
            pool,
            used,
            male_cursor: 0,
            female_cursor: 0,
            male_assigned: 0,
            female_assigned: 0,
        }
    }

    /// Unknown speakers draw from whichever bucket has handed out fewer
    /// voices so far; male wins the initial tie.
    fn bucket_for(&self, gender: Gender) -> Gender {
        match gender {
            Gender::Unknown => {
                if self.female_assigned < self.male_assigned {
                    Gender::Female
                } else {
                    Gender::Male
                }
            }
            g => g,
        }
    }

    fn take(&mut self, gender: Gender) -> Option<(String, bool)> {
        let bucket = self.bucket_for(gender);
        let pool = self.pool;
        let (voices, cursor) = match bucket {
            Gender::Female => (&pool.female, &mut self.female_cursor),
            _ => (&pool.male, &mut self.male_cursor),
        };
        let mut walker = BucketWalker {
            voices,
            used: &mut self.used,
            cycle_cursor: *cursor,
        };
        let result = walker.next();
        *cursor = walker.cycle_cursor;
        if result.is_some() {
            match bucket {
                Gender::Female => self.female_assigned += 1,
                _ => self.male_assigned += 1,
            }
        }
        result
    }
}

fn insert_character(map: &mut HashMap<String, String>, character: &Character, voice: &str) {
    map.insert(character.name.clone(), voice.to_string());
    for v in &character.variations {
        map.insert(v.clone(), voice.to_string());
    }
}

fn pick_rare_voices(alloc: &mut Allocator<'_>) -> Vec<String> {
    let male = alloc
        .take(Gender::Male)
        .map(|(v, _)| v)
        .unwrap_or_default();
    let female = alloc
        .take(Gender::Female)
        .map(|(v, _)| v)
        .unwrap_or_default();
    let unknown = alloc
        .take(Gender::Unknown)
        .map(|(v, _)| v)
        .unwrap_or_else(|| male.clone());
    vec![male, female, unknown]
}

fn insert_sentinels(map: &mut HashMap<String, String>, rare: &[String]) {
    map.insert(MALE_UNNAMED.to_string(), rare[0].clone());
    map.insert(FEMALE_UNNAMED.to_string(), rare[1].clone());
    map.insert(UNKNOWN_UNNAMED.to_string(), rare[2].clone());
}

/// Initial allocation before any line counts exist: input order, first
/// unused voice per gender, then three rare-speaker voices.
pub fn allocate_by_gender(
    pool: &VoicePool,
    characters: &[Character],
    narrator_voice: &str,
) -> Allocation {
    let mut alloc = Allocator::new(pool, narrator_voice);
    let mut map = HashMap::new();
    let mut unique_count = 0usize;

    for character in characters {
        let Some((voice, fresh)) = alloc.take(character.gender) else {
            insert_character(&mut map, character, narrator_voice);
            continue;
        };
        if fresh {
            unique_count += 1;
        }
        insert_character(&mut map, character, &voice);
    }

    let rare = pick_rare_voices(&mut alloc);
    insert_sentinels(&mut map, &rare);

    Allocation {
        voice_map: map,
        rare_voices: rare,
        unique_count,
    }
}

/// Re-allocation once line counts are known. The most talkative characters
/// get unique voices; everyone else shares the three rare voices by gender.
/// `unique_slots` reserves the narrator plus the three rares out of the
/// post-dedup pool. Ties in line count keep input order.
pub fn allocate_by_frequency(
    pool: &VoicePool,
    characters: &[Character],
    line_counts: &HashMap<String, usize>,
    narrator_voice: &str,
) -> Allocation {
    let unique_slots = pool.total().saturating_sub(1 + 3);

    let mut order: Vec<&Character> = characters.iter().collect();
    order.sort_by_key(|c| std::cmp::Reverse(line_counts.get(&c.name).copied().unwrap_or(0)));

    let mut alloc = Allocator::new(pool, narrator_voice);
    let mut map = HashMap::new();

    let (unique, shared) = order.split_at(unique_slots.min(order.len()));
    let mut unique_count = 0usize;
    for character in unique {
        let Some((voice, fresh)) = alloc.take(character.gender) else {
            insert_character(&mut map, character, narrator_voice);
            continue;
        };
        if fresh {
            unique_count += 1;
        }
        insert_character(&mut map, character, &voice);
    }

    let rare = pick_rare_voices(&mut alloc);
    for character in shared {
        let voice = match character.gender {
            Gender::Male => &rare[0],
            Gender::Female => &rare[1],
            Gender::Unknown => &rare[2],
        };
        insert_character(&mut map, character, voice);
    }
    insert_sentinels(&mut map, &rare);

    Allocation {
        voice_map: map,
        rare_voices: rare,
        unique_count,
    }
}

/// UI-driven re-roll: keep assignments for characters 0..=keep_through,
/// rebuild the priority pool without their voices or the narrator's, and
/// walk the remaining characters picking by gender with cycling.
pub fn randomize_below(
    enabled: &[VoiceDef],
    language: &str,
    characters: &[Character],
    current_map: &HashMap<String, String>,
    keep_through: usize,
    narrator_voice: &str,
) -> HashMap<String, String> {
    let mut kept_voices: HashSet<String> = HashSet::new();
    kept_voices.insert(narrator_voice.to_string());
    for character in characters.iter().take(keep_through + 1) {
        if let Some(v) = current_map.get(&character.name) {
            kept_voices.insert(v.clone());
        }
    }

    let base = VoicePool::build(enabled, language);
    let pool = VoicePool {
        male: base
            .male
            .into_iter()
            .filter(|v| !kept_voices.contains(v))
            .collect(),
        female: base
            .female
            .into_iter()
            .filter(|v| !kept_voices.contains(v))
            .collect(),
    };

    let mut map = current_map.clone();
    let mut alloc = Allocator::new(&pool, narrator_voice);
    for character in characters.iter().skip(keep_through + 1) {
        if let Some((voice, _)) = alloc.take(character.gender) {
            insert_character(&mut map, character, &voice);
        }
    }
    map
}
