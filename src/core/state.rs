use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Speaker name used for narration lines.
pub const NARRATOR: &str = "narrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

impl Gender {
    pub fn is_known(self) -> bool {
        self != Gender::Unknown
    }

    pub fn parse(s: &str) -> Gender {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" => Gender::Male,
            "female" | "f" => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// A speaking character with its canonical name and every alias that refers
/// to it. `variations` always contains `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub variations: Vec<String>,
    pub gender: Gender,
}

impl Character {
    pub fn new(name: impl Into<String>, variations: Vec<String>, gender: Gender) -> Self {
        let name = name.into();
        let mut c = Character {
            name,
            variations,
            gender,
        };
        c.ensure_canonical_variation();
        c
    }

    /// Restores the invariant that the canonical name is itself a variation.
    pub fn ensure_canonical_variation(&mut self) {
        let has = self
            .variations
            .iter()
            .any(|v| v.eq_ignore_ascii_case(&self.name));
        if !has {
            self.variations.insert(0, self.name.clone());
        }
    }

    /// Unions the other character's variations into this one and upgrades an
    /// unknown gender to any specific value.
    pub fn absorb(&mut self, other: &Character) {
        for v in &other.variations {
            if !self.variations.iter().any(|e| e.eq_ignore_ascii_case(v)) {
                self.variations.push(v.clone());
            }
        }
        if !self.gender.is_known() && other.gender.is_known() {
            self.gender = other.gender;
        }
    }
}

/// One narrative fragment attributed to a speaker. `sentence_index` is dense
/// and 0-based over the whole text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerAssignment {
    pub sentence_index: usize,
    pub text: String,
    pub speaker: String,
    pub voice: String,
}

impl SpeakerAssignment {
    pub fn is_narrator(&self) -> bool {
        self.speaker == NARRATOR
    }
}

/// A contiguous run of paragraphs under the token budget, the unit of LLM
/// input. Blocks partition the sentence sequence without overlap.
#[derive(Debug, Clone)]
pub struct TextBlock {
    pub index: usize,
    pub paragraphs: Vec<String>,
    pub start_sentence: usize,
}

impl TextBlock {
    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }
}

/// Output-file boundary: the segment starting at `first_sentence` is written
/// to `<label>/<label>.opus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBoundary {
    pub label: String,
    pub first_sentence: usize,
}

/// Resume artefact persisted after the assignment phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    pub assignments: Vec<SpeakerAssignment>,
    pub character_voice_map: HashMap<String, String>,
    pub characters: Vec<Character>,
    pub file_names: Vec<FileBoundary>,
}

/// Content fingerprint authorising chunk-cache reuse across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSignature {
    pub text_sha256: String,
    pub settings_sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_is_always_a_variation() {
        let c = Character::new("John", vec!["Johnny".into()], Gender::Male);
        assert!(c.variations.iter().any(|v| v == "John"));

        let c = Character::new("Sarah", vec!["sarah".into()], Gender::Female);
        assert_eq!(c.variations.len(), 1, "case-insensitive duplicate kept out");
    }

    #[test]
    fn absorb_unions_and_upgrades_gender() {
        let mut a = Character::new("John", vec![], Gender::Unknown);
        let b = Character::new("John", vec!["Mr. Smith".into()], Gender::Male);
        a.absorb(&b);
        assert_eq!(a.gender, Gender::Male);
        assert!(a.variations.iter().any(|v| v == "Mr. Smith"));

        // A known gender is never downgraded.
        let c = Character::new("John", vec![], Gender::Unknown);
        a.absorb(&c);
        assert_eq!(a.gender, Gender::Male);
    }

    #[test]
    fn gender_parse_is_lenient() {
        assert_eq!(Gender::parse("Male"), Gender::Male);
        assert_eq!(Gender::parse(" FEMALE "), Gender::Female);
        assert_eq!(Gender::parse("robot"), Gender::Unknown);
    }
}
