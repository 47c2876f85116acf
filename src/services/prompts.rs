use crate::core::error::{ConvertError, Result};
use crate::core::state::{Character, Gender, TextBlock};
use crate::services::llm::SchemaSpec;
use crate::services::voices::{FEMALE_UNNAMED, MALE_UNNAMED, UNKNOWN_UNNAMED};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Speaker codes in enumeration order: A-Z, 0-9, a-z.
const CODE_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789abcdefghijklmnopqrstuvwxyz";

/// Maps single-character speaker codes to speaker names for one Assign run.
/// The last three codes after the characters are the unnamed-speaker
/// sentinels.
pub struct CodeBook {
    entries: Vec<(char, String)>,
}

impl CodeBook {
    pub fn new(characters: &[Character]) -> Self {
        let capacity = CODE_ALPHABET.len() - 3;
        if characters.len() > capacity {
            log::warn!(
                "{} characters exceed the {} speaker codes; extras fall back to narrator",
                characters.len(),
                capacity
            );
        }
        let mut entries: Vec<(char, String)> = characters
            .iter()
            .take(capacity)
            .enumerate()
            .map(|(i, c)| (CODE_ALPHABET[i] as char, c.name.clone()))
            .collect();
        let base = entries.len();
        for (offset, sentinel) in [MALE_UNNAMED, FEMALE_UNNAMED, UNKNOWN_UNNAMED]
            .iter()
            .enumerate()
        {
            entries.push((CODE_ALPHABET[base + offset] as char, sentinel.to_string()));
        }
        CodeBook { entries }
    }

    pub fn speaker_for(&self, code: char) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| name.as_str())
    }

    pub fn is_known(&self, code: char) -> bool {
        self.entries.iter().any(|(c, _)| *c == code)
    }

    /// Legend block for the assign prompt.
    pub fn legend(&self, characters: &[Character]) -> String {
        let mut lines = Vec::new();
        for (i, (code, name)) in self.entries.iter().enumerate() {
            let describe = match name.as_str() {
                n if n == MALE_UNNAMED => "an unnamed male speaker".to_string(),
                n if n == FEMALE_UNNAMED => "an unnamed female speaker".to_string(),
                n if n == UNKNOWN_UNNAMED => "an unnamed speaker of unknown gender".to_string(),
                _ => {
                    let gender = characters
                        .get(i)
                        .map(|c| match c.gender {
                            Gender::Male => "male",
                            Gender::Female => "female",
                            Gender::Unknown => "unknown gender",
                        })
                        .unwrap_or("unknown gender");
                    format!("{} ({})", name, gender)
                }
            };
            lines.push(format!("{} = {}", code, describe));
        }
        lines.join("\n")
    }
}

/// Removes a wrapping markdown code fence, which models add despite every
/// instruction not to.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

fn error_context(prior_error: &Option<String>) -> String {
    match prior_error {
        Some(e) => format!(
            "\n\nYour previous response was rejected: {}\nReturn strictly valid JSON this time.",
            e
        ),
        None => String::new(),
    }
}

fn maybe_repeat(repeat: bool, recap: &str) -> String {
    if repeat {
        format!("\n\nReminder: {}", recap)
    } else {
        String::new()
    }
}

// --- Extract ---

pub fn extract_system() -> &'static str {
    "You are a literary analyst. You identify speaking characters in fiction. \
     Respond with valid JSON only."
}

pub fn extract_schema() -> SchemaSpec {
    SchemaSpec {
        name: "character_list",
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "characters": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "canonicalName": { "type": "string" },
                            "variations": {
                                "type": "array",
                                "items": { "type": "string" }
                            },
                            "gender": { "type": "string", "enum": ["male", "female", "unknown"] }
                        },
                        "required": ["canonicalName", "gender"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["characters"],
            "additionalProperties": false
        }),
    }
}

pub fn extract_prompt(
    block: &TextBlock,
    known: &[Character],
    prior_error: &Option<String>,
    repeat: bool,
) -> String {
    let known_names = if known.is_empty() {
        "(none yet)".to_string()
    } else {
        known
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let recap = "return {\"characters\": [{\"canonicalName\", \"variations\", \"gender\"}]} only";
    format!(
        "Identify every character who SPEAKS in the text below.\n\
         \n\
         Context:\n\
         - Characters already known from earlier sections: [{}]\n\
         \n\
         Instructions:\n\
         - List each speaking character once, with the name the narration uses most.\n\
         - Put every alias, title or partial name into \"variations\", including the canonical name.\n\
         - Reuse the exact known name when the same character appears again.\n\
         - gender is \"male\", \"female\" or \"unknown\". Do not guess from the name alone; use pronouns and context.\n\
         - System/interface voices (status screens, notifications) count as speakers.\n\
         - Do not include characters who are only mentioned and never speak.{}{}\n\
         \n\
         Text:\n{}",
        known_names,
        error_context(prior_error),
        maybe_repeat(repeat, recap),
        block.paragraphs.join("\n"),
    )
}

/// Validates the extract response, applying the documented repairs: missing
/// variations become `[canonical]`, unrecognised genders become unknown,
/// empty canonical names drop the entry.
pub fn parse_extract(response: &str) -> Result<Vec<Character>> {
    let clean = strip_code_blocks(response);
    let value: Value = serde_json::from_str(&clean).map_err(|e| ConvertError::ValidationFailed {
        stage: "extract",
        details: format!("not valid JSON: {}", e),
    })?;

    let array = value
        .get("characters")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .ok_or_else(|| ConvertError::ValidationFailed {
            stage: "extract",
            details: "missing \"characters\" array".to_string(),
        })?;

    let mut out = Vec::new();
    for entry in array {
        let name = entry
            .get("canonicalName")
            .or_else(|| entry.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if name.is_empty() {
            continue;
        }
        let variations: Vec<String> = match entry.get("variations") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => vec![name.clone()],
        };
        let gender = entry
            .get("gender")
            .and_then(Value::as_str)
            .map(Gender::parse)
            .unwrap_or(Gender::Unknown);
        out.push(Character::new(name, variations, gender));
    }
    Ok(out)
}

// --- Merge ---

pub fn merge_system() -> &'static str {
    "You deduplicate character lists from fiction. Respond with valid JSON only."
}

pub fn merge_schema() -> SchemaSpec {
    SchemaSpec {
        name: "merge_groups",
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "merges": {
                    "type": "array",
                    "items": {
                        "type": "array",
                        "items": { "type": "integer" }
                    }
                }
            },
            "required": ["merges"],
            "additionalProperties": false
        }),
    }
}

pub fn merge_prompt(characters: &[Character], prior_error: &Option<String>, repeat: bool) -> String {
    let listing = characters
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let aliases = c
                .variations
                .iter()
                .filter(|v| !v.eq_ignore_ascii_case(&c.name))
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let gender = match c.gender {
                Gender::Male => "male",
                Gender::Female => "female",
                Gender::Unknown => "unknown",
            };
            if aliases.is_empty() {
                format!("{}: {} ({})", i, c.name, gender)
            } else {
                format!("{}: {} ({}; also called {})", i, c.name, gender, aliases)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    let recap = "return {\"merges\": [[keeperIndex, duplicateIndex, ...], ...]} only";
    format!(
        "The numbered list below came from analysing a book section by section, \
         so the same person may appear under several entries (nickname, title, \
         married name, typo).\n\
         \n\
         Instructions:\n\
         - Group indices that refer to the SAME person. Put the best canonical entry first in each group.\n\
         - Only group entries you are confident about; different people sharing a surname stay separate.\n\
         - Entries that are already unique do not appear in the output.\n\
         - Return {{\"merges\": []}} when nothing needs merging.{}{}\n\
         \n\
         Characters:\n{}",
        error_context(prior_error),
        maybe_repeat(repeat, recap),
        listing,
    )
}

/// Validates one merge vote: integer groups, indices in range, duplicates
/// pruned first-occurrence-wins within and across groups, groups shrunk
/// below two members dropped.
pub fn parse_merge(response: &str, character_count: usize) -> Result<Vec<Vec<usize>>> {
    let clean = strip_code_blocks(response);
    let value: Value = serde_json::from_str(&clean).map_err(|e| ConvertError::ValidationFailed {
        stage: "merge",
        details: format!("not valid JSON: {}", e),
    })?;
    let array = value
        .get("merges")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .ok_or_else(|| ConvertError::ValidationFailed {
            stage: "merge",
            details: "missing \"merges\" array".to_string(),
        })?;

    let mut seen = std::collections::HashSet::new();
    let mut groups = Vec::new();
    for group in array {
        let Some(items) = group.as_array() else {
            return Err(ConvertError::ValidationFailed {
                stage: "merge",
                details: "merge group is not an array".to_string(),
            });
        };
        let mut indices = Vec::new();
        for item in items {
            let Some(idx) = item.as_u64().map(|v| v as usize) else {
                return Err(ConvertError::ValidationFailed {
                    stage: "merge",
                    details: format!("non-integer index {:?}", item),
                });
            };
            if idx >= character_count {
                return Err(ConvertError::ValidationFailed {
                    stage: "merge",
                    details: format!("index {} out of range 0..{}", idx, character_count),
                });
            }
            if seen.insert(idx) {
                indices.push(idx);
            }
        }
        if indices.len() >= 2 {
            groups.push(indices);
        }
    }
    Ok(groups)
}

// --- Assign ---

pub fn assign_system() -> &'static str {
    "You attribute dialogue to speakers in fiction. Respond with valid JSON only."
}

pub fn assign_schema() -> SchemaSpec {
    SchemaSpec {
        name: "speaker_map",
        schema: serde_json::json!({
            "type": "object",
            "additionalProperties": { "type": "string" }
        }),
    }
}

pub fn assign_prompt(
    block: &TextBlock,
    characters: &[Character],
    codebook: &CodeBook,
    prior_error: &Option<String>,
    repeat: bool,
) -> String {
    let numbered = block
        .paragraphs
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}: {}", i, p))
        .collect::<Vec<_>>()
        .join("\n");
    let recap = "return a JSON object mapping line numbers to speaker codes, nothing else";
    format!(
        "Attribute each numbered line below to its speaker.\n\
         \n\
         Speaker codes:\n{}\n\
         \n\
         Instructions:\n\
         - Return a JSON object mapping line numbers to a single speaker code, e.g. {{\"4\": \"A\", \"7\": \"B\"}}.\n\
         - ONLY include lines that are spoken aloud by someone. Leave narration out entirely.\n\
         - A line like '\"X, help me!\" shouted Y.' is spoken by Y, never by the person addressed.\n\
         - Bracketed system or status lines belong to the system speaker if one is listed.\n\
         - Use the unnamed-speaker codes for one-off speakers that have no listed character.{}{}\n\
         \n\
         Lines:\n{}",
        codebook.legend(characters),
        error_context(prior_error),
        maybe_repeat(repeat, recap),
        numbered,
    )
}

fn assign_salvage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""(\d+)"\s*:\s*"([^"]*)""#).expect("salvage regex"))
}

/// Validates one assign response into a sparse relative-index → code map.
/// Keys must parse as integers within the block; unknown codes and
/// numeric-looking values are filtered. When the JSON is truncated, intact
/// `"index": "code"` lines are salvaged and the broken tail dropped.
pub fn parse_assign(
    response: &str,
    sentence_count: usize,
    codebook: &CodeBook,
) -> Result<HashMap<usize, char>> {
    let clean = strip_code_blocks(response);

    let pairs: Vec<(String, String)> = match serde_json::from_str::<Value>(&clean) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        Ok(_) => {
            return Err(ConvertError::ValidationFailed {
                stage: "assign",
                details: "response is not a JSON object".to_string(),
            })
        }
        // Truncated output: salvage complete pairs line by line.
        Err(_) => {
            let salvaged: Vec<(String, String)> = assign_salvage_re()
                .captures_iter(&clean)
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect();
            if salvaged.is_empty() {
                return Err(ConvertError::ValidationFailed {
                    stage: "assign",
                    details: "not valid JSON and nothing to salvage".to_string(),
                });
            }
            salvaged
        }
    };

    let mut out = HashMap::new();
    for (key, value) in pairs {
        let Ok(index) = key.trim().parse::<usize>() else {
            continue;
        };
        if index >= sentence_count {
            continue;
        }
        let value = value.trim();
        // A multi-digit value is a line number echoed back, not a code.
        if value.is_empty() || (value.len() > 1 && value.chars().all(|c| c.is_ascii_digit())) {
            continue;
        }
        let mut chars = value.chars();
        let (Some(code), None) = (chars.next(), chars.next()) else {
            continue;
        };
        if codebook.is_known(code) {
            out.insert(index, code);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characters() -> Vec<Character> {
        vec![
            Character::new("John", vec!["Johnny".into()], Gender::Male),
            Character::new("Sarah", vec![], Gender::Female),
        ]
    }

    #[test]
    fn codebook_assigns_sequential_codes() {
        let chars = characters();
        let book = CodeBook::new(&chars);
        assert_eq!(book.speaker_for('A'), Some("John"));
        assert_eq!(book.speaker_for('B'), Some("Sarah"));
        assert_eq!(book.speaker_for('C'), Some(MALE_UNNAMED));
        assert_eq!(book.speaker_for('D'), Some(FEMALE_UNNAMED));
        assert_eq!(book.speaker_for('E'), Some(UNKNOWN_UNNAMED));
        assert_eq!(book.speaker_for('F'), None);
    }

    #[test]
    fn codebook_rolls_into_digits_and_lowercase() {
        let many: Vec<Character> = (0..30)
            .map(|i| Character::new(format!("C{}", i), vec![], Gender::Unknown))
            .collect();
        let book = CodeBook::new(&many);
        assert_eq!(book.speaker_for('0'), Some("C26"));
        assert_eq!(book.speaker_for('3'), Some("C29"));
        // Sentinels right after the last character.
        assert_eq!(book.speaker_for('4'), Some(MALE_UNNAMED));
    }

    #[test]
    fn strip_code_blocks_variants() {
        assert_eq!(strip_code_blocks("{}"), "{}");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn extract_repairs_missing_fields() {
        let response = r#"{"characters": [
            {"canonicalName": "John", "gender": "male"},
            {"canonicalName": "Sarah", "variations": ["Sally"], "gender": "robot"},
            {"canonicalName": "  ", "gender": "male"},
            {"name": "System", "gender": "female"}
        ]}"#;
        let chars = parse_extract(response).unwrap();
        assert_eq!(chars.len(), 3);
        assert_eq!(chars[0].variations, vec!["John"]);
        assert_eq!(chars[1].gender, Gender::Unknown);
        assert!(chars[1].variations.iter().any(|v| v == "Sally"));
        assert_eq!(chars[2].name, "System");
    }

    #[test]
    fn extract_count_matches_repaired_response() {
        let response = r#"{"characters": [
            {"canonicalName": "A", "gender": "male"},
            {"canonicalName": "B", "gender": "female"},
            {"canonicalName": "", "gender": "male"}
        ]}"#;
        let chars = parse_extract(response).unwrap();
        // Two survive repair; the empty-canonical entry is dropped.
        assert_eq!(chars.len(), 2);
    }

    #[test]
    fn extract_rejects_garbage() {
        assert!(parse_extract("the characters are john and sarah").is_err());
        assert!(parse_extract(r#"{"people": []}"#).is_err());
    }

    #[test]
    fn merge_prunes_duplicates_first_wins() {
        let response = r#"{"merges": [[0, 3, 0], [1, 3, 5]]}"#;
        let groups = parse_merge(response, 6).unwrap();
        assert_eq!(groups, vec![vec![0, 3], vec![1, 5]]);
    }

    #[test]
    fn merge_rejects_out_of_range() {
        assert!(parse_merge(r#"{"merges": [[0, 9]]}"#, 4).is_err());
        assert!(parse_merge(r#"{"merges": [["a", 1]]}"#, 4).is_err());
    }

    #[test]
    fn merge_drops_shrunken_groups() {
        let response = r#"{"merges": [[0, 1], [1, 0]]}"#;
        let groups = parse_merge(response, 2).unwrap();
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn assign_filters_unknown_and_numeric_codes() {
        let chars = characters();
        let book = CodeBook::new(&chars);
        let response = r#"{"0": "A", "1": "Z", "2": "12", "3": "B", "9": "A", "x": "A"}"#;
        let map = parse_assign(response, 5, &book).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0], 'A');
        assert_eq!(map[&3], 'B');
    }

    #[test]
    fn assign_salvages_truncated_output() {
        let chars = characters();
        let book = CodeBook::new(&chars);
        let response = "{\"1\": \"A\", \"4\": \"B\", \"7\": \"A";
        let map = parse_assign(response, 10, &book).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&4], 'B');
    }

    #[test]
    fn prompts_carry_error_context() {
        let chars = characters();
        let block = TextBlock {
            index: 0,
            paragraphs: vec!["\"Hi,\" said John.".into()],
            start_sentence: 0,
        };
        let book = CodeBook::new(&chars);
        let prompt = assign_prompt(
            &block,
            &chars,
            &book,
            &Some("bad code".to_string()),
            true,
        );
        assert!(prompt.contains("bad code"));
        assert!(prompt.contains("Reminder"));
        assert!(prompt.contains("A = John (male)"));
    }
}
