use crate::core::state::{FileBoundary, TextBlock};
use regex::Regex;
use std::sync::OnceLock;

/// Splits raw text into trimmed, non-empty paragraphs. The concatenation of
/// the result equals the input modulo whitespace normalisation and the
/// removal of blank lines.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

/// Rough token estimate: whitespace-separated words plus CJK characters,
/// which tokenise roughly one per character.
pub fn estimate_tokens(s: &str) -> usize {
    let words = s.split_whitespace().count();
    let cjk = s
        .chars()
        .filter(|c| {
            matches!(u32::from(*c),
                0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF)
        })
        .count();
    words + cjk
}

/// Packs paragraphs into token-bounded blocks. A single oversized paragraph
/// still forms its own block so the partition stays complete.
pub fn split_blocks(paragraphs: &[String], max_tokens: usize) -> Vec<TextBlock> {
    let mut blocks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;
    let mut start = 0usize;

    for (i, para) in paragraphs.iter().enumerate() {
        let tokens = estimate_tokens(para).max(1);
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            blocks.push(TextBlock {
                index: blocks.len(),
                paragraphs: std::mem::take(&mut current),
                start_sentence: start,
            });
            start = i;
            current_tokens = 0;
        }
        current.push(para.clone());
        current_tokens += tokens;
    }
    if !current.is_empty() {
        blocks.push(TextBlock {
            index: blocks.len(),
            paragraphs: current,
            start_sentence: start,
        });
    }
    blocks
}

fn heading_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(chapter|part|book|prologue|epilogue|interlude)\b[\s.:\-]*([^\n]{0,60})$",
        )
        .expect("heading regex")
    })
}

/// Characters that cannot appear in output file names.
fn safe_label(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut label: String = collapsed.chars().take(60).collect();
    label = label.trim().trim_end_matches('.').to_string();
    label
}

/// Detects output-file boundaries from chapter-style headings. Every text
/// gets at least one boundary at sentence 0, labelled `fallback` when no
/// heading opens the book. Duplicate labels get a numeric suffix so output
/// paths stay unique.
pub fn detect_file_boundaries(paragraphs: &[String], fallback: &str) -> Vec<FileBoundary> {
    let mut boundaries: Vec<FileBoundary> = Vec::new();
    for (i, para) in paragraphs.iter().enumerate() {
        if para.len() <= 80 {
            if let Some(caps) = heading_regex().captures(para) {
                let label = safe_label(caps.get(0).map(|m| m.as_str()).unwrap_or(para));
                if !label.is_empty() {
                    boundaries.push(FileBoundary {
                        label,
                        first_sentence: i,
                    });
                }
            }
        }
    }

    if boundaries.first().map(|b| b.first_sentence) != Some(0) {
        boundaries.insert(
            0,
            FileBoundary {
                label: safe_label(fallback),
                first_sentence: 0,
            },
        );
    }

    let mut seen = std::collections::HashMap::new();
    for b in boundaries.iter_mut() {
        let n = seen.entry(b.label.clone()).or_insert(0usize);
        *n += 1;
        if *n > 1 {
            b.label = format!("{} {:04}", b.label, n);
        }
    }
    boundaries
}
