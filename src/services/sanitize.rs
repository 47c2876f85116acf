use regex::Regex;
use std::sync::OnceLock;

fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").expect("link regex"))
}

fn markdown_emphasis_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[*_]{1,3}([^*_]+)[*_]{1,3}").expect("emphasis regex"))
}

fn markdown_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s{0,3}(#{1,6}|>+)\s*").expect("heading regex"))
}

fn is_bidi_control(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

/// Strips markdown decoration, control characters and bidi overrides, then
/// normalises all whitespace runs to single spaces. Idempotent.
pub fn sanitize_text(input: &str) -> String {
    let s = markdown_link_re().replace_all(input, "$1");
    let s = markdown_heading_re().replace_all(&s, "");
    let s = markdown_emphasis_re().replace_all(&s, "$1");
    let s = s.replace('`', "");

    let s: String = s
        .chars()
        .filter(|c| !is_bidi_control(*c))
        .map(|c| {
            if c.is_control() || c.is_whitespace() {
                ' '
            } else {
                c
            }
        })
        .collect();

    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

enum RuleKind {
    /// `regex"P"="R"`: raw pattern, replacement may reference groups.
    Pattern,
    /// `"L"="R"` and `TOKEN=R`: replacement taken literally.
    Literal,
}

struct Rule {
    re: Regex,
    replacement: String,
    kind: RuleKind,
}

/// User dictionary applied to assignment text before synthesis.
pub struct Dictionary {
    rules: Vec<Rule>,
}

impl Dictionary {
    /// Parses one rule per line. Malformed lines are skipped with a warning
    /// so a single typo does not sink the whole conversion.
    pub fn parse(lines: &[String], case_sensitive: bool) -> Self {
        let mut rules = Vec::new();
        for (no, raw) in lines.iter().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::parse_rule(line, case_sensitive) {
                Some(rule) => rules.push(rule),
                None => log::warn!("dictionary line {} is not a valid rule: {}", no + 1, raw),
            }
        }
        Dictionary { rules }
    }

    fn parse_rule(line: &str, case_sensitive: bool) -> Option<Rule> {
        if let Some(rest) = line.strip_prefix("regex\"") {
            let (pattern, replacement) = split_quoted(rest)?;
            let re = Regex::new(&pattern).ok()?;
            let replacement = replacement.replace("\\n", "\n").replace("\\r", "\r");
            return Some(Rule {
                re,
                replacement,
                kind: RuleKind::Pattern,
            });
        }
        if let Some(rest) = line.strip_prefix('"') {
            let (literal, replacement) = split_quoted(rest)?;
            let flag = if case_sensitive { "" } else { "(?i)" };
            let re = Regex::new(&format!("{}{}", flag, regex::escape(&literal))).ok()?;
            return Some(Rule {
                re,
                replacement,
                kind: RuleKind::Literal,
            });
        }
        let (token, replacement) = line.split_once('=')?;
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let flag = if case_sensitive { "" } else { "(?i)" };
        let re = Regex::new(&format!(r"{}\b{}\b", flag, regex::escape(token))).ok()?;
        Some(Rule {
            re,
            replacement: replacement.to_string(),
            kind: RuleKind::Literal,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            out = match rule.kind {
                RuleKind::Pattern => rule.re.replace_all(&out, rule.replacement.as_str()),
                // Literal replacements must not expand `$` group references.
                RuleKind::Literal => rule
                    .re
                    .replace_all(&out, regex::NoExpand(&rule.replacement)),
            }
            .into_owned();
        }
        out
    }
}

/// Splits `P"="R"` into pattern and replacement, both quote-delimited.
fn split_quoted(rest: &str) -> Option<(String, String)> {
    let sep = rest.find("\"=\"")?;
    let pattern = &rest[..sep];
    let tail = &rest[sep + 3..];
    let replacement = tail.strip_suffix('"')?;
    Some((pattern.to_string(), replacement.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_markdown() {
        assert_eq!(sanitize_text("**bold** and _soft_"), "bold and soft");
        assert_eq!(sanitize_text("# Heading"), "Heading");
        assert_eq!(sanitize_text("see [the map](http://x) now"), "see the map now");
        assert_eq!(sanitize_text("`code` here"), "code here");
    }

    #[test]
    fn sanitize_strips_controls_and_bidi() {
        assert_eq!(sanitize_text("a\u{202E}b\u{0007}c"), "ab c");
        assert_eq!(sanitize_text("x\u{200F}y"), "xy");
    }

    #[test]
    fn sanitize_normalises_whitespace() {
        assert_eq!(sanitize_text("a\t b\n\nc\u{00A0}d"), "a b c d");
    }

    #[test]
    fn sanitize_is_a_fixed_point() {
        let samples = [
            "**bold** [link](u) `c`\u{202A}\t x",
            "plain text stays plain",
            "# title\n> quote",
        ];
        for s in samples {
            let once = sanitize_text(s);
            assert_eq!(sanitize_text(&once), once);
        }
    }

    #[test]
    fn dictionary_regex_rule() {
        let dict = Dictionary::parse(
            &[r#"regex"M(r|rs)\."="Mister""#.to_string()],
            false,
        );
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.apply("Mr. Jones met Mrs. Lee"), "Mister Jones met Mister Lee");
    }

    #[test]
    fn dictionary_regex_replacement_unescapes_newlines() {
        let dict = Dictionary::parse(&[r#"regex"; "="\n""#.to_string()], false);
        assert_eq!(dict.apply("a; b"), "a\nb");
    }

    #[test]
    fn dictionary_literal_rule_case_insensitive() {
        let dict = Dictionary::parse(&[r#""sql"="sequel""#.to_string()], false);
        assert_eq!(dict.apply("SQL and sql"), "sequel and sequel");

        let strict = Dictionary::parse(&[r#""sql"="sequel""#.to_string()], true);
        assert_eq!(strict.apply("SQL and sql"), "SQL and sequel");
    }

    #[test]
    fn dictionary_literal_replacement_is_not_expanded() {
        let dict = Dictionary::parse(&[r#""cost"="$5""#.to_string()], false);
        assert_eq!(dict.apply("the cost"), "the $5");
    }

    #[test]
    fn dictionary_token_rule_respects_word_boundaries() {
        let dict = Dictionary::parse(&["lvl=level".to_string()], false);
        assert_eq!(dict.apply("lvl 3 in lvls"), "level 3 in lvls");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dict = Dictionary::parse(
            &[
                "no separator here".to_string(),
                r#"regex"["="broken""#.to_string(),
                "good=fine".to_string(),
            ],
            false,
        );
        assert_eq!(dict.len(), 1);
    }
}
