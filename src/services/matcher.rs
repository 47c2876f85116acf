use crate::core::state::Character;

/// Canonical comparison form: lowercased, trimmed, inner whitespace
/// collapsed, honorific punctuation dropped.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '.' || c == ',' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            row[j + 1] = (prev[j] + cost).min(row[j] + 1).min(prev[j + 1] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Fuzzy equality for profile import and cross-block merges: normalised
/// match, or one edit apart for names long enough that a single typo is the
/// likelier explanation than two different people.
pub fn names_match(a: &str, b: &str) -> bool {
    let na = normalize_name(a);
    let nb = normalize_name(b);
    if na.is_empty() || nb.is_empty() {
        return false;
    }
    if na == nb {
        return true;
    }
    na.chars().count() >= 5 && nb.chars().count() >= 5 && edit_distance(&na, &nb) <= 1
}

/// Whether `name` refers to `character` through its canonical name or any
/// variation.
pub fn matches_character(name: &str, character: &Character) -> bool {
    names_match(name, &character.name)
        || character.variations.iter().any(|v| names_match(name, v))
}

/// Case-insensitive merge by canonical name: later duplicates are absorbed
/// into the first occurrence, unioning variations and upgrading gender.
pub fn merge_same_characters(characters: Vec<Character>) -> Vec<Character> {
    let mut merged: Vec<Character> = Vec::new();
    for c in characters {
        match merged
            .iter_mut()
            .find(|m| normalize_name(&m.name) == normalize_name(&c.name))
        {
            Some(existing) => existing.absorb(&c),
            None => merged.push(c),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Gender;

    #[test]
    fn normalize_collapses_case_and_punctuation() {
        assert_eq!(normalize_name("  Mr. Smith "), "mr smith");
        assert_eq!(normalize_name("JOHN   DOE"), "john doe");
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "ab"), 2);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn short_names_never_fuzzy_match() {
        assert!(!names_match("Sam", "Sab"));
        assert!(names_match("Elizabeth", "Elisabeth"));
        assert!(names_match("john", "John"));
        assert!(!names_match("John", "Joan"));
    }

    #[test]
    fn variation_matching() {
        let c = Character::new(
            "Elizabeth Bennet",
            vec!["Lizzy".into(), "Miss Bennet".into()],
            Gender::Female,
        );
        assert!(matches_character("lizzy", &c));
        assert!(matches_character("miss bennet", &c));
        assert!(!matches_character("Jane", &c));
    }

    #[test]
    fn merge_unions_duplicates() {
        let chars = vec![
            Character::new("John", vec!["Johnny".into()], Gender::Unknown),
            Character::new("Sarah", vec![], Gender::Female),
            Character::new("JOHN", vec!["Mr. Smith".into()], Gender::Male),
        ];
        let merged = merge_same_characters(chars);
        assert_eq!(merged.len(), 2);
        let john = &merged[0];
        assert_eq!(john.name, "John");
        assert_eq!(john.gender, Gender::Male);
        assert!(john.variations.iter().any(|v| v == "Mr. Smith"));
        assert!(john.variations.iter().any(|v| v == "Johnny"));
    }
}
