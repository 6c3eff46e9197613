//! Minimal English inflection for payload keys and resource type names.

use once_cell::sync::Lazy;
use regex::Regex;

static CAMEL_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-z\d])([A-Z])").expect("Invalid camel boundary regex")
});

static SEPARATORS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[_\s]+").expect("Invalid separator regex")
});

/// (singular, plural) pairs that do not follow the suffix rules.
const IRREGULARS: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("woman", "women"),
    ("child", "children"),
    ("mouse", "mice"),
    ("goose", "geese"),
    ("tooth", "teeth"),
    ("foot", "feet"),
];

/// Words whose singular and plural forms coincide.
const UNCOUNTABLE: &[&str] = &[
    "equipment", "information", "rice", "money", "species", "series", "fish", "sheep", "news",
    "data", "metadata",
];

/// `superVillain`, `super_villain` and `Super Villain` all become `super-villain`.
pub fn dasherize(input: &str) -> String {
    let split = CAMEL_BOUNDARY.replace_all(input, "$1-$2");
    SEPARATORS.replace_all(&split, "-").to_lowercase()
}

/// `super-villain` and `super_villain` become `superVillain`.
pub fn camelize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for ch in input.chars() {
        if ch == '-' || ch == '_' || ch.is_whitespace() {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else if out.is_empty() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Split off the last word of a dasherized name so inflection only touches it.
fn split_last_word(word: &str) -> (&str, &str) {
    match word.rfind('-') {
        Some(idx) => word.split_at(idx + 1),
        None => ("", word),
    }
}

fn is_uncountable(word: &str) -> bool {
    UNCOUNTABLE.contains(&word)
}

/// Singularize the last word of a (dasherized or camelized) name.
pub fn singularize(word: &str) -> String {
    let dashed = dasherize(word);
    let (head, last) = split_last_word(&dashed);
    format!("{}{}", head, singularize_word(last))
}

fn singularize_word(word: &str) -> String {
    if word.is_empty() || is_uncountable(word) {
        return word.to_string();
    }
    if let Some((singular, _)) = IRREGULARS.iter().find(|(_, plural)| *plural == word) {
        return (*singular).to_string();
    }
    if IRREGULARS.iter().any(|(singular, _)| *singular == word) {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{}y", stem);
        }
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        return word.to_string();
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

/// Pluralize the last word of a dasherized name.
pub fn pluralize(word: &str) -> String {
    let dashed = dasherize(word);
    let (head, last) = split_last_word(&dashed);
    format!("{}{}", head, pluralize_word(last))
}

fn pluralize_word(word: &str) -> String {
    if word.is_empty() || is_uncountable(word) {
        return word.to_string();
    }
    if let Some((_, plural)) = IRREGULARS.iter().find(|(singular, _)| *singular == word) {
        return (*plural).to_string();
    }
    if IRREGULARS.iter().any(|(_, plural)| *plural == word) {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix('y') {
        let vowel_before = stem
            .chars()
            .last()
            .map(|c| "aeiou".contains(c))
            .unwrap_or(false);
        if !vowel_before && !stem.is_empty() {
            return format!("{}ies", stem);
        }
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| word.ends_with(s)) {
        return format!("{}es", word);
    }
    format!("{}s", word)
}
