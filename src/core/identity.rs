//! Canonicalization of raw (name, size, surface) triples.
//!
//! Source folders and spreadsheets spell the same product many ways: mixed
//! case, Turkish dotted/dotless I, sizes glued into the name, finish names in
//! the wrong field, colour words run together with the series name. The
//! normalizer folds all of these onto one [`CanonicalIdentity`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::config::VocabularyConfig;

/// Name used when nothing is left of the product name after cleaning.
pub const UNKNOWN_PRODUCT: &str = "UNKNOWN-PRODUCT";
/// Size used when the size field is blank.
pub const UNKNOWN_SIZE: &str = "UNKNOWN-SIZE";
/// Surface used when the finish text has no letters at all.
pub const OTHER_SURFACE: &str = "OTHER";

/// Identity triple as supplied by a scanner or spreadsheet, untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawIdentity {
    pub name: String,
    pub size: String,
    pub surface: String,
}

impl RawIdentity {
    pub fn new(name: impl Into<String>, size: impl Into<String>, surface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: size.into(),
            surface: surface.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    pub name: String,
    pub size: String,
    pub surface: String,
}

impl CanonicalIdentity {
    /// True when the name collapsed to [`UNKNOWN_PRODUCT`].
    pub fn has_unknown_name(&self) -> bool {
        self.name == UNKNOWN_PRODUCT
    }

    pub fn has_sentinel(&self) -> bool {
        self.has_unknown_name() || self.size == UNKNOWN_SIZE
    }
}

/// Turns [`RawIdentity`] values into [`CanonicalIdentity`] values.
///
/// All lookup tables are compiled once at construction; the normalizer is
/// immutable afterwards and can be shared across worker threads.
#[derive(Debug, Clone)]
pub struct IdentityNormalizer {
    size_token: Regex,
    name_noise: Option<Regex>,
    colors: Option<Regex>,
    /// (upper-cased finish name, code), longest name first.
    surfaces: Vec<(String, String)>,
}

impl IdentityNormalizer {
    pub fn new(vocabulary: &VocabularyConfig) -> Self {
        let mut surfaces: Vec<(String, String)> = vocabulary
            .surfaces
            .iter()
            .map(|entry| (fold_upper(&entry.name), surface_code(&entry.code)))
            .filter(|(name, _)| !name.is_empty())
            .collect();
        sort_longest_first(&mut surfaces, |(name, _)| name);

        let mut noise: Vec<String> = surfaces
            .iter()
            .flat_map(|(name, code)| [name.clone(), code.clone()])
            .chain(vocabulary.name_noise.iter().map(|word| fold_upper(word)))
            .filter(|word| !word.trim().is_empty())
            .collect();
        noise.sort();
        noise.dedup();
        sort_longest_first(&mut noise, |word| word);

        let mut colors: Vec<String> = vocabulary
            .colors
            .iter()
            .map(|word| fold_upper(word))
            .filter(|word| !word.is_empty())
            .collect();
        colors.sort();
        colors.dedup();
        sort_longest_first(&mut colors, |word| word);

        Self {
            size_token: Regex::new(r"\d+\s*[X×*]\s*\d+").expect("static size pattern"),
            name_noise: alternation(&noise, true),
            colors: alternation(&colors, false),
            surfaces,
        }
    }

    pub fn normalize(&self, raw: &RawIdentity) -> CanonicalIdentity {
        CanonicalIdentity {
            name: self.normalize_name(&raw.name),
            size: self.normalize_size(&raw.size),
            surface: self.normalize_surface(&raw.surface),
        }
    }

    /// Cleaned name with its tokens sorted, so word order does not matter.
    pub fn normalize_name(&self, name: &str) -> String {
        let text = self.clean_name(name);
        let mut tokens: Vec<String> = text
            .split_whitespace()
            .map(|token| token.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>())
            .filter(|token| !token.is_empty())
            .collect();

        if tokens.is_empty() {
            return UNKNOWN_PRODUCT.to_string();
        }
        tokens.sort();
        tokens.join(" ")
    }

    /// Cleaned name in its original word order.
    pub fn clean_name(&self, name: &str) -> String {
        let mut text = fold_upper(name);

        text = self.size_token.replace_all(&text, " ").into_owned();
        text = text
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        if let Some(noise) = &self.name_noise {
            text = noise.replace_all(&text, " ").into_owned();
        }

        if let Some(colors) = &self.colors {
            text = split_glued(&text, colors);
        }

        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn normalize_size(&self, size: &str) -> String {
        let normalized: String = fold_upper(size)
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == '×' || c == '*' { 'X' } else { c })
            .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == ',')
            .collect();

        // Pure punctuation would make a "." or ".." directory component.
        if !normalized.chars().any(|c| c.is_ascii_alphanumeric()) {
            return UNKNOWN_SIZE.to_string();
        }
        normalized
    }

    pub fn normalize_surface(&self, surface: &str) -> String {
        let cleaned: String = fold_upper(surface)
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let text = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

        if !text.is_empty() {
            let padded = format!(" {text} ");
            for (name, code) in &self.surfaces {
                if *name == text || padded.contains(&format!(" {name} ")) {
                    return code.clone();
                }
            }
        }

        let residue: String = text.chars().filter(|c| c.is_ascii_uppercase()).collect();
        if residue.is_empty() {
            OTHER_SURFACE.to_string()
        } else {
            residue
        }
    }
}

/// Upper-cases and folds accented and Turkish letters onto plain ASCII.
fn fold_upper(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ı' | 'İ' => 'I',
            other => other,
        })
        .flat_map(char::to_uppercase)
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Folds a configured surface code down to ASCII letters and digits, so it
/// can never carry the key separator or a path character.
fn surface_code(code: &str) -> String {
    let code: String = fold_upper(code).chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if code.is_empty() {
        OTHER_SURFACE.to_string()
    } else {
        code
    }
}

/// True when `code` already is plain letters and digits once upper-cased.
pub fn is_valid_surface_code(code: &str) -> bool {
    let folded = fold_upper(code);
    !folded.is_empty() && folded.chars().all(|c| c.is_ascii_alphanumeric())
}

fn sort_longest_first<T>(items: &mut [T], text: impl Fn(&T) -> &String) {
    items.sort_by(|a, b| {
        let (a, b) = (text(a), text(b));
        b.chars().count().cmp(&a.chars().count()).then_with(|| a.cmp(b))
    });
}

/// Builds `\b(?:A|B|...)\b` (or without boundaries) from words already sorted
/// longest-first; the regex engine takes the first alternative that matches.
fn alternation(words: &[String], bounded: bool) -> Option<Regex> {
    if words.is_empty() {
        return None;
    }
    let body = words
        .iter()
        .map(|word| {
            word.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect::<Vec<_>>()
        .join("|");
    let pattern = if bounded {
        format!(r"\b(?:{body})\b")
    } else {
        format!("(?:{body})")
    };
    Regex::new(&pattern).ok()
}

/// Inserts a space before every colour word that directly follows a letter.
fn split_glued(text: &str, colors: &Regex) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut last = 0;
    for found in colors.find_iter(text) {
        let preceded_by_letter = text[..found.start()]
            .chars()
            .next_back()
            .is_some_and(char::is_alphabetic);
        out.push_str(&text[last..found.start()]);
        if preceded_by_letter {
            out.push(' ');
        }
        out.push_str(found.as_str());
        last = found.end();
    }
    out.push_str(&text[last..]);
    out
}
