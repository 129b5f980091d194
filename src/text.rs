// src/text.rs
//! Text normalization shared by the keyword index, the scorers and the generator.
//!
//! Everything that gets compared (dictionary keywords, listing text, explicit
//! keywords) goes through the same `normalize` so matching is case- and
//! diacritics-insensitive.

use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Decode entities, strip tags, lowercase, fold diacritics, and turn
/// punctuation (including hyphens) into single spaces.
///
/// Folding works on the canonical decomposition, so precomposed and
/// decomposed input normalize to the same string.
pub fn normalize(s: &str) -> String {
    // 1) HTML entity decode
    let decoded = html_escape::decode_html_entities(s);

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    let stripped = re_tags.replace_all(&decoded, " ");

    // 3) Decompose, drop marks, lowercase + fold, punctuation → space
    let mut out = String::with_capacity(stripped.len());
    let mut prev_space = true;
    for ch in stripped
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
    {
        if ch.is_alphanumeric() {
            match fold_char(ch) {
                Some(rep) => out.push_str(rep),
                None => out.push(ch),
            }
            prev_space = false;
        } else if !prev_space {
            out.push(' ');
            prev_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Normalized form of a dictionary keyword (tokens joined by one space).
pub fn normalize_keyword(s: &str) -> String {
    normalize(s)
}

/// Letters with no canonical decomposition.
fn fold_char(c: char) -> Option<&'static str> {
    let rep = match c {
        'đ' => "dj",
        'ß' => "ss",
        'ł' => "l",
        'ø' => "o",
        'æ' => "ae",
        'œ' => "oe",
        'ı' => "i",
        _ => return None,
    };
    Some(rep)
}

fn is_stop_word(w: &str) -> bool {
    static STOP: OnceCell<HashSet<&'static str>> = OnceCell::new();
    STOP.get_or_init(|| {
        [
            // en
            "the", "a", "an", "in", "on", "for", "to", "from", "with", "and", "or", "of", "at",
            "by", "is", "are", "new", "used", "sale", "sell", "selling",
            // sr (latin, folded)
            "i", "u", "na", "sa", "za", "od", "do", "iz", "je", "se", "prodajem", "prodaja",
            "nov", "novo", "polovan",
            // ru
            "и", "в", "на", "с", "по", "для", "от", "до", "из", "продам", "продаю",
        ]
        .into_iter()
        .collect()
    })
    .contains(w)
}

/// Token view of one detection input, ready for keyword matching.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    /// Full normalized token sequence (for phrase matching).
    sequence: Vec<String>,
    /// Filtered single terms + whole normalized explicit keywords.
    terms: HashSet<String>,
}

impl TokenSet {
    /// Build from free text plus explicit keywords. Free-text tokens shorter than
    /// `min_len` chars or stop words are ignored as single terms; explicit
    /// keywords are always kept.
    pub fn build(texts: &[&str], explicit: &[String], min_len: usize) -> Self {
        let mut sequence = Vec::new();
        let mut terms = HashSet::new();

        for text in texts {
            let norm = normalize(text);
            for tok in norm.split(' ').filter(|t| !t.is_empty()) {
                if tok.chars().count() >= min_len && !is_stop_word(tok) {
                    terms.insert(tok.to_string());
                }
                sequence.push(tok.to_string());
            }
            // phrase boundary between fields
            sequence.push(String::new());
        }

        for kw in explicit {
            let norm = normalize_keyword(kw);
            if norm.is_empty() {
                continue;
            }
            for tok in norm.split(' ') {
                if !is_stop_word(tok) {
                    terms.insert(tok.to_string());
                }
                sequence.push(tok.to_string());
            }
            sequence.push(String::new());
            terms.insert(norm);
        }

        Self { sequence, terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Match an already-normalized keyword (single token or phrase).
    pub fn matches(&self, normalized_keyword: &str) -> bool {
        if normalized_keyword.is_empty() {
            return false;
        }
        if self.terms.contains(normalized_keyword) {
            return true;
        }
        if !normalized_keyword.contains(' ') {
            return false;
        }
        let phrase: Vec<&str> = normalized_keyword.split(' ').collect();
        self.sequence
            .windows(phrase.len())
            .any(|w| w.iter().zip(&phrase).all(|(a, b)| a == b))
    }
}

/// Short anonymized id for logs. Raw listing text is never logged.
pub fn input_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_diacritics_and_punctuation() {
        assert_eq!(normalize("Mercedes-Benz  E-Klasse!"), "mercedes benz e klasse");
        assert_eq!(normalize("Čokoladni ŽELE, đak"), "cokoladni zele djak");
        assert_eq!(normalize("<b>iPhone&nbsp;15</b> &amp; case"), "iphone 15 case");
        assert_eq!(normalize("Смартфон Ёлка"), "смартфон елка");
        assert_eq!(normalize("  ...  "), "");
    }

    #[test]
    fn decomposed_and_precomposed_input_fold_alike() {
        let nfc = "\u{010C}okolada Kr\u{00F6}te \u{0160}I\u{0160}ARKA";
        let nfd = "C\u{030C}okolada Kro\u{0308}te S\u{030C}IS\u{030C}ARKA";
        assert_eq!(normalize(nfc), "cokolada krote sisarka");
        assert_eq!(normalize(nfd), normalize(nfc));
        assert_eq!(normalize("\u{0415}\u{0308}лка"), normalize("\u{0401}лка"));

        let ts = TokenSet::build(&[nfd], &[], 3);
        assert!(ts.matches(&normalize_keyword("čokolada")));
    }

    #[test]
    fn token_set_filters_short_and_stop_words() {
        let ts = TokenSet::build(&["The new iPhone 15 for sale"], &[], 3);
        assert!(ts.matches("iphone"));
        assert!(!ts.matches("the"));
        assert!(!ts.matches("15"));
        // phrases still see the full sequence
        assert!(ts.matches("iphone 15"));
    }

    #[test]
    fn explicit_keywords_are_always_terms() {
        let ts = TokenSet::build(&[], &["TV".to_string(), "Smart Phone".to_string()], 3);
        assert!(ts.matches("tv"));
        assert!(ts.matches("smart phone"));
        assert!(ts.matches("phone"));
    }

    #[test]
    fn phrases_do_not_cross_field_boundaries() {
        let ts = TokenSet::build(&["red iphone", "case cover"], &[], 3);
        assert!(ts.matches("case cover"));
        assert!(!ts.matches("iphone case"));
    }

    #[test]
    fn input_hash_is_short_and_stable() {
        let a = input_hash("hello");
        assert_eq!(a.len(), 12);
        assert_eq!(a, input_hash("hello"));
        assert_ne!(a, input_hash("hello!"));
    }
}
