//! Chapter name cleanup and chapter number recognition
//!
//! Sources often leave the chapter number unset or report it as `-1`. The
//! number is then recognized from the chapter name after the manga title,
//! volume tags and similar noise are removed.

use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Reported number meaning "no number, keep as is"
const UNNUMBERED: f32 = -2.0;
const UNKNOWN: f32 = -1.0;

const NUMBER_PATTERN: &str = r"([0-9]+)(\.[0-9]+)?(\.?[a-z]+)?";

struct Patterns {
    /// `ch.xx`: "Mokushiroku Alice Vol.1 Ch. 4: Misrepresentation" gives 4
    basic: Regex,
    /// First number: "Bleach 567: Down With Snowwhite" gives 567
    number: Regex,
    /// Volume and version tags
    unwanted: Regex,
    /// Whitespace before an extra/special/omake marker
    unwanted_whitespace: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                basic: Regex::new(&format!(r"(?i)ch\. *{}", NUMBER_PATTERN)).ok()?,
                number: Regex::new(&format!("(?i){}", NUMBER_PATTERN)).ok()?,
                unwanted: Regex::new(r"(?i)\b(?:v|ver|vol|version|volume|season|s)[^a-z]?[0-9]+").ok()?,
                unwanted_whitespace: Regex::new(r"(?i)\s(extra|special|omake)").ok()?,
            })
        })
        .as_ref()
}

/// Chapter number of `chapter_name`, trusting `reported` when the source set one
pub fn parse_chapter_number(manga_title: &str, chapter_name: &str, reported: Option<f32>) -> f32 {
    if let Some(number) = reported {
        if number == UNNUMBERED || number > UNKNOWN {
            return number;
        }
    }
    let fallback = reported.unwrap_or(UNKNOWN);
    let Some(patterns) = patterns() else {
        return fallback;
    };

    let mut name = chapter_name.to_lowercase();
    let title = manga_title.to_lowercase();
    if !title.is_empty() {
        name = name.replace(&title, "");
    }
    let name = name.trim().replace([',', '-'], ".");
    let name = patterns.unwanted_whitespace.replace_all(&name, "$1");

    let matches: Vec<Captures> = patterns.number.captures_iter(&name).collect();
    let Some(first) = matches.first() else {
        return fallback;
    };

    if matches.len() > 1 {
        let stripped = patterns.unwanted.replace_all(&name, "");
        if let Some(basic) = patterns.basic.captures(&stripped) {
            return number_from(&basic);
        }
        // the first number may have been a removed tag
        if let Some(number) = patterns.number.captures(&stripped) {
            return number_from(&number);
        }
    }

    number_from(first)
}

fn number_from(captures: &Captures) -> f32 {
    let initial = captures
        .get(1)
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .unwrap_or(UNKNOWN);
    let decimal = captures.get(2).map(|m| m.as_str());
    let alpha = captures.get(3).map(|m| m.as_str());
    initial + sub_chapter(decimal, alpha)
}

fn sub_chapter(decimal: Option<&str>, alpha: Option<&str>) -> f32 {
    if let Some(decimal) = decimal.filter(|d| !d.is_empty()) {
        return format!("0{}", decimal).parse().unwrap_or(0.0);
    }
    let Some(alpha) = alpha.filter(|a| !a.is_empty()) else {
        return 0.0;
    };
    let alpha = alpha.to_lowercase();
    if alpha.contains("extra") {
        return 0.99;
    }
    if alpha.contains("omake") {
        return 0.98;
    }
    if alpha.contains("special") {
        return 0.97;
    }

    // x.a is x.1 up to x.i; later letters add nothing
    let trimmed = alpha.trim_start_matches('.');
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(letter @ 'a'..='i'), None) => (letter as u32 - 'a' as u32 + 1) as f32 / 10.0,
        _ => 0.0,
    }
}

/// Chapter name without the manga title prefix and surrounding separators
pub fn sanitize_chapter_name(chapter_name: &str, manga_title: &str) -> String {
    let trimmed = chapter_name.trim();
    let without_title = if manga_title.is_empty() {
        trimmed
    } else {
        trimmed.strip_prefix(manga_title).unwrap_or(trimmed)
    };
    without_title
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | ',' | ':'))
        .to_string()
}
