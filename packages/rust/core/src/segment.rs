//! Deterministic sentence segmentation.
//!
//! The same text always yields the same sentences and ids (`s1`, `s2`,
//! ...), so sentence ids cited by generated panels stay valid across
//! resumed runs.

use std::sync::LazyLock;

use regex::Regex;

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\t\x0B\x0C]+").expect("valid regex"));
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("valid regex"));
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*•·]+\s+").expect("valid regex"));
static ANY_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// One addressable unit of the input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub id: String,
    pub text: String,
}

/// Split `text` into numbered sentences.
///
/// Paragraphs (blank-line separated) are split first. A multi-line
/// paragraph is treated line by line with bullet markers removed. Within
/// a unit, a break happens after `.`, `!` or `?` followed by whitespace
/// and an upper-case ASCII letter or digit, optionally behind an opening
/// quote or bracket.
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let normalized = HORIZONTAL_WS.replace_all(&normalized, " ");
    if normalized.trim().is_empty() {
        return Vec::new();
    }

    let mut units: Vec<String> = Vec::new();
    for para in PARAGRAPH_BREAK.split(&normalized) {
        let para = para.trim_matches(|c| c == '\n' || c == ' ');
        if para.is_empty() {
            continue;
        }
        if para.contains('\n') {
            for line in para.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
                let line = BULLET.replace(line, "");
                units.extend(split_on_terminal_punctuation(&line));
            }
        } else {
            units.extend(split_on_terminal_punctuation(para));
        }
    }

    units
        .iter()
        .map(|u| ANY_WS.replace_all(u, " ").trim().to_string())
        .filter(|u| !u.is_empty())
        .enumerate()
        .map(|(i, text)| Sentence {
            id: format!("s{}", i + 1),
            text,
        })
        .collect()
}

fn split_on_terminal_punctuation(unit: &str) -> Vec<String> {
    let unit = unit.trim();
    if unit.is_empty() {
        return Vec::new();
    }

    let chars: Vec<(usize, char)> = unit.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (idx, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > i + 1 && starts_sentence(&chars[j..]) {
                parts.push(unit[start..idx + c.len_utf8()].to_string());
                start = chars[j].0;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    parts.push(unit[start..].to_string());

    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn starts_sentence(rest: &[(usize, char)]) -> bool {
    let skip = match rest.first() {
        Some((_, '"' | '“' | '”' | '\'' | '‘' | '(' | '[')) => 1,
        Some(_) => 0,
        None => return false,
    };
    rest.get(skip)
        .is_some_and(|(_, c)| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// `s1: text` lines, one per sentence.
pub fn numbered_lines(sentences: &[Sentence]) -> String {
    sentences
        .iter()
        .map(|s| format!("{}: {}", s.id, s.text))
        .collect::<Vec<_>>()
        .join("\n")
}
