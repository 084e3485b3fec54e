//! Turning extracted text into record fields.
//!
//! Everything here is best effort: a field that cannot be found is left
//! empty, never guessed.

use crate::{
    doc_id::RecordId,
    record::{ContentIdentity, Record, StudyType},
};

/// Documents at least this long count as full text rather than an abstract
/// or a stub.
const FULL_TEXT_MIN_WORDS: usize = 300;

/// How far into a document the classifier looks for design keywords.
const CLASSIFY_WINDOW_CHARS: usize = 5_000;

const MAX_TITLE_CHARS: usize = 300;

/// Record fields derived from a document's text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedFields {
    pub title: String,
    pub doi: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
    pub study_type: StudyType,
    pub sample_size: Option<u64>,
    pub has_full_text: bool,
}

impl NormalizedFields {
    pub fn into_record(
        self,
        id: RecordId,
        identity: ContentIdentity,
        content_hash: String,
    ) -> Record {
        Record {
            id,
            doi: self.doi,
            title: self.title,
            authors: self.authors,
            year: self.year,
            abstract_text: self.abstract_text,
            study_type: self.study_type,
            sample_size: self.sample_size,
            quality: None,
            has_full_text: self.has_full_text,
            identity,
            content_hash,
        }
    }
}

/// Derive record fields from `text`. `key` is the document's identity in its
/// library, used for the title when the text has none.
pub fn normalize(text: &str, key: &str) -> NormalizedFields {
    let title = extract_title(text, key);
    let abstract_text = extract_abstract(text);

    let mut study_type = classify(&format!(
        "{title}\n{}",
        abstract_text.as_deref().unwrap_or("")
    ));
    if study_type == StudyType::Other {
        study_type = classify(prefix_chars(text, CLASSIFY_WINDOW_CHARS));
    }

    NormalizedFields {
        doi: extract_doi(text),
        authors: extract_authors(text),
        year: extract_year(text),
        sample_size: extract_sample_size(text),
        has_full_text: text.split_whitespace().count() >= FULL_TEXT_MIN_WORDS,
        title,
        abstract_text,
        study_type,
    }
}

fn prefix_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Text of a markdown heading line, if `line` is one.
fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let rest = trimmed.trim_start_matches('#');
    if rest.len() == trimmed.len() || !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim())
}

/// `line` minus a case-insensitive ASCII `label` prefix.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.get(..label.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(label))
        .map(|_| &line[label.len()..])
}

fn is_field_line(line: &str) -> bool {
    let line = line.trim();
    ["authors:", "author:", "doi:", "year:", "abstract:"]
        .iter()
        .any(|p| strip_label(line, p).is_some())
}

/// First markdown heading, else the first non-empty line that is not a
/// labelled field, else the file name without extension.
fn extract_title(text: &str, key: &str) -> String {
    let title = text
        .lines()
        .find_map(|line| heading_text(line).filter(|h| !h.is_empty()))
        .or_else(|| {
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && !l.starts_with('#') && !is_field_line(l))
        });

    match title {
        Some(title) => prefix_chars(title, MAX_TITLE_CHARS).to_string(),
        None => {
            let name = key.rsplit('/').next().unwrap_or(key);
            let stem = match name.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem,
                _ => name,
            };
            if stem.is_empty() {
                "untitled".to_string()
            } else {
                stem.to_string()
            }
        }
    }
}

/// First `10.<registrant>/<suffix>` in the text.
fn extract_doi(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for (start, _) in text.match_indices("10.") {
        if start > 0 && bytes[start - 1].is_ascii_alphanumeric() {
            continue;
        }
        let rest = &text[start + 3..];
        let registrant_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        if registrant_len < 4 || rest.as_bytes().get(registrant_len) != Some(&b'/') {
            continue;
        }
        let suffix = &rest[registrant_len + 1..];
        let suffix_len = suffix
            .find(|c: char| c.is_whitespace() || matches!(c, '"' | '<' | '>'))
            .unwrap_or(suffix.len());
        let suffix = suffix[..suffix_len]
            .trim_end_matches(['.', ',', ';', ':', ')', ']', '\'']);
        if suffix.is_empty() {
            continue;
        }
        return Some(format!("10.{}/{}", &rest[..registrant_len], suffix));
    }
    None
}

/// A `Year:` line if present, else the first plausible four-digit year.
fn extract_year(text: &str) -> Option<i32> {
    let parse = |token: &str| -> Option<i32> {
        if token.len() != 4 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        token.parse().ok().filter(|y| (1900..=2099).contains(y))
    };

    let labelled = text.lines().find_map(|line| {
        let value = strip_label(line.trim(), "year:")?;
        value.split(|c: char| !c.is_ascii_digit()).find_map(parse)
    });
    labelled.or_else(|| {
        prefix_chars(text, CLASSIFY_WINDOW_CHARS)
            .split(|c: char| !c.is_ascii_alphanumeric())
            .find_map(parse)
    })
}

/// Names from an `Authors:` line, split on `;` when present, else on `,`
/// and `and`.
fn extract_authors(text: &str) -> Vec<String> {
    let Some(list) = text.lines().find_map(|line| {
        let trimmed = line.trim();
        ["authors:", "author:"]
            .iter()
            .find_map(|p| strip_label(trimmed, p))
            .map(str::trim)
    }) else {
        return Vec::new();
    };

    let parts: Vec<&str> = if list.contains(';') {
        list.split(';').collect()
    } else {
        list.split(',').flat_map(|p| p.split(" and ")).collect()
    };
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// The paragraph after an `Abstract` heading, or the rest of an
/// `Abstract:` line.
fn extract_abstract(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let label = heading_text(trimmed)
            .unwrap_or(trimmed)
            .trim_matches(|c: char| c == '*' || c == '_');

        if let Some(inline) = strip_label(label, "abstract:") {
            let inline = inline
                .trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace());
            if !inline.is_empty() {
                return Some(inline.to_string());
            }
        } else if !label.eq_ignore_ascii_case("abstract") {
            continue;
        }

        let mut paragraph: Vec<&str> = Vec::new();
        for next in &lines[i + 1..] {
            let next = next.trim();
            if heading_text(next).is_some() {
                break;
            }
            if next.is_empty() {
                if paragraph.is_empty() {
                    continue;
                }
                break;
            }
            paragraph.push(next);
        }
        if !paragraph.is_empty() {
            return Some(paragraph.join(" "));
        }
    }
    None
}

fn parse_count(token: &str) -> Option<u64> {
    let digits: String = token.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

const PARTICIPANT_WORDS: &[&str] = &[
    "participants",
    "patients",
    "subjects",
    "individuals",
    "adults",
    "children",
    "women",
    "men",
];

/// Largest sample size stated as `n = 123` or `123 participants`.
fn extract_sample_size(text: &str) -> Option<u64> {
    let mut best: Option<u64> = None;
    let mut consider = |n: u64| best = Some(best.map_or(n, |b| b.max(n)));

    let chars: Vec<char> = text.chars().collect();
    for i in 0..chars.len() {
        if !matches!(chars[i], 'n' | 'N') {
            continue;
        }
        if i > 0 && chars[i - 1].is_alphanumeric() {
            continue;
        }
        let mut j = i + 1;
        while j < chars.len() && chars[j] == ' ' {
            j += 1;
        }
        if chars.get(j) != Some(&'=') {
            continue;
        }
        j += 1;
        while j < chars.len() && chars[j] == ' ' {
            j += 1;
        }
        let number: String = chars[j..]
            .iter()
            .take_while(|c| c.is_ascii_digit() || **c == ',')
            .collect();
        if let Some(n) = parse_count(number.trim_end_matches(',')) {
            consider(n);
        }
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    for pair in words.windows(2) {
        let noun = pair[1]
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if PARTICIPANT_WORDS.contains(&noun.as_str())
            && let Some(n) =
                parse_count(pair[0].trim_matches(|c: char| !c.is_ascii_digit()))
        {
            consider(n);
        }
    }

    best
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

/// Classify a study by design keywords, strongest design first.
fn classify(text: &str) -> StudyType {
    let lower = text.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["meta-analysis", "meta analysis", "metaanalysis"]) {
        StudyType::MetaAnalysis
    } else if has(&["systematic review"]) {
        StudyType::SystematicReview
    } else if has(&[
        "randomized controlled trial",
        "randomised controlled trial",
        "randomized clinical trial",
        "randomised clinical trial",
    ]) || contains_word(&lower, "rct")
    {
        StudyType::Rct
    } else if has(&["guideline", "consensus statement"]) {
        StudyType::Guideline
    } else if has(&["case-control", "case control"]) {
        StudyType::CaseControl
    } else if has(&["cohort"]) {
        StudyType::Cohort
    } else if has(&["cross-sectional", "cross sectional"]) {
        StudyType::CrossSectional
    } else if has(&["case report"]) {
        StudyType::CaseReport
    } else if contains_word(&lower, "review") {
        StudyType::Review
    } else {
        StudyType::Other
    }
}
