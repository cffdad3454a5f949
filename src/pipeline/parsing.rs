//! Section extraction from free-form model output.
//!
//! The prompts ask the model for `LABEL: content` sections, but nothing
//! guarantees it complies. Every function here is total: malformed input
//! yields the documented fallback, never an error.
//!
//! A section starts at a line whose label (optionally wrapped in Markdown
//! `#`/`**` decoration) is followed by a colon, and runs until the next such
//! line or the end of the text. Labels embedded mid-sentence never start a
//! section.

use std::sync::LazyLock;

use regex::Regex;

use super::types::{clamp_confidence, Severity, Urgency};

/// Confidence used when no usable confidence marker is present.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Any line that looks like a section header: up to six words, then a colon.
static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:#{1,6}[ \t]*)?(?:\*\*|__)?[ \t]*[A-Za-z][A-Za-z0-9'&/()\-]*(?:[ \t]+[A-Za-z0-9'&/()\-]+){0,5}[ \t]*(?:\*\*|__)?[ \t]*:",
    )
    .expect("valid regex")
});

/// Bullet (`-`, `*`, `•`, `+`) or number (`1.`, `2)`, `(3)`) list markers.
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•+]+|\(?\d{1,3}[.)])\s*").expect("valid regex"));

/// Confidence marker immediately followed by a number or a qualitative level.
static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bconfidence(?:[ \t]+(?:score|level|rating))?[ \t]*(?:\*\*|__)?[ \t]*(?:[:=\-][ \t]*|[ \t]+(?:is|of)[ \t]+)?(?:\*\*|__)?[ \t]*(?:(?P<num>\d+(?:\.\d+)?|\.\d+)[ \t]*(?P<pct>%|percent)?|(?P<word>very[ \t]+high|high|moderate|medium|very[ \t]+low|low)\b)",
    )
    .expect("valid regex")
});

static URGENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(non[- ]?urgent|not[ \t]+urgent|emergent|emergency|urgent|routine)\b")
        .expect("valid regex")
});

static SEVERITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(mild(?:ly)?|moderate(?:ly)?|severe(?:ly)?|serious|critical)\b")
        .expect("valid regex")
});

static UNUSED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

static THOUGHT_OPENER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>thought\r?\n").expect("valid regex"));

// ──────────────────────────────────────────────
// Output cleanup
// ──────────────────────────────────────────────

/// Strip MedGemma artifacts before parsing.
///
/// A `<unusedN>thought` block runs until the next `<unusedM>` token and is
/// dropped along with it; without a closing token everything after the
/// opener is kept. When nothing but whitespace follows the closing token the
/// block itself is kept, since the model put its answer inside it. Stray
/// `<unusedN>` tokens are removed.
pub fn clean_model_output(raw: &str) -> String {
    let text = match THOUGHT_OPENER_RE.find(raw) {
        None => raw,
        Some(opener) => {
            let rest = &raw[opener.end()..];
            match UNUSED_TOKEN_RE.find(rest) {
                Some(closer) if !rest[closer.end()..].trim().is_empty() => &rest[closer.end()..],
                Some(closer) => &rest[..closer.start()],
                None => rest,
            }
        }
    };

    UNUSED_TOKEN_RE.replace_all(text, "").trim().to_string()
}

// ──────────────────────────────────────────────
// Sections
// ──────────────────────────────────────────────

/// Build the anchored matcher for one header label.
fn header_regex(header: &str) -> Option<Regex> {
    let words: Vec<String> = header.split_whitespace().map(regex::escape).collect();
    if words.is_empty() {
        return None;
    }
    let label = words.join(r"[ \t]+");
    Regex::new(&format!(
        r"(?im)^[ \t]*(?:#{{1,6}}[ \t]*)?(?:\*\*|__)?[ \t]*{label}[ \t]*(?:\*\*|__)?[ \t]*:[ \t]*(?:\*\*|__)?"
    ))
    .ok()
}

/// Byte offset of the header and the trimmed section body.
fn locate_section(text: &str, header: &str) -> Option<(usize, String)> {
    let re = header_regex(header)?;
    let start = re.find(text)?;
    let rest = &text[start.end()..];

    // The remainder of the header line always belongs to the body.
    let body_end = match rest.find('\n') {
        None => rest.len(),
        Some(newline) => {
            let following = &rest[newline + 1..];
            match HEADER_LINE.find(following) {
                Some(next) => newline + 1 + next.start(),
                None => rest.len(),
            }
        }
    };

    Some((start.start(), rest[..body_end].trim().to_string()))
}

/// Text of the first section labelled `header` (case-insensitive).
///
/// `None` when the header is absent; `Some("")` when it is present with
/// an empty body.
pub fn extract_section(text: &str, header: &str) -> Option<String> {
    locate_section(text, header).map(|(_, body)| body)
}

/// Like [`extract_section`], over an ordered synonym list (longest first).
///
/// The section appearing earliest in the text wins; on a tie the synonym
/// listed first wins.
pub fn extract_field(text: &str, synonyms: &[&str]) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for synonym in synonyms {
        if let Some((pos, body)) = locate_section(text, synonym) {
            if best.as_ref().map_or(true, |(best_pos, _)| pos < *best_pos) {
                best = Some((pos, body));
            }
        }
    }
    best.map(|(_, body)| body)
}

/// Split a section body into list items.
///
/// Multi-line bodies yield one item per non-empty line with bullet or number
/// markers removed. A single line of questions is split after each `?`;
/// any other single line is split on commas and semicolons.
pub fn split_list_items(body: &str) -> Vec<String> {
    let lines: Vec<&str> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let raw_items: Vec<&str> = match lines.as_slice() {
        [] => return Vec::new(),
        [single] if single.contains('?') => single.split_inclusive('?').collect(),
        [single] => single.split([',', ';']).collect(),
        many => many.to_vec(),
    };

    raw_items
        .into_iter()
        .map(clean_list_item)
        .filter(|item| !item.is_empty())
        .collect()
}

fn clean_list_item(item: &str) -> String {
    let item = item.trim().trim_start_matches([',', ';']);
    let stripped = LIST_MARKER.replace(item, "");
    stripped
        .trim()
        .trim_end_matches([',', ';'])
        .trim()
        .to_string()
}

/// Items of the first section labelled `header`; empty when absent or empty.
pub fn extract_list(text: &str, header: &str) -> Vec<String> {
    extract_section(text, header)
        .map(|body| split_list_items(&body))
        .unwrap_or_default()
}

/// Items of the earliest section matched by any synonym.
pub fn extract_list_field(text: &str, synonyms: &[&str]) -> Vec<String> {
    extract_field(text, synonyms)
        .map(|body| split_list_items(&body))
        .unwrap_or_default()
}

// ──────────────────────────────────────────────
// Scalars
// ──────────────────────────────────────────────

/// Confidence score in [0, 1].
///
/// Looks for the word "confidence" (optionally "score"/"level"/"rating")
/// directly followed by a number or a qualitative level. Numbers above 1 are
/// read as percentages. Returns [`DEFAULT_CONFIDENCE`] when no marker is found.
pub fn parse_confidence(text: &str) -> f32 {
    let Some(caps) = CONFIDENCE_RE.captures(text) else {
        return DEFAULT_CONFIDENCE;
    };

    if let Some(num) = caps.name("num") {
        let Ok(value) = num.as_str().parse::<f32>() else {
            return DEFAULT_CONFIDENCE;
        };
        let percent = caps.name("pct").is_some() || value > 1.0;
        let value = if percent { value / 100.0 } else { value };
        return clamp_confidence(value);
    }

    match caps.name("word").map(|w| {
        w.as_str()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }) {
        Some(word) => match word.as_str() {
            "very high" => 0.95,
            "high" => 0.9,
            "moderate" | "medium" => 0.7,
            "low" => 0.4,
            "very low" => 0.2,
            _ => DEFAULT_CONFIDENCE,
        },
        None => DEFAULT_CONFIDENCE,
    }
}

/// Urgency keyword in the text; the most urgent level mentioned wins.
///
/// "non-urgent" and "not urgent" read as routine, "emergency" as emergent.
pub fn parse_urgency(text: &str) -> Urgency {
    URGENCY_RE
        .find_iter(text)
        .map(|m| {
            let word = m.as_str().to_lowercase();
            if word.starts_with("non") || word.starts_with("not") || word == "routine" {
                Urgency::Routine
            } else if word == "urgent" {
                Urgency::Urgent
            } else {
                Urgency::Emergent
            }
        })
        .max_by_key(urgency_rank)
        .unwrap_or(Urgency::Unknown)
}

fn urgency_rank(urgency: &Urgency) -> u8 {
    match urgency {
        Urgency::Unknown => 0,
        Urgency::Routine => 1,
        Urgency::Urgent => 2,
        Urgency::Emergent => 3,
    }
}

/// Severity keyword in the text; the most severe level mentioned wins.
pub fn parse_severity(text: &str) -> Severity {
    SEVERITY_RE
        .find_iter(text)
        .map(|m| {
            let word = m.as_str().to_lowercase();
            if word.starts_with("mild") {
                Severity::Mild
            } else if word.starts_with("moderate") {
                Severity::Moderate
            } else {
                Severity::Severe
            }
        })
        .max_by_key(severity_rank)
        .unwrap_or(Severity::Unknown)
}

fn severity_rank(severity: &Severity) -> u8 {
    match severity {
        Severity::Unknown => 0,
        Severity::Mild => 1,
        Severity::Moderate => 2,
        Severity::Severe => 3,
    }
}
