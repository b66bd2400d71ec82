//! Parsing of the model's `{"answer_markdown", "citations"}` reply.
//!
//! Both answer modes go through [`parse_answer`]. Output that is not the
//! expected JSON object is cleaned with [`normalize_fallback_text`] and kept
//! as the answer text.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerFormat {
    Structured,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedAnswer {
    pub answer_markdown: String,
    pub citations: Vec<String>,
    pub format: AnswerFormat,
}

#[derive(Debug, Deserialize)]
struct WireAnswer {
    answer_markdown: String,
    #[serde(default)]
    citations: Vec<String>,
}

impl ParsedAnswer {
    /// Answer text followed by the joined citation markers, unless the text already ends with them.
    pub fn render_markdown(&self) -> String {
        let citations = self.citations.concat();
        if citations.is_empty() || self.answer_markdown.contains(&citations) {
            self.answer_markdown.clone()
        } else {
            format!("{}\n\n{}", self.answer_markdown, citations)
        }
    }
}

pub fn parse_answer(raw: &str) -> ParsedAnswer {
    let trimmed = raw.trim();
    let candidates = [
        Some(trimmed),
        strip_code_fence(trimmed),
        outermost_object(trimmed),
    ];

    for candidate in candidates.into_iter().flatten() {
        if let Ok(wire) = serde_json::from_str::<WireAnswer>(candidate) {
            return ParsedAnswer {
                answer_markdown: wire.answer_markdown.trim().to_string(),
                citations: wire.citations,
                format: AnswerFormat::Structured,
            };
        }
    }

    let text = normalize_fallback_text(raw);
    let citations = citation_markers(&text);
    ParsedAnswer {
        answer_markdown: text,
        citations,
        format: AnswerFormat::Fallback,
    }
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let body = text.strip_prefix("```")?;
    let body = body.split_once('\n').map(|(_, rest)| rest)?;
    Some(body.trim_end().strip_suffix("```")?.trim())
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Best-effort cleanup for generation output that is not the expected JSON.
///
/// Unifies line endings, collapses runs of spaces and blank lines, removes
/// spaces before punctuation, tightens `[ 1 ]` to `[1]`, drops the spaces
/// around `/` and `-` when both sides of it on the same line are non-blank,
/// and re-joins spaced-out capitals (`C W P` -> `CWP`).
/// A `-` opening a line keeps its space so markdown bullets survive.
pub fn normalize_fallback_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    apply_fallback_rules(text).unwrap_or_else(|_| text.trim().to_string())
}

fn apply_fallback_rules(text: &str) -> Result<String, regex::Error> {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = Regex::new(r"[ \t]+")?.replace_all(&text, " ");
    let text = Regex::new(r"\n{3,}")?.replace_all(&text, "\n\n");
    let text = Regex::new(r" +([,.;:!?])")?.replace_all(&text, "$1");
    let text = Regex::new(r"\[\s*(\d+)\s*\]")?.replace_all(&text, "[$1]");
    let text = Regex::new(r"(\S)[ \t]*([/-])[ \t]*(\S)")?.replace_all(&text, "$1$2$3");
    let text = Regex::new(r"\b(?:[A-Z][ \t]+)+[A-Z]\b")?
        .replace_all(&text, |caps: &regex::Captures| caps[0].replace(&[' ', '\t'][..], ""));

    Ok(text.trim().to_string())
}

fn citation_markers(text: &str) -> Vec<String> {
    Regex::new(r"\[\d+\]")
        .map(|re| re.find_iter(text).map(|marker| marker.as_str().to_string()).collect())
        .unwrap_or_default()
}
