//! Parsing of free-form language-model replies into a score and a justification.
//!
//! Accepted shapes, tried in order:
//!
//! 1. A JSON object anywhere in the reply (possibly inside a markdown fence)
//!    with a score key such as `relevancy_score` or `"Relevancy score"` and an
//!    optional reasons key.
//! 2. Labelled lines, e.g. `Score: 7`, `**Relevancy score**: 7/10`,
//!    followed by `Reasons: ...`.
//! 3. A reply that is nothing but the number.
//!
//! Anything else is rejected. A score that is not an integer, lies outside
//! `0..=MAX_SCORE`, uses a scale other than `/10`, carries a second number,
//! or disagrees with another score in the same reply is an error, never a
//! guess.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_SCORE: u8 = 10;
pub const MISSING_REASONS: &str = "No justification provided.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub score: u8,
    pub reasons: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("reply contains no score")]
    MissingScore,
    #[error("score '{0}' is not an integer")]
    NotAnInteger(String),
    #[error("score {0} is outside 0..=10")]
    OutOfRange(i64),
    #[error("score uses an unsupported scale '/{0}'")]
    UnsupportedScale(String),
    #[error("score '{0}' holds more than one number")]
    Ambiguous(String),
    #[error("reply contains conflicting scores {0} and {1}")]
    Conflicting(u8, u8),
}

/// One number, an optional `/N` or `out of N` scale, then prose without digits.
fn score_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?P<num>[+-]?\d+(?:\.\d+)?)(?:\s*(?:/|out\s+of)\s*(?P<den>\d+(?:\.\d+)?))?(?P<rest>.*)$")
            .expect("valid score value regex")
    })
}

fn score_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:relevancy[\s_]+|relevance[\s_]+)?score\s*(?::|=|-|–)\s*(?P<value>.+)$")
            .expect("valid score label regex")
    })
}

fn reasons_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:reasons?(?:[\s_]+for[\s_]+(?:the[\s_]+)?match)?|justification|explanation)\s*(?::|=|-|–)\s*(?P<text>.*)$")
            .expect("valid reasons label regex")
    })
}

pub fn parse_verdict(reply: &str) -> Result<Verdict, ParseError> {
    if let Some(verdict) = parse_json_object(reply) {
        return verdict;
    }
    parse_labelled(reply)
}

/// Interpret the text after a score label: `7`, `7/10`, `8 out of 10`,
/// `8 (strong match)`, `9.0`. Ranges such as `7-8` are rejected.
fn parse_score_value(value: &str) -> Result<u8, ParseError> {
    let caps = score_value_re()
        .captures(value)
        .ok_or_else(|| ParseError::NotAnInteger(value.trim().to_string()))?;
    let num = &caps["num"];

    if let Some(den) = caps.name("den") {
        if den.as_str() != "10" {
            return Err(ParseError::UnsupportedScale(den.as_str().to_string()));
        }
    }
    if caps["rest"].chars().any(|c| c.is_ascii_digit()) {
        return Err(ParseError::Ambiguous(value.trim().to_string()));
    }

    let whole = if num.contains('.') {
        let f: f64 = num.parse().map_err(|_| ParseError::NotAnInteger(num.to_string()))?;
        if f.fract() != 0.0 {
            return Err(ParseError::NotAnInteger(num.to_string()));
        }
        f as i64
    } else {
        num.parse::<i64>().map_err(|_| ParseError::NotAnInteger(num.to_string()))?
    };

    check_range(whole)
}

fn check_range(score: i64) -> Result<u8, ParseError> {
    match u8::try_from(score) {
        Ok(s) if s <= MAX_SCORE => Ok(s),
        _ => Err(ParseError::OutOfRange(score)),
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn reasons_or_placeholder(text: &str) -> String {
    let text = normalize_ws(text);
    if text.is_empty() {
        MISSING_REASONS.to_string()
    } else {
        text
    }
}

/// `None` when the reply holds no JSON object with a score key.
fn parse_json_object(reply: &str) -> Option<Result<Verdict, ParseError>> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    let object: Map<String, Value> = serde_json::from_str(&reply[start..=end]).ok()?;

    let mut scores = Vec::new();
    let mut reasons = None;
    for (key, value) in &object {
        match normalize_key(key).as_str() {
            "relevancyscore" | "relevancescore" | "score" | "relevancy" => scores.push(value),
            "reasonsformatch" | "reasons" | "reason" | "justification" | "explanation" => reasons = Some(value),
            _ => {}
        }
    }
    if scores.is_empty() {
        return None;
    }

    let mut score = None;
    for value in scores {
        let next = match json_score(value) {
            Ok(next) => next,
            Err(e) => return Some(Err(e)),
        };
        match score {
            Some(prev) if prev != next => return Some(Err(ParseError::Conflicting(prev, next))),
            _ => score = Some(next),
        }
    }
    let score = score?;

    let reasons = match reasons {
        Some(Value::String(s)) => reasons_or_placeholder(s),
        Some(Value::Array(items)) => reasons_or_placeholder(
            &items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => MISSING_REASONS.to_string(),
    };

    Some(Ok(Verdict { score, reasons }))
}

fn json_score(value: &Value) -> Result<u8, ParseError> {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => check_range(i),
            (None, Some(f)) if f.fract() == 0.0 => check_range(f as i64),
            _ => Err(ParseError::NotAnInteger(n.to_string())),
        },
        Value::String(s) => parse_score_value(s),
        other => Err(ParseError::NotAnInteger(other.to_string())),
    }
}

/// Strip heading marks, quotes, bullets and list numbering from a line.
fn clean_line(line: &str) -> &str {
    let line = line.trim().trim_start_matches(['#', '>', '-', '•', ' ']);
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    let line = if digits > 0 && line[digits..].starts_with(". ") {
        &line[digits + 2..]
    } else {
        line
    };
    line.trim()
}

fn parse_labelled(reply: &str) -> Result<Verdict, ParseError> {
    let lines: Vec<String> = reply
        .lines()
        .map(|l| clean_line(&l.replace(['*', '`'], "")).to_string())
        .collect();

    let mut score: Option<u8> = None;
    let mut reasons: Option<String> = None;
    let mut idx = 0;
    while idx < lines.len() {
        let line = &lines[idx];
        if let Some(caps) = score_label_re().captures(line) {
            let value = parse_score_value(&caps["value"])?;
            match score {
                Some(prev) if prev != value => return Err(ParseError::Conflicting(prev, value)),
                _ => score = Some(value),
            }
        } else if let Some(caps) = reasons_label_re().captures(line) {
            let mut text = caps["text"].to_string();
            // Justification may run over several lines until the next label.
            while idx + 1 < lines.len()
                && !score_label_re().is_match(&lines[idx + 1])
                && !reasons_label_re().is_match(&lines[idx + 1])
            {
                idx += 1;
                text.push(' ');
                text.push_str(&lines[idx]);
            }
            if reasons.is_none() {
                reasons = Some(text);
            }
        }
        idx += 1;
    }

    let score = match score {
        Some(s) => s,
        None => {
            let bare = reply.trim().trim_matches(['*', '`']).trim();
            if !bare.is_empty() && bare.chars().all(|c| c.is_ascii_digit() || matches!(c, '/' | '.' | '-' | '+' | ' ')) {
                parse_score_value(bare)?
            } else {
                return Err(ParseError::MissingScore);
            }
        }
    };

    Ok(Verdict {
        score,
        reasons: reasons.as_deref().map_or_else(|| MISSING_REASONS.to_string(), reasons_or_placeholder),
    })
}
