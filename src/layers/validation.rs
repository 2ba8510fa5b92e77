// Checks every invocation argument before any network call is made.
use std::fmt;

use thiserror::Error;

use crate::layers::taxonomy::{lookup_topic, Subject, Subjects, Topic};

pub const SUBJECT_DELIMITER: char = ',';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidInput {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("unknown subject '{subject}' for topic '{topic}'{hint}")]
    UnknownSubject {
        topic: &'static str,
        subject: String,
        hint: String,
    },

    #[error("no subjects selected for topic '{0}'")]
    NoSubjects(&'static str),

    #[error("topic '{topic}' has no sub-subjects, got '{raw}'")]
    SubjectsNotApplicable { topic: &'static str, raw: String },

    #[error("max results must be a positive integer, got '{0}'")]
    InvalidBudget(String),

    #[error("no API key was provided")]
    MissingCredential,
}

/// Bearer token for the language-model endpoint. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: &str) -> Result<Self, InvalidInput> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(InvalidInput::MissingCredential);
        }
        Ok(Self(token.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// The five positional arguments exactly as received.
pub struct RawRequest<'a> {
    pub topic: &'a str,
    pub subjects: &'a str,
    pub interests: &'a str,
    pub max_results: &'a str,
    pub credential: &'a str,
}

#[derive(Debug, Clone)]
pub struct DigestRequest {
    pub topic: &'static Topic,
    pub subjects: Vec<&'static Subject>,
    pub interests: String,
    pub budget: usize,
    pub credential: Credential,
}

pub fn parse_subjects(topic: &'static Topic, raw: &str) -> Result<Vec<&'static Subject>, InvalidInput> {
    let fragments: Vec<&str> = raw
        .split(SUBJECT_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if topic.subjects == Subjects::Unconstrained {
        return match fragments.as_slice() {
            [] => Ok(Vec::new()),
            [only] if only.eq_ignore_ascii_case("none") => Ok(Vec::new()),
            _ => Err(InvalidInput::SubjectsNotApplicable {
                topic: topic.name,
                raw: raw.trim().to_string(),
            }),
        };
    }

    let mut subjects: Vec<&'static Subject> = Vec::new();
    for fragment in fragments {
        let subject = topic.find_subject(fragment).ok_or_else(|| InvalidInput::UnknownSubject {
            topic: topic.name,
            subject: fragment.to_string(),
            hint: topic
                .suggest(fragment)
                .map(|s| format!(" (did you mean '{s}'?)"))
                .unwrap_or_default(),
        })?;
        if !subjects.contains(&subject) {
            subjects.push(subject);
        }
    }

    if subjects.is_empty() {
        return Err(InvalidInput::NoSubjects(topic.name));
    }
    Ok(subjects)
}

pub fn parse_budget(raw: &str) -> Result<usize, InvalidInput> {
    match raw.trim().parse::<i64>() {
        Ok(n) if n > 0 => usize::try_from(n).map_err(|_| InvalidInput::InvalidBudget(raw.to_string())),
        _ => Err(InvalidInput::InvalidBudget(raw.to_string())),
    }
}

pub fn validate_request(raw: &RawRequest<'_>) -> Result<DigestRequest, InvalidInput> {
    let topic = lookup_topic(raw.topic).ok_or_else(|| InvalidInput::UnknownTopic(raw.topic.to_string()))?;
    let subjects = parse_subjects(topic, raw.subjects)?;
    let budget = parse_budget(raw.max_results)?;
    let credential = Credential::new(raw.credential)?;

    Ok(DigestRequest {
        topic,
        subjects,
        interests: raw.interests.trim().to_string(),
        budget,
        credential,
    })
}
