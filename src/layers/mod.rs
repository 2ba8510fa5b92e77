use chrono::{DateTime, Utc};

use crate::layers::taxonomy::{Subject, Topic};

/// A paper as fetched from the source, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperCandidate {
    pub identifier: String,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: String,
    /// arXiv category codes tagged on the paper, primary first.
    pub categories: Vec<String>,
    pub url: String,
    pub pdf_url: String,
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPaper {
    pub paper: PaperCandidate,
    pub relevancy_score: u8,
    pub reasons_for_match: String,
}

/// Ordered best-first, never longer than the requested budget.
pub type ResultSet = Vec<ScoredPaper>;

pub struct CandidateQuery {
    pub topic: &'static Topic,
    /// Empty when the topic has no sub-subjects and the whole archive is searched.
    pub subjects: Vec<&'static Subject>,
    pub limit: usize,
}

impl CandidateQuery {
    pub fn accepts_category(&self, code: &str) -> bool {
        if self.subjects.is_empty() {
            self.topic.owns_category(code)
        } else {
            self.subjects.iter().any(|s| s.code == code)
        }
    }
}

pub mod artifact;
#[cfg(test)]
pub(crate) mod canned_http;
pub mod discovery;
pub mod pipeline;
pub mod ranking;
pub mod response;
pub mod scoring;
pub mod taxonomy;
pub mod validation;
