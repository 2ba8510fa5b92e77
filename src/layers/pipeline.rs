use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{stream, StreamExt};
use thiserror::Error;

use crate::layers::discovery::{CandidateSource, SourceError};
use crate::layers::ranking::assemble;
use crate::layers::scoring::{LanguageModel, RelevancyScorer, RetryPolicy, ScoreFailure};
use crate::layers::validation::{DigestRequest, InvalidInput};
use crate::layers::{CandidateQuery, ResultSet};

/// Failures that abort a run. Each maps to its own process exit code.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid input")]
    InvalidInput(#[from] InvalidInput),

    #[error("paper source unavailable")]
    SourceUnavailable(#[from] SourceError),

    #[error("the language-model endpoint rejected the API key")]
    CredentialRejected,

    #[error("could not write results to {path:?}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::SourceUnavailable(_) => 3,
            Self::CredentialRejected => 4,
            Self::ArtifactWrite { .. } => 5,
        }
    }
}

const MIN_OVERSAMPLE: usize = 2;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Candidates fetched per requested result.
    pub oversample_factor: usize,
    pub max_candidates: usize,
    /// Model calls in flight at once.
    pub concurrency: usize,
    pub min_score: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            oversample_factor: 4,
            max_candidates: 60,
            concurrency: 4,
            min_score: 0,
        }
    }
}

impl PipelineConfig {
    /// Budget times the oversample factor, capped at `max_candidates`. The cap
    /// never brings the pool below twice the budget, so ranking always has
    /// more papers to choose from than it returns.
    pub fn candidate_limit(&self, budget: usize) -> usize {
        let floor = budget.saturating_mul(MIN_OVERSAMPLE);
        budget
            .saturating_mul(self.oversample_factor.max(MIN_OVERSAMPLE))
            .min(self.max_candidates)
            .max(floor)
    }
}

pub struct Pipeline {
    source: Arc<dyn CandidateSource>,
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            model,
            retry,
            config,
        }
    }

    pub async fn run(&self, request: &DigestRequest) -> Result<ResultSet, RunError> {
        let query = CandidateQuery {
            topic: request.topic,
            subjects: request.subjects.clone(),
            limit: self.config.candidate_limit(request.budget),
        };
        tracing::info!(
            "Fetching up to {} candidates for {} from {}",
            query.limit,
            request.topic.name,
            self.source.name()
        );
        let candidates = self.source.fetch_candidates(&query).await?;
        let fetched = candidates.len();
        if fetched == 0 {
            tracing::info!("No papers matched the selected subjects");
            return Ok(Vec::new());
        }

        tracing::info!(
            "Scoring {} papers with {} ({} at a time)",
            fetched,
            self.model.model_name(),
            self.config.concurrency
        );
        let scorer = RelevancyScorer::new(self.model.clone(), request, self.retry.clone());

        // `buffered` yields in input order whatever order the calls finish in,
        // so the scored pool keeps source order for the stable sort below.
        let mut outcomes = std::pin::pin!(stream::iter(candidates)
            .map(|paper| scorer.score(paper))
            .buffered(self.config.concurrency.max(1)));

        let mut scored = Vec::with_capacity(fetched);
        let mut dropped = 0;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(paper) => scored.push(paper),
                Err(ScoreFailure::CredentialRejected) => return Err(RunError::CredentialRejected),
                Err(failure) => {
                    dropped += 1;
                    tracing::warn!("Dropping unscored paper: {}", failure);
                }
            }
        }

        let results = assemble(scored, request.budget, self.config.min_score);
        tracing::info!(
            "Fetched {}, dropped {} unscored, returning {} of at most {}",
            fetched,
            dropped,
            results.len(),
            request.budget
        );
        Ok(results)
    }
}
