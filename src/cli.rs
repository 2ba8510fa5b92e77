use std::ffi::OsString;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use nonzero_ext::nonzero;

use crate::layers::artifact::DEFAULT_RESULTS_FILE;
use crate::layers::discovery::DEFAULT_ARXIV_API;
use crate::layers::pipeline::PipelineConfig;
use crate::layers::scoring::RetryPolicy;
use crate::layers::validation::RawRequest;

/// Rank today's arXiv papers against your research interests.
///
/// Results are written as a JSON array to the output file. Exit codes:
/// 0 success (possibly with zero results), 2 invalid input, 3 arXiv
/// unavailable, 4 API key rejected, 5 results could not be written.
#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// Topic, e.g. "Computer Science"
    pub topic: String,

    /// Comma-separated subjects of the topic, e.g. "Machine Learning,Robotics"
    pub subjects: String,

    /// Free-text description of what you want to read about
    #[arg(allow_hyphen_values = true)]
    pub interests: String,

    /// Maximum number of papers to return
    #[arg(allow_hyphen_values = true)]
    pub max_results: String,

    /// API key for the language-model endpoint
    #[arg(hide = true)]
    pub api_key: String,

    /// Where the results file is written
    #[arg(long, env = "ARXIV_READER_OUTPUT", default_value = DEFAULT_RESULTS_FILE)]
    pub output: PathBuf,

    #[arg(long, env = "ARXIV_API_URL", default_value = DEFAULT_ARXIV_API)]
    pub arxiv_url: url::Url,

    /// OpenAI-compatible base URL; chosen from the API key when unset
    #[arg(long, env = "LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    #[arg(long, env = "LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Candidates fetched per requested result
    #[arg(long, env = "OVERSAMPLE_FACTOR", default_value_t = 4)]
    pub oversample: usize,

    #[arg(long, env = "MAX_CANDIDATES", default_value_t = 60)]
    pub max_candidates: usize,

    /// Model calls in flight at once
    #[arg(long, env = "SCORE_CONCURRENCY", default_value_t = 4,
          value_parser = clap::value_parser!(u16).range(1..=32))]
    pub concurrency: u16,

    #[arg(long, env = "SCORE_MAX_ATTEMPTS", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_attempts: u32,

    #[arg(long, env = "SCORE_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,

    #[arg(long, env = "LLM_REQUESTS_PER_MINUTE", default_value_t = nonzero!(60u32))]
    pub requests_per_minute: NonZeroU32,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Drop papers scoring below this
    #[arg(long, env = "MIN_SCORE", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=10))]
    pub min_score: u8,
}

impl Cli {
    pub fn raw_request(&self) -> RawRequest<'_> {
        RawRequest {
            topic: &self.topic,
            subjects: &self.subjects,
            interests: &self.interests,
            max_results: &self.max_results,
            credential: &self.api_key,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            oversample_factor: self.oversample.max(1),
            max_candidates: self.max_candidates.max(1),
            concurrency: usize::from(self.concurrency),
            min_score: self.min_score,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Results path for an invocation clap rejected: an `--output` flag if one is
/// present, then `ARXIV_READER_OUTPUT`, then the default.
pub fn fallback_output(args: &[OsString], env_output: Option<OsString>) -> PathBuf {
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        let arg = arg.to_string_lossy();
        if arg == "--" {
            break;
        }
        if arg == "--output" {
            if let Some(value) = rest.next() {
                return PathBuf::from(value);
            }
        } else if let Some(value) = arg.strip_prefix("--output=") {
            return PathBuf::from(value);
        }
    }
    env_output
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_FILE))
}
