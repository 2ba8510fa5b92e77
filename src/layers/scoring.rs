use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::layers::response::{parse_verdict, ParseError, MAX_SCORE};
use crate::layers::validation::{Credential, DigestRequest};
use crate::layers::{PaperCandidate, ScoredPaper};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-4o-mini";
pub const SAMBANOVA_BASE_URL: &str = "https://api.sambanova.ai/v1";
pub const SAMBANOVA_MODEL: &str = "Meta-Llama-3.1-405B-Instruct";

const TEMPERATURE: f32 = 0.4;
const TOP_P: f32 = 1.0;
const MAX_TOKENS: u32 = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by the endpoint")]
    RateLimited,
    #[error("credential rejected (HTTP {0})")]
    Unauthorized(u16),
    #[error("endpoint error (HTTP {0})")]
    Server(u16),
    #[error("request refused (HTTP {status}): {body}")]
    Client { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("endpoint returned an empty reply")]
    EmptyReply,
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Server(_) | Self::Transport(_)
        )
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;

    fn model_name(&self) -> &str;
}

/// Which OpenAI-compatible endpoint and model to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub model: String,
}

impl Endpoint {
    /// Explicit settings win; otherwise OpenAI-style `sk-` keys go to OpenAI
    /// and anything else to SambaNova.
    pub fn resolve(credential: &Credential, base_url: Option<String>, model: Option<String>) -> Self {
        let openai = credential.expose().starts_with("sk-");
        let (default_base, default_model) = if openai {
            (OPENAI_BASE_URL, OPENAI_MODEL)
        } else {
            (SAMBANOVA_BASE_URL, SAMBANOVA_MODEL)
        };
        Self {
            base_url: base_url.unwrap_or_else(|| default_base.to_string()),
            model: model.unwrap_or_else(|| default_model.to_string()),
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionClient {
    client: Client,
    endpoint: Endpoint,
    credential: Credential,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ChatCompletionClient {
    pub fn new(
        endpoint: Endpoint,
        credential: Credential,
        requests_per_minute: NonZeroU32,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint,
            credential,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(requests_per_minute))),
        })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.limiter.until_ready().await;

        let body = serde_json::json!({
            "model": self.endpoint.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": TEMPERATURE,
            "top_p": TOP_P,
            "n": 1,
            "max_tokens": MAX_TOKENS,
        });
        let resp = self
            .client
            .post(self.endpoint.completions_url())
            .bearer_auth(self.credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(CompletionError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Unauthorized(status.as_u16()),
                StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited,
                s if s.is_server_error() => CompletionError::Server(s.as_u16()),
                s => {
                    let txt = resp.text().await.unwrap_or_default();
                    let body = if txt.len() > 200 {
                        format!("{}…", txt.chars().take(200).collect::<String>())
                    } else {
                        txt
                    };
                    CompletionError::Client { status: s.as_u16(), body }
                }
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(CompletionError::from_reqwest)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(CompletionError::EmptyReply)
    }

    fn model_name(&self) -> &str {
        &self.endpoint.model
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug, Error)]
pub enum ScoreFailure {
    #[error("credential rejected by the language-model endpoint")]
    CredentialRejected,

    #[error("endpoint failed after {attempts} attempt(s): {source}")]
    Endpoint {
        attempts: u32,
        #[source]
        source: CompletionError,
    },

    #[error("unusable model reply: {0}")]
    Unparseable(#[from] ParseError),
}

/// Scores candidates against one reader's interests.
pub struct RelevancyScorer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    topic: &'static str,
    subjects: String,
    interests: String,
}

impl RelevancyScorer {
    pub fn new(model: Arc<dyn LanguageModel>, request: &DigestRequest, retry: RetryPolicy) -> Self {
        let subjects = if request.subjects.is_empty() {
            request.topic.name.to_string()
        } else {
            request.subjects.iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
        };
        Self {
            model,
            retry,
            topic: request.topic.name,
            subjects,
            interests: request.interests.clone(),
        }
    }

    pub fn prompt_for(&self, paper: &PaperCandidate) -> String {
        let interests = if self.interests.is_empty() {
            "(none given; judge relevance to the subjects above)"
        } else {
            self.interests.as_str()
        };
        format!(
            "You are a research assistant ranking new arXiv papers for a reader.\n\n\
             Reader profile:\n\
             Topic: {topic}\n\
             Subjects: {subjects}\n\
             Interests: {interests}\n\n\
             Paper:\n\
             Title: {title}\n\
             Authors: {authors}\n\
             Abstract: {abstract_text}\n\n\
             Rate how relevant this paper is to the reader's interests on an integer scale \
             from 0 (unrelated) to {max} (must read), and justify the rating in one or two sentences.\n\
             Reply with exactly two lines and nothing else:\n\
             Score: <integer from 0 to {max}>\n\
             Reasons: <justification>",
            topic = self.topic,
            subjects = self.subjects,
            title = paper.title,
            authors = paper.authors.join(", "),
            abstract_text = paper.abstract_text,
            max = MAX_SCORE,
        )
    }

    async fn complete_with_retry(&self, prompt: &str, identifier: &str) -> Result<String, ScoreFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.model.complete(prompt).await {
                Ok(reply) => return Ok(reply),
                Err(CompletionError::Unauthorized(_)) => return Err(ScoreFailure::CredentialRejected),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        "Scoring {} failed ({}), retrying ({}/{}) in {:?}",
                        identifier,
                        e,
                        attempt,
                        self.retry.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => return Err(ScoreFailure::Endpoint { attempts: attempt, source }),
            }
        }
    }

    pub async fn score(&self, paper: PaperCandidate) -> Result<ScoredPaper, ScoreFailure> {
        let prompt = self.prompt_for(&paper);
        let reply = self.complete_with_retry(&prompt, &paper.identifier).await?;
        let verdict = parse_verdict(&reply).inspect_err(|e| {
            tracing::warn!("Unparseable reply for {}: {} (reply: {:?})", paper.identifier, e, reply);
        })?;
        tracing::debug!("Scored {} = {}", paper.identifier, verdict.score);
        Ok(ScoredPaper {
            paper,
            relevancy_score: verdict.score,
            reasons_for_match: verdict.reasons,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::canned_http::CannedServer;
    use crate::layers::validation::{validate_request, RawRequest};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies in order and records every prompt.
    pub(crate) struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, CompletionError>>>,
        pub(crate) prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(replies: Vec<Result<String, CompletionError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CompletionError::EmptyReply))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    pub(crate) fn create_request(interests: &str) -> DigestRequest {
        validate_request(&RawRequest {
            topic: "Computer Science",
            subjects: "Machine Learning",
            interests,
            max_results: "5",
            credential: "sk-test",
        })
        .unwrap()
    }

    pub(crate) fn create_paper(id: &str, title: &str) -> PaperCandidate {
        PaperCandidate {
            identifier: id.to_string(),
            title: title.to_string(),
            authors: vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()],
            abstract_text: format!("Abstract of {title}."),
            categories: vec!["cs.LG".to_string()],
            url: format!("https://arxiv.org/abs/{id}"),
            pdf_url: format!("https://arxiv.org/pdf/{id}"),
            published: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn scorer(model: Arc<ScriptedModel>) -> RelevancyScorer {
        RelevancyScorer::new(model, &create_request("sparse attention mechanisms"), fast_retry())
    }

    #[test]
    fn test_prompt_embeds_profile_and_paper() {
        let scorer = scorer(Arc::new(ScriptedModel::new(vec![])));
        let prompt = scorer.prompt_for(&create_paper("2401.1", "Linear Transformers"));
        assert!(prompt.contains("Topic: Computer Science"));
        assert!(prompt.contains("Subjects: Machine Learning"));
        assert!(prompt.contains("Interests: sparse attention mechanisms"));
        assert!(prompt.contains("Title: Linear Transformers"));
        assert!(prompt.contains("Authors: Ada Lovelace, Alan Turing"));
        assert!(prompt.contains("Abstract: Abstract of Linear Transformers."));
        assert!(prompt.contains("Score: <integer from 0 to 10>"));
        // Deterministic for the same input.
        assert_eq!(prompt, scorer.prompt_for(&create_paper("2401.1", "Linear Transformers")));
    }

    #[test]
    fn test_prompt_with_empty_interests() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let scorer = RelevancyScorer::new(model, &create_request(""), fast_retry());
        let prompt = scorer.prompt_for(&create_paper("2401.1", "T"));
        assert!(prompt.contains("Interests: (none given"));
    }

    #[tokio::test]
    async fn test_score_success() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("Score: 9\nReasons: On point.".into())]));
        let scored = scorer(model).score(create_paper("2401.1", "T")).await.unwrap();
        assert_eq!(scored.relevancy_score, 9);
        assert_eq!(scored.reasons_for_match, "On point.");
        assert_eq!(scored.paper.identifier, "2401.1");
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(CompletionError::RateLimited),
            Err(CompletionError::Timeout),
            Ok("Score: 4".into()),
        ]));
        let scored = scorer(model.clone()).score(create_paper("2401.1", "T")).await.unwrap();
        assert_eq!(scored.relevancy_score, 4);
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(CompletionError::Server(503)),
            Err(CompletionError::Server(503)),
            Err(CompletionError::Server(503)),
            Ok("Score: 4".into()),
        ]));
        let err = scorer(model.clone()).score(create_paper("2401.1", "T")).await.unwrap_err();
        assert!(matches!(err, ScoreFailure::Endpoint { attempts: 3, .. }));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let model = Arc::new(ScriptedModel::new(vec![Err(CompletionError::Client {
            status: 400,
            body: "bad model".into(),
        })]));
        let err = scorer(model.clone()).score(create_paper("2401.1", "T")).await.unwrap_err();
        assert!(matches!(err, ScoreFailure::Endpoint { attempts: 1, .. }));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal_and_not_retried() {
        let model = Arc::new(ScriptedModel::new(vec![Err(CompletionError::Unauthorized(401))]));
        let err = scorer(model.clone()).score(create_paper("2401.1", "T")).await.unwrap_err();
        assert!(matches!(err, ScoreFailure::CredentialRejected));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_a_failure_not_zero() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("I really liked it!".into())]));
        let err = scorer(model.clone()).score(create_paper("2401.1", "T")).await.unwrap_err();
        assert!(matches!(err, ScoreFailure::Unparseable(ParseError::MissingScore)));
        assert_eq!(model.calls(), 1);
    }

    #[test]
    fn test_endpoint_resolution() {
        let openai = Credential::new("sk-abc").unwrap();
        let other = Credential::new("0123-sambanova").unwrap();
        assert_eq!(Endpoint::resolve(&openai, None, None).base_url, OPENAI_BASE_URL);
        assert_eq!(Endpoint::resolve(&other, None, None).model, SAMBANOVA_MODEL);

        let custom = Endpoint::resolve(&openai, Some("http://localhost:8080/v1/".into()), Some("local".into()));
        assert_eq!(custom.completions_url(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(custom.model, "local");
    }

    #[tokio::test]
    async fn test_http_statuses_map_to_completion_errors() {
        let ok = r#"{"choices":[{"message":{"role":"assistant","content":"Score: 7\nReasons: Close."}}]}"#;
        let server = CannedServer::start(vec![
            (200, ok.to_string()),
            (401, String::new()),
            (403, String::new()),
            (429, String::new()),
            (503, String::new()),
            (400, "unknown model".to_string()),
            (200, r#"{"choices":[]}"#.to_string()),
            (200, r#"{"choices":[{"message":{"content":"  "}}]}"#.to_string()),
        ])
        .await;
        let endpoint = Endpoint::resolve(
            &Credential::new("sk-test").unwrap(),
            Some(format!("{}/v1", server.base_url)),
            Some("test-model".into()),
        );
        let client = ChatCompletionClient::new(
            endpoint,
            Credential::new("sk-test").unwrap(),
            nonzero_ext::nonzero!(600u32),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(client.complete("p").await.unwrap(), "Score: 7\nReasons: Close.");
        assert_eq!(client.complete("p").await, Err(CompletionError::Unauthorized(401)));
        assert_eq!(client.complete("p").await, Err(CompletionError::Unauthorized(403)));
        assert_eq!(client.complete("p").await, Err(CompletionError::RateLimited));
        assert_eq!(client.complete("p").await, Err(CompletionError::Server(503)));
        assert_eq!(
            client.complete("p").await,
            Err(CompletionError::Client {
                status: 400,
                body: "unknown model".into()
            })
        );
        assert_eq!(client.complete("p").await, Err(CompletionError::EmptyReply));
        assert_eq!(client.complete("p").await, Err(CompletionError::EmptyReply));
        assert_eq!(server.hits(), 8);
        assert_eq!(client.model_name(), "test-model");
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
    }
}
