use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::layers::{CandidateQuery, PaperCandidate};

pub const DEFAULT_ARXIV_API: &str = "https://export.arxiv.org/api/query";

const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 6;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("arXiv is unreachable: {0}")]
    Unreachable(String),

    #[error("arXiv returned HTTP {0}")]
    Status(StatusCode),

    #[error("arXiv rejected the query: {0}")]
    Rejected(String),

    #[error("arXiv returned an unreadable feed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Candidates in the source's native order (newest submission first).
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<Vec<PaperCandidate>, SourceError>;

    fn name(&self) -> &str;
}

pub struct ArxivClient {
    client: Client,
    endpoint: Url,
    // arXiv asks API users to keep to about one request every three seconds.
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ArxivClient {
    pub fn new(endpoint: Url, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(nonzero!(20u32)))),
        })
    }

    async fn get_with_retry(&self, url: &str) -> Result<String, SourceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.until_ready().await;
            tracing::info!("Querying arXiv (attempt {}/{}): {}", attempt, MAX_ATTEMPTS, url);

            let failure = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().await.map_err(|e| SourceError::Unreachable(e.to_string()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS) {
                        return Err(SourceError::Status(status));
                    }
                    SourceError::Status(status)
                }
                Err(e) => SourceError::Unreachable(e.to_string()),
            };

            if attempt >= MAX_ATTEMPTS {
                return Err(failure);
            }
            let delay = RETRY_DELAY_MS * 2_u64.pow(attempt - 1);
            tracing::warn!("arXiv request failed ({}), retrying in {}ms", failure, delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn page_url(&self, search_query: &str, start: usize, max_results: usize) -> String {
        format!(
            "{}?search_query={}&sortBy=submittedDate&sortOrder=descending&start={}&max_results={}",
            self.endpoint,
            urlencoding::encode(search_query),
            start,
            max_results
        )
    }
}

#[async_trait]
impl CandidateSource for ArxivClient {
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<Vec<PaperCandidate>, SourceError> {
        let search_query = build_search_query(query);
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for page in 0..MAX_PAGES {
            if candidates.len() >= query.limit {
                break;
            }
            let page_size = PAGE_SIZE.min(query.limit);
            let url = self.page_url(&search_query, page * page_size, page_size);
            let body = self.get_with_retry(&url).await?;
            let entries = parse_feed(&body)?;
            let returned = entries.len();

            for paper in entries {
                if !seen.insert(paper.identifier.clone()) {
                    continue;
                }
                if paper.categories.iter().any(|c| query.accepts_category(c)) {
                    candidates.push(paper);
                } else {
                    tracing::debug!("Skipping off-topic paper {} ({:?})", paper.identifier, paper.categories);
                }
            }

            if returned < page_size {
                break;
            }
        }

        candidates.truncate(query.limit);
        tracing::info!("arXiv returned {} candidate papers for {}", candidates.len(), search_query);
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "arXiv"
    }
}

/// `cat:cs.LG OR cat:cs.CL`, or the bare archive when the topic has no sub-subjects.
pub fn build_search_query(query: &CandidateQuery) -> String {
    if query.subjects.is_empty() {
        return format!("cat:{}", query.topic.archive);
    }
    query
        .subjects
        .iter()
        .map(|s| format!("cat:{}", s.code))
        .collect::<Vec<_>>()
        .join(" OR ")
}

pub fn arxiv_abs_url(id: &str) -> String {
    format!("https://arxiv.org/abs/{}", id)
}

pub fn arxiv_pdf_url(id: &str) -> String {
    format!("https://arxiv.org/pdf/{}", id)
}

fn arxiv_id_from_url(url: &str) -> String {
    url.rfind("/abs/")
        .map(|i| url[i + "/abs/".len()..].trim_matches('/').to_string())
        .unwrap_or_else(|| url.to_string())
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn resolve_entity(name: &str) -> Option<String> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    quick_xml::escape::resolve_predefined_entity(name).map(str::to_string)
}

#[derive(Default)]
struct Entry {
    id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    categories: Vec<String>,
    pdf_url: Option<String>,
}

impl Entry {
    fn absorb_element(&mut self, e: &BytesStart<'_>) {
        match e.name().as_ref() {
            b"category" => {
                if let Some(term) = attribute(e, b"term").filter(|t| !t.trim().is_empty()) {
                    if !self.categories.contains(&term) {
                        self.categories.push(term);
                    }
                }
            }
            b"link" => {
                let is_pdf = attribute(e, b"title").as_deref() == Some("pdf")
                    || attribute(e, b"type").as_deref() == Some("application/pdf");
                if is_pdf {
                    self.pdf_url = attribute(e, b"href");
                }
            }
            _ => {}
        }
    }

    fn into_candidate(self) -> PaperCandidate {
        let identifier = arxiv_id_from_url(self.id.trim());
        let published = DateTime::parse_from_rfc3339(self.published.trim())
            .ok()
            .map(|d| d.with_timezone(&Utc));
        PaperCandidate {
            url: arxiv_abs_url(&identifier),
            pdf_url: self
                .pdf_url
                .map(|u| u.replacen("http://", "https://", 1))
                .unwrap_or_else(|| arxiv_pdf_url(&identifier)),
            title: normalize_ws(&self.title),
            authors: self.authors.iter().map(|a| normalize_ws(a)).collect(),
            abstract_text: normalize_ws(&self.summary),
            categories: self.categories,
            published,
            identifier,
        }
    }
}

/// Parse an arXiv Atom feed into candidates, preserving feed order.
pub fn parse_feed(body: &str) -> Result<Vec<PaperCandidate>, SourceError> {
    let mut reader = Reader::from_str(body);
    let mut buf = Vec::new();

    #[derive(PartialEq)]
    enum TagState {
        None,
        Id,
        Title,
        Summary,
        Published,
        AuthorName,
    }
    let mut state = TagState::None;
    let mut entry: Option<Entry> = None;
    let mut text = String::new();
    let mut papers = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"entry" => entry = Some(Entry::default()),
                b"id" if entry.is_some() => state = TagState::Id,
                b"title" if entry.is_some() => state = TagState::Title,
                b"summary" if entry.is_some() => state = TagState::Summary,
                b"published" if entry.is_some() => state = TagState::Published,
                b"name" if entry.is_some() => state = TagState::AuthorName,
                _ => {
                    if let Some(cur) = entry.as_mut() {
                        cur.absorb_element(&e);
                    }
                }
            },
            Ok(Event::Empty(e)) => {
                if let Some(cur) = entry.as_mut() {
                    cur.absorb_element(&e);
                }
            }
            Ok(Event::Text(e)) if state != TagState::None => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::CData(e)) if state != TagState::None => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::GeneralRef(r)) if state != TagState::None => {
                let name = String::from_utf8_lossy(&r).into_owned();
                match resolve_entity(&name) {
                    Some(resolved) => text.push_str(&resolved),
                    None => {
                        text.push('&');
                        text.push_str(&name);
                        text.push(';');
                    }
                }
            }
            Ok(Event::End(e)) => {
                if let Some(cur) = entry.as_mut() {
                    let value = std::mem::take(&mut text);
                    match state {
                        TagState::Id => cur.id = value,
                        TagState::Title => cur.title = value,
                        TagState::Summary => cur.summary = value,
                        TagState::Published => cur.published = value,
                        TagState::AuthorName => cur.authors.push(value),
                        TagState::None => {}
                    }
                }
                state = TagState::None;

                if e.name().as_ref() == b"entry" {
                    if let Some(done) = entry.take() {
                        // The API reports query errors as a single pseudo-entry.
                        if done.id.contains("/api/errors") {
                            return Err(SourceError::Rejected(normalize_ws(&done.summary)));
                        }
                        let paper = done.into_candidate();
                        tracing::debug!("Parsed arXiv entry {}: {}", paper.identifier, paper.title);
                        papers.push(paper);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                if papers.is_empty() {
                    return Err(SourceError::Malformed(format!(
                        "at position {}: {}",
                        reader.buffer_position(),
                        e
                    )));
                }
                tracing::warn!("XML parsing error at position {}: {:?}", reader.buffer_position(), e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::canned_http::CannedServer;
    use crate::layers::taxonomy::lookup_topic;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <title type="html">ArXiv Query: search_query=cat:cs.LG</title>
  <id>http://arxiv.org/api/abc</id>
  <entry>
    <id>http://arxiv.org/abs/2401.00001v2</id>
    <published>2024-01-02T18:00:00Z</published>
    <title>Sparse Attention
      at Scale</title>
    <summary>  We study sparse &amp; efficient
  attention.
    </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2401.00001v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2401.00001v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2401.00002v1</id>
    <published>2024-01-01T09:30:00Z</published>
    <title>Protein Folding Notes</title>
    <summary>Biology.</summary>
    <author><name>Rosalind Franklin</name></author>
    <category term="q-bio.BM" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed_extracts_fields_in_order() {
        let papers = parse_feed(FEED).unwrap();
        assert_eq!(papers.len(), 2);

        let first = &papers[0];
        assert_eq!(first.identifier, "2401.00001v2");
        assert_eq!(first.title, "Sparse Attention at Scale");
        assert_eq!(first.abstract_text, "We study sparse & efficient attention.");
        assert_eq!(first.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(first.categories, vec!["cs.LG", "cs.CL"]);
        assert_eq!(first.url, "https://arxiv.org/abs/2401.00001v2");
        assert_eq!(first.pdf_url, "https://arxiv.org/pdf/2401.00001v2");
        assert_eq!(first.published.unwrap().to_rfc3339(), "2024-01-02T18:00:00+00:00");

        // No pdf link in the entry: derived from the identifier.
        assert_eq!(papers[1].pdf_url, "https://arxiv.org/pdf/2401.00002v1");
    }

    #[test]
    fn test_error_entry_is_rejected() {
        let feed = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
            <id>http://arxiv.org/api/errors#incorrect_id_format</id>
            <title>Error</title>
            <summary>incorrect id format</summary>
        </entry></feed>"#;
        assert!(matches!(parse_feed(feed), Err(SourceError::Rejected(msg)) if msg == "incorrect id format"));
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        assert!(matches!(parse_feed("<feed><entry></feed>"), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn test_search_query_for_subjects_and_archive() {
        let cs = lookup_topic("Computer Science").unwrap();
        let query = CandidateQuery {
            topic: cs,
            subjects: vec![cs.find_subject("cs.LG").unwrap(), cs.find_subject("cs.CL").unwrap()],
            limit: 20,
        };
        assert_eq!(build_search_query(&query), "cat:cs.LG OR cat:cs.CL");

        let query = CandidateQuery {
            topic: lookup_topic("Quantum Physics").unwrap(),
            subjects: vec![],
            limit: 20,
        };
        assert_eq!(build_search_query(&query), "cat:quant-ph");
    }

    #[test]
    fn test_parsed_candidates_respect_subject_filter() {
        let cs = lookup_topic("Computer Science").unwrap();
        let query = CandidateQuery {
            topic: cs,
            subjects: vec![cs.find_subject("Computation and Language").unwrap()],
            limit: 10,
        };
        let kept: Vec<_> = parse_feed(FEED)
            .unwrap()
            .into_iter()
            .filter(|p| p.categories.iter().any(|c| query.accepts_category(c)))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].identifier, "2401.00001v2");
    }

    fn local_client(server: &CannedServer) -> ArxivClient {
        let endpoint = Url::parse(&format!("{}/api/query", server.base_url)).unwrap();
        ArxivClient::new(endpoint, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_transient_status_is_retried_then_feed_is_parsed() {
        let server = CannedServer::start(vec![(503, String::new()), (200, FEED.to_string())]).await;
        let cs = lookup_topic("Computer Science").unwrap();
        let query = CandidateQuery {
            topic: cs,
            subjects: vec![cs.find_subject("cs.LG").unwrap()],
            limit: 10,
        };
        let papers = local_client(&server).fetch_candidates(&query).await.unwrap();
        assert_eq!(server.hits(), 2);
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].identifier, "2401.00001v2");
    }

    #[tokio::test]
    async fn test_client_status_fails_without_retry() {
        let server = CannedServer::start(vec![(404, String::new())]).await;
        let err = local_client(&server).get_with_retry(&server.base_url).await.unwrap_err();
        assert!(matches!(err, SourceError::Status(StatusCode::NOT_FOUND)));
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_persistent_server_error_gives_up_after_bounded_attempts() {
        let server = CannedServer::start(vec![(500, String::new())]).await;
        let err = local_client(&server).get_with_retry(&server.base_url).await.unwrap_err();
        assert!(matches!(err, SourceError::Status(StatusCode::INTERNAL_SERVER_ERROR)));
        assert_eq!(server.hits(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let endpoint = Url::parse(&format!("http://127.0.0.1:{port}/api/query")).unwrap();
        let client = ArxivClient::new(endpoint, Duration::from_secs(5)).unwrap();
        let err = client.get_with_retry(client.endpoint.as_str()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unreachable(_)));
    }

    #[test]
    fn test_page_url_encodes_query() {
        let client = ArxivClient::new(Url::parse(DEFAULT_ARXIV_API).unwrap(), Duration::from_secs(5)).unwrap();
        let url = client.page_url("cat:cs.LG OR cat:cs.CL", 0, 20);
        assert_eq!(
            url,
            "https://export.arxiv.org/api/query?search_query=cat%3Acs.LG%20OR%20cat%3Acs.CL&sortBy=submittedDate&sortOrder=descending&start=0&max_results=20"
        );
    }
}
