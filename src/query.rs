//! Query-time retrieval: embed, over-fetch, canonicalize, rerank,
//! snippet (`spec.md` §4.8).
//!
//! The merge/normalize-then-rerank shape directly generalizes the
//! teacher's `search_documents` hybrid-scoring structure (fetch
//! candidates, group by key, track the best score and snippet per
//! group, sort, truncate) from keyword+vector fusion to
//! vector+lexical-overlap fusion.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use url::Url;

use crate::embedding::EmbeddingBackend;
use crate::error::CoreError;
use crate::models::SourceCommand;
use crate::store::{PayloadFilter, VectorStore};

const OVER_FETCH_FACTOR: usize = 10;
const OVER_FETCH_FLOOR: usize = 50;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see",
    "two", "way", "who", "boy", "did", "its", "let", "put", "say", "she", "too", "use", "with",
    "this", "that", "from", "have", "what", "when", "where", "which", "will", "your",
];

#[derive(Debug, Clone)]
pub struct QueryResultItem {
    pub url: String,
    pub title: Option<String>,
    pub score: f32,
    pub chunk_header: Option<String>,
    pub chunk_text: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub domain: String,
    pub source_command: SourceCommand,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub source_path_rel: Option<String>,
    /// Extra chunks in the group, present only when `group=true` was
    /// requested.
    pub additional_chunks: Vec<QueryChunk>,
}

#[derive(Debug, Clone)]
pub struct QueryChunk {
    pub score: f32,
    pub chunk_header: Option<String>,
    pub chunk_text: String,
    pub chunk_index: usize,
}

/// How strictly a temporal hint constrains results. `spec.md` §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalMode {
    Strict,
    Loose,
}

#[derive(Debug, Clone)]
pub struct TemporalScope {
    pub date: NaiveDate,
    pub mode: TemporalMode,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query: String,
    pub limit: usize,
    pub domain: Option<String>,
    pub collection: String,
    pub group: bool,
    pub temporal_scope: Option<TemporalScope>,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub items: Vec<QueryResultItem>,
    pub scope_fallback: bool,
}

pub struct QueryCore<E: EmbeddingBackend, V: VectorStore> {
    embedding: Arc<E>,
    store: Arc<V>,
}

impl<E: EmbeddingBackend, V: VectorStore> QueryCore<E, V> {
    pub fn new(embedding: Arc<E>, store: Arc<V>) -> Self {
        Self { embedding, store }
    }

    pub async fn query(&self, req: QueryRequest) -> Result<QueryResponse, CoreError> {
        let limit = req.limit.max(1);
        let over_fetch = (limit * OVER_FETCH_FACTOR).max(OVER_FETCH_FLOOR);

        let vectors = self.embedding.embed_batch(&[req.query.clone()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::InvalidInput("embedding backend returned no vector".into()))?;

        let filter: Option<PayloadFilter> = req.domain.as_ref().map(|d| {
            let mut f = PayloadFilter::new();
            f.insert("domain".to_string(), serde_json::Value::String(d.clone()));
            f
        });

        let hits = self
            .store
            .query_points(&req.collection, &vector, over_fetch, filter.as_ref())
            .await?;

        let query_terms = tokenize_query(&req.query);

        let mut groups: Vec<GroupAccum> = Vec::new();
        let mut group_index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

        for hit in hits {
            let payload = hit.payload;
            let raw_url = match payload.get_string("url") {
                Some(u) => u,
                None => continue,
            };
            let canonical = canonicalize_url(&raw_url).unwrap_or(raw_url);

            let chunk = QueryChunk {
                score: hit.score,
                chunk_header: payload.get_string("chunk_header"),
                chunk_text: payload.get_string_or("chunk_text", ""),
                chunk_index: payload.get_usize("chunk_index").unwrap_or(0),
            };

            let title = payload.get_string("title");
            let idx = *group_index.entry(canonical.clone()).or_insert_with(|| {
                groups.push(GroupAccum {
                    url: canonical.clone(),
                    title: title.clone(),
                    domain: payload.get_string_or("domain", ""),
                    source_command: parse_source_command(&payload.get_string_or("source_command", "scrape")),
                    total_chunks: payload.get_usize("total_chunks").unwrap_or(1),
                    file_modified_at: payload.get_string("file_modified_at").and_then(|s| {
                        DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))
                    }),
                    scraped_at: payload.get_string("scraped_at").and_then(|s| {
                        DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))
                    }),
                    source_path_rel: payload.get_string("source_path_rel"),
                    chunks: Vec::new(),
                });
                groups.len() - 1
            });
            groups[idx].chunks.push(chunk);
            if title.is_some() && groups[idx].title.is_none() {
                groups[idx].title = title;
            }
        }

        for group in &mut groups {
            group.chunks.sort_by(|a, b| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let mut scored: Vec<(f32, GroupAccum)> = groups
            .into_iter()
            .map(|g| {
                let score = rerank_score(&g, &query_terms, &req.query);
                (score, g)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut items: Vec<QueryResultItem> = scored
            .into_iter()
            .map(|(score, g)| group_to_item(score, g, req.group))
            .collect();

        let mut scope_fallback = false;
        if let Some(scope) = &req.temporal_scope {
            let filtered: Vec<QueryResultItem> = items
                .iter()
                .filter(|item| matches_temporal_scope(item, scope.date))
                .cloned()
                .collect();

            if filtered.is_empty() && scope.mode == TemporalMode::Strict {
                return Err(CoreError::InvalidInput(format!(
                    "no results within temporal scope {}",
                    scope.date
                )));
            } else if filtered.is_empty() {
                scope_fallback = true;
            } else {
                items = filtered;
            }
        }

        items.truncate(limit);
        Ok(QueryResponse { items, scope_fallback })
    }
}

struct GroupAccum {
    url: String,
    title: Option<String>,
    domain: String,
    source_command: SourceCommand,
    total_chunks: usize,
    file_modified_at: Option<DateTime<Utc>>,
    scraped_at: Option<DateTime<Utc>>,
    source_path_rel: Option<String>,
    chunks: Vec<QueryChunk>,
}

fn parse_source_command(s: &str) -> SourceCommand {
    match s {
        "crawl" => SourceCommand::Crawl,
        "search" => SourceCommand::Search,
        "extract" => SourceCommand::Extract,
        "embed" => SourceCommand::Embed,
        _ => SourceCommand::Scrape,
    }
}

fn group_to_item(score: f32, g: GroupAccum, group_all: bool) -> QueryResultItem {
    let mut chunks = g.chunks;
    let top = chunks.remove(0);
    QueryResultItem {
        url: g.url,
        title: g.title,
        score,
        chunk_header: top.chunk_header,
        chunk_text: top.chunk_text,
        chunk_index: top.chunk_index,
        total_chunks: g.total_chunks,
        domain: g.domain,
        source_command: g.source_command,
        file_modified_at: g.file_modified_at,
        scraped_at: g.scraped_at,
        source_path_rel: g.source_path_rel,
        additional_chunks: if group_all { chunks } else { Vec::new() },
    }
}

fn matches_temporal_scope(item: &QueryResultItem, date: NaiveDate) -> bool {
    let candidate = item.file_modified_at.or(item.scraped_at);
    candidate.map(|dt| dt.date_naive() == date).unwrap_or(false)
}

/// Lowercase, strip punctuation to whitespace, drop stop words and
/// anything shorter than 3 characters.
fn tokenize_query(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

fn term_match_ratio(text: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let matched = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    matched as f64 / terms.len() as f64
}

/// `base + 0.16 * term-match-over-top-chunks + 0.06 * term-match-over
/// title+header + 0.08 * exact-substring-bonus`. `spec.md` §4.8 step 5.
fn rerank_score(group: &GroupAccum, query_terms: &[String], raw_query: &str) -> f32 {
    let base = group.chunks.first().map(|c| c.score).unwrap_or(0.0) as f64;

    let body_text: String = group
        .chunks
        .iter()
        .map(|c| c.chunk_text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let term_score = term_match_ratio(&body_text, query_terms).min(1.0);

    let title_header_text = format!(
        "{} {}",
        group.title.as_deref().unwrap_or(""),
        group
            .chunks
            .first()
            .and_then(|c| c.chunk_header.as_deref())
            .unwrap_or("")
    );
    let title_header_score = term_match_ratio(&title_header_text, query_terms).min(1.0);

    let exact_bonus = if raw_query.trim().len() >= 6
        && query_terms.len() >= 2
        && body_text.to_lowercase().contains(&raw_query.to_lowercase())
    {
        0.08
    } else {
        0.0
    };

    (base + 0.16 * term_score + 0.06 * title_header_score + exact_bonus) as f32
}

const TRACKING_PARAM_PREFIXES: &[&str] = &["utm_"];
const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid"];

/// Strip fragment, drop tracking params, lowercase default ports away,
/// trim a trailing `/` except for the root path. `spec.md` §4.8 step 4.
fn canonicalize_url(raw: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(raw)?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_lowercase();
            !TRACKING_PARAM_PREFIXES.iter().any(|p| k.starts_with(p))
                && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }

    let default_port = match url.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if url.port() == default_port {
        let _ = url.set_port(None);
    }

    if url.path().len() > 1 && url.path().ends_with('/') {
        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }

    Ok(url.to_string())
}

/// Extract a display snippet from the top chunk's text for
/// non-`full` rendering: strip Markdown link syntax/headings/hr, keep
/// the first substantive line, or fall back to a 120-char truncation.
/// `spec.md` §4.8 "Snippet selection".
pub fn extract_snippet(chunk_text: &str) -> String {
    for line in chunk_text.lines() {
        let cleaned = strip_markdown_noise(line);
        let word_count = cleaned.split_whitespace().count();
        if word_count >= 2 && cleaned.chars().count() >= 10 {
            return cleaned;
        }
    }

    let fallback: String = chunk_text.chars().take(120).collect();
    fallback
}

fn strip_markdown_noise(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().all(|c| c == '-' || c == '*' || c == '_' || c.is_whitespace())
        && !trimmed.is_empty()
    {
        return String::new();
    }

    let no_heading = trimmed.trim_start_matches('#').trim();

    // Strip `[text](url)` down to `text`.
    let mut out = String::new();
    let mut chars = no_heading.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' {
            let mut label = String::new();
            let mut closed = false;
            for c2 in chars.by_ref() {
                if c2 == ']' {
                    closed = true;
                    break;
                }
                label.push(c2);
            }
            if closed && chars.peek() == Some(&'(') {
                chars.next();
                for c2 in chars.by_ref() {
                    if c2 == ')' {
                        break;
                    }
                }
                out.push_str(&label);
            } else {
                out.push('[');
                out.push_str(&label);
            }
        } else {
            out.push(c);
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Unused-pairs helper kept for callers that need the underlying set
/// without going through the full canonicalization pipeline (e.g.
/// tests asserting what counts as a tracking param).
#[allow(dead_code)]
fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_lowercase();
    TRACKING_PARAM_PREFIXES.iter().any(|p| lower.starts_with(p)) || TRACKING_PARAMS.contains(&lower.as_str())
}

impl Clone for QueryResultItem {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            title: self.title.clone(),
            score: self.score,
            chunk_header: self.chunk_header.clone(),
            chunk_text: self.chunk_text.clone(),
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            domain: self.domain.clone(),
            source_command: self.source_command,
            file_modified_at: self.file_modified_at,
            scraped_at: self.scraped_at,
            source_path_rel: self.source_path_rel.clone(),
            additional_chunks: self.additional_chunks.clone(),
        }
    }
}

impl Clone for QueryChunk {
    fn clone(&self) -> Self {
        Self {
            score: self.score,
            chunk_header: self.chunk_header.clone(),
            chunk_text: self.chunk_text.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BackendInfo;
    use crate::models::ContentType as CT;
    use crate::pipeline::{DocumentMeta, EmbedPipeline, EmbedPipelineOptions};
    use crate::source_id::SourceId;
    use crate::store::memory::InMemoryVectorStore;
    use async_trait::async_trait;

    struct StubBackend;

    #[async_trait]
    impl EmbeddingBackend for StubBackend {
        async fn info(&self) -> Result<BackendInfo, CoreError> {
            Ok(BackendInfo {
                model_id: "stub".into(),
                dimension: 3,
                max_input_length: None,
            })
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    #[test]
    fn canonicalize_strips_fragment_and_tracking_params() {
        let out = canonicalize_url("https://x.test/page/?utm_source=x&gclid=y&kept=1#frag").unwrap();
        assert_eq!(out, "https://x.test/page?kept=1");
    }

    #[test]
    fn canonicalize_drops_default_port_and_trailing_slash() {
        let out = canonicalize_url("https://x.test:443/docs/").unwrap();
        assert_eq!(out, "https://x.test/docs");
    }

    #[test]
    fn canonicalize_preserves_root_slash() {
        let out = canonicalize_url("https://x.test/").unwrap();
        assert_eq!(out, "https://x.test/");
    }

    #[test]
    fn snippet_strips_markdown_link_and_heading_noise() {
        let text = "## Heading\n\nSee [the docs](https://x.test) for more detail here.";
        let snippet = extract_snippet(text);
        assert!(snippet.contains("See the docs for more detail here."));
    }

    #[test]
    fn snippet_falls_back_to_truncation_when_no_substantive_line() {
        let text = "--\n\n-\n";
        let snippet = extract_snippet(text);
        assert!(snippet.len() <= 120);
    }

    #[tokio::test]
    async fn query_groups_by_canonical_url_and_ranks_term_matches_higher() {
        let backend = Arc::new(StubBackend);
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = EmbedPipeline::new(backend.clone(), store.clone(), EmbedPipelineOptions::default());

        let mut meta_a = DocumentMeta::new(
            SourceId::from_url("https://x.test/auth?utm_source=news"),
            SourceCommand::Scrape,
            CT::Markdown,
        );
        meta_a.collection = Some("axon".to_string());
        pipeline
            .auto_embed("# Auth\n\nHow to configure authentication tokens.", &meta_a)
            .await
            .unwrap();

        let mut meta_b = DocumentMeta::new(
            SourceId::from_url("https://x.test/unrelated"),
            SourceCommand::Scrape,
            CT::Markdown,
        );
        meta_b.collection = Some("axon".to_string());
        pipeline
            .auto_embed("# Unrelated\n\nSomething about gardening.", &meta_b)
            .await
            .unwrap();

        let core = QueryCore::new(backend, store);
        let response = core
            .query(QueryRequest {
                query: "authentication tokens".to_string(),
                limit: 10,
                domain: None,
                collection: "axon".to_string(),
                group: false,
                temporal_scope: None,
            })
            .await
            .unwrap();

        assert!(!response.items.is_empty());
        assert_eq!(response.items[0].url, "https://x.test/auth");
    }

    #[test]
    fn is_tracking_param_matches_known_keys() {
        assert!(is_tracking_param("utm_campaign"));
        assert!(is_tracking_param("gclid"));
        assert!(!is_tracking_param("kept"));
    }
}
