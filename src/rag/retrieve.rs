//! Query-time retrieval: embed the ticket once, run the pattern and code
//! searches, and greedily fill a token budget. Embedding failure degrades
//! to a stop-word-filtered keyword query; retrieval never fails the
//! invocation that asked for it.

use anyhow::Result;

use crate::board::models::Ticket;
use crate::rag::embed::Embedder;
use crate::rag::store::{ChunkFilter, ChunkStore, ChunkType, ScoredChunk};

const PATTERN_TOP_K: usize = 8;
const PATTERN_MIN_SIMILARITY: f32 = 0.5;
const CODE_TOP_K: usize = 5;
const CODE_MIN_SIMILARITY: f32 = 0.4;
const KEYWORD_SIMILARITY_MARKER: f32 = 0.5;
const DESCRIPTION_QUERY_CHARS: usize = 300;

const STOP_WORDS: [&str; 24] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "with", "will", "when",
];

/// Build the retrieval query string from ticket fields.
pub fn build_query(ticket: &Ticket) -> String {
    let mut parts = vec![ticket.title.clone()];
    if !ticket.description.is_empty() {
        let mut cut = ticket.description.len().min(DESCRIPTION_QUERY_CHARS);
        while !ticket.description.is_char_boundary(cut) {
            cut -= 1;
        }
        parts.push(ticket.description[..cut].to_string());
    }
    parts.push(ticket.domain.as_str().to_string());
    if !ticket.technical_context.is_empty() {
        parts.push(ticket.technical_context.clone());
    }
    for constraint in &ticket.constraints {
        parts.push(constraint.clone());
    }
    parts.join(" ")
}

/// Stop-word-filtered terms for the keyword fallback.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect();
    terms.dedup();
    terms
}

/// Retrieved context ready for prompt injection.
#[derive(Debug, Default)]
pub struct RetrievedContext {
    pub chunks: Vec<ScoredChunk>,
    pub token_count: usize,
    /// True when the keyword fallback served this retrieval.
    pub keyword_fallback: bool,
}

impl RetrievedContext {
    /// Markdown rendering for the static prompt prefix.
    pub fn rendered(&self) -> String {
        if self.chunks.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Retrieved Patterns\n\n");
        for scored in &self.chunks {
            out.push_str(&format!(
                "### {} (similarity {:.2})\n{}\n\n",
                scored.chunk.source, scored.similarity, scored.chunk.content
            ));
        }
        out.trim_end().to_string()
    }
}

pub struct Retriever {
    /// rusqlite connections are not `Sync`; searches take a short
    /// exclusive hold with no await inside.
    store: std::sync::Mutex<ChunkStore>,
    embedder: Box<dyn Embedder>,
    token_budget: usize,
}

impl Retriever {
    pub fn new(store: ChunkStore, embedder: Box<dyn Embedder>, token_budget: usize) -> Self {
        Self {
            store: std::sync::Mutex::new(store),
            embedder,
            token_budget,
        }
    }

    /// Retrieve context for a ticket. Similarity search against patterns
    /// and code; keyword fallback when embedding fails.
    pub async fn retrieve(&self, ticket: &Ticket) -> Result<RetrievedContext> {
        let query = build_query(ticket);
        let domain = ticket.domain.as_str().to_string();

        let candidates = match self.embed_query(&query).await {
            Ok(vector) => {
                let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
                let pattern_filter = ChunkFilter {
                    chunk_types: vec![ChunkType::Pattern, ChunkType::Expert],
                    domain: Some(domain.clone()),
                    source: None,
                };
                let mut found = store.search_similar(
                    &vector,
                    &pattern_filter,
                    PATTERN_TOP_K,
                    PATTERN_MIN_SIMILARITY,
                )?;
                let code_filter = ChunkFilter {
                    chunk_types: vec![ChunkType::Code],
                    domain: None,
                    source: None,
                };
                found.extend(store.search_similar(
                    &vector,
                    &code_filter,
                    CODE_TOP_K,
                    CODE_MIN_SIMILARITY,
                )?);
                found.sort_by(|a, b| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                (found, false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, using keyword fallback");
                let terms = keyword_terms(&query);
                let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
                let found = store.keyword_search(
                    &terms,
                    &ChunkFilter::default(),
                    PATTERN_TOP_K + CODE_TOP_K,
                    KEYWORD_SIMILARITY_MARKER,
                )?;
                (found, true)
            }
        };

        let (found, keyword_fallback) = candidates;
        let mut context = RetrievedContext {
            keyword_fallback,
            ..Default::default()
        };
        for scored in found {
            let tokens = scored.chunk.token_count.max(1);
            if context.token_count + tokens > self.token_budget {
                continue;
            }
            context.token_count += tokens;
            context.chunks.push(scored);
        }
        Ok(context)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let vectors = self.embedder.embed_batch(&[query.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
    }
}
