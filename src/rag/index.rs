//! Chunk extraction and indexing.
//!
//! Expert prompt markdown yields code-example chunks (fenced blocks plus
//! up to 500 chars of preceding prose as a paired pattern chunk) and
//! `##` section chunks. Codebase files chunk by paragraph with a sentence
//! split on overflow. Ids are content-addressed, so re-indexing the same
//! input is a no-op.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::rag::embed::Embedder;
use crate::rag::estimate_tokens;
use crate::rag::store::{Chunk, ChunkStore, ChunkType, chunk_id};

/// Embedding batch size.
pub const EMBED_BATCH: usize = 50;

/// Section token bounds for expert chunks.
const SECTION_MIN_TOKENS: usize = 50;
const SECTION_MAX_TOKENS: usize = 2000;

/// Paragraph chunk budget for codebase files.
const PARAGRAPH_MAX_TOKENS: usize = 500;

/// Prose context carried alongside a fenced code block.
const CODE_CONTEXT_CHARS: usize = 500;

/// An extracted chunk awaiting an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub content: String,
    pub chunk_type: ChunkType,
    pub language: Option<String>,
    pub tags: Vec<String>,
}

/// Fenced code blocks with their preceding prose, from a markdown document.
pub fn extract_code_blocks(markdown: &str) -> Vec<(PendingChunk, Option<PendingChunk>)> {
    let mut out = Vec::new();
    let mut in_fence = false;
    let mut language = String::new();
    let mut code = String::new();
    let mut prose = String::new();
    for line in markdown.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("```") {
            if in_fence {
                if !code.trim().is_empty() {
                    let code_chunk = PendingChunk {
                        content: code.trim_end().to_string(),
                        chunk_type: ChunkType::Code,
                        language: if language.is_empty() {
                            None
                        } else {
                            Some(language.clone())
                        },
                        tags: Vec::new(),
                    };
                    let context = prose.trim();
                    let paired = if context.is_empty() {
                        None
                    } else {
                        let tail: String = if context.len() > CODE_CONTEXT_CHARS {
                            let start = context.len() - CODE_CONTEXT_CHARS;
                            let mut cut = start;
                            while !context.is_char_boundary(cut) {
                                cut += 1;
                            }
                            context[cut..].to_string()
                        } else {
                            context.to_string()
                        };
                        Some(PendingChunk {
                            content: tail,
                            chunk_type: ChunkType::Pattern,
                            language: None,
                            tags: Vec::new(),
                        })
                    };
                    out.push((code_chunk, paired));
                }
                code.clear();
                prose.clear();
                in_fence = false;
            } else {
                language = rest.trim().to_string();
                in_fence = true;
            }
            continue;
        }
        if in_fence {
            code.push_str(line);
            code.push('\n');
        } else {
            prose.push_str(line);
            prose.push('\n');
        }
    }
    out
}

/// `##` sections from a markdown document, skipping those outside the
/// 50..2000 estimated-token window.
pub fn extract_sections(markdown: &str) -> Vec<PendingChunk> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, String)> = None;
    for line in markdown.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some((title.trim().to_string(), String::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    sections
        .into_iter()
        .filter_map(|(title, body)| {
            let content = format!("## {}\n{}", title, body.trim_end());
            let tokens = estimate_tokens(&content);
            if !(SECTION_MIN_TOKENS..=SECTION_MAX_TOKENS).contains(&tokens) {
                return None;
            }
            Some(PendingChunk {
                content,
                chunk_type: ChunkType::Expert,
                language: None,
                tags: vec![title],
            })
        })
        .collect()
}

/// Split free text into paragraph chunks of at most `max_tokens`,
/// splitting oversized paragraphs on sentence boundaries.
pub fn chunk_paragraphs(text: &str, max_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if estimate_tokens(paragraph) > max_tokens {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(split_sentences(paragraph, max_tokens));
            continue;
        }
        if !current.is_empty() && estimate_tokens(&current) + estimate_tokens(paragraph) > max_tokens
        {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_sentences(paragraph: &str, max_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in paragraph.split_inclusive(". ") {
        if estimate_tokens(sentence) > max_tokens {
            // Sentence-free text (long code lines, word runs): fall back to
            // word boundaries.
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            for word in sentence.split_whitespace() {
                if !current.is_empty()
                    && estimate_tokens(&current) + estimate_tokens(word) > max_tokens
                {
                    chunks.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
            }
            continue;
        }
        if !current.is_empty() && estimate_tokens(&current) + estimate_tokens(sentence) > max_tokens
        {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub struct Indexer<'a> {
    store: &'a ChunkStore,
    embedder: &'a dyn Embedder,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a ChunkStore, embedder: &'a dyn Embedder) -> Self {
        Self { store, embedder }
    }

    /// Index one domain's expert markdown under the `expert:<domain>`
    /// source label. Returns how many chunks were written.
    pub async fn index_expert_markdown(&self, domain: &str, markdown: &str) -> Result<usize> {
        let source = format!("expert:{}", domain);
        let mut pending = Vec::new();
        for (code, context) in extract_code_blocks(markdown) {
            pending.push(code);
            if let Some(context) = context {
                pending.push(context);
            }
        }
        pending.extend(extract_sections(markdown));
        self.write_batches(&source, Some(domain), pending).await
    }

    /// Index codebase files matching the configured glob patterns,
    /// relative to `root`.
    pub async fn index_codebase(&self, root: &std::path::Path, patterns: &[String]) -> Result<usize> {
        let mut written = 0;
        for pattern in patterns {
            let absolute = root.join(pattern);
            let glob_pattern = absolute.to_string_lossy().to_string();
            let paths = glob::glob(&glob_pattern)
                .with_context(|| format!("Invalid index pattern: {}", pattern))?;
            for entry in paths {
                let path = entry.context("Failed to read glob entry")?;
                if !path.is_file() {
                    continue;
                }
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                let language = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(String::from);
                let source = path.to_string_lossy().to_string();
                let pending: Vec<PendingChunk> = chunk_paragraphs(&content, PARAGRAPH_MAX_TOKENS)
                    .into_iter()
                    .map(|content| PendingChunk {
                        content,
                        chunk_type: ChunkType::Code,
                        language: language.clone(),
                        tags: Vec::new(),
                    })
                    .collect();
                written += self.write_batches(&source, None, pending).await?;
            }
        }
        Ok(written)
    }

    async fn write_batches(
        &self,
        source: &str,
        domain: Option<&str>,
        pending: Vec<PendingChunk>,
    ) -> Result<usize> {
        let mut written = 0;
        for batch in pending.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            for (item, embedding) in batch.iter().zip(vectors) {
                let chunk = Chunk {
                    id: chunk_id(source, &item.content),
                    source: source.to_string(),
                    content: item.content.clone(),
                    embedding,
                    chunk_type: item.chunk_type,
                    domain: domain.map(String::from),
                    language: item.language.clone(),
                    tags: item.tags.clone(),
                    token_count: estimate_tokens(&item.content),
                    created_at: Utc::now(),
                };
                self.store.upsert(&chunk)?;
                written += 1;
            }
        }
        Ok(written)
    }
}
