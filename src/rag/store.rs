//! Local chunk store: key-value rows plus a full-text mirror for the
//! keyword-fallback path. Embeddings are stored as little-endian f32 blobs
//! and compared in process with cosine similarity.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::StoreError;
use crate::rag::embed::cosine_similarity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Code,
    Pattern,
    Expert,
    Conversation,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Pattern => "pattern",
            Self::Expert => "expert",
            Self::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "code" => Ok(Self::Code),
            "pattern" => Ok(Self::Pattern),
            "expert" => Ok(Self::Expert),
            "conversation" => Ok(Self::Conversation),
            _ => Err(format!("Invalid chunk type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub chunk_type: ChunkType,
    pub domain: Option<String>,
    pub language: Option<String>,
    pub tags: Vec<String>,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A chunk scored against a query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f32,
}

/// Content-addressed chunk id: sha256 over source and content, so
/// re-indexing identical input lands on the same row.
pub fn chunk_id(source: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Filters applied before similarity scoring.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub chunk_types: Vec<ChunkType>,
    pub domain: Option<String>,
    pub source: Option<String>,
}

pub struct ChunkStore {
    conn: Connection,
}

impl ChunkStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                chunk_type TEXT NOT NULL,
                domain TEXT,
                language TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                token_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);
            CREATE INDEX IF NOT EXISTS idx_chunks_type ON chunks(chunk_type, domain);

            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
                USING fts5(id UNINDEXED, content);
            ",
        )?;
        Ok(())
    }

    /// Insert or replace a chunk and its full-text mirror.
    pub fn upsert(&self, chunk: &Chunk) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO chunks (id, source, content, embedding, chunk_type, domain, language, tags, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                source = ?2, content = ?3, embedding = ?4, chunk_type = ?5,
                domain = ?6, language = ?7, tags = ?8, token_count = ?9",
            params![
                chunk.id,
                chunk.source,
                chunk.content,
                encode_embedding(&chunk.embedding),
                chunk.chunk_type.as_str(),
                chunk.domain,
                chunk.language,
                serde_json::to_string(&chunk.tags).unwrap_or_else(|_| "[]".to_string()),
                chunk.token_count as i64,
                chunk.created_at.to_rfc3339(),
            ],
        )?;
        self.conn.execute(
            "DELETE FROM chunks_fts WHERE id = ?1",
            params![chunk.id],
        )?;
        self.conn.execute(
            "INSERT INTO chunks_fts (id, content) VALUES (?1, ?2)",
            params![chunk.id, chunk.content],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Chunk>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, source, content, embedding, chunk_type, domain, language, tags, token_count, created_at
                 FROM chunks WHERE id = ?1",
                params![id],
                Self::row_to_chunk,
            )
            .optional()?;
        row.transpose()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn delete_source(&self, source: &str) -> Result<usize, StoreError> {
        self.conn.execute(
            "DELETE FROM chunks_fts WHERE id IN (SELECT id FROM chunks WHERE source = ?1)",
            params![source],
        )?;
        let deleted = self
            .conn
            .execute("DELETE FROM chunks WHERE source = ?1", params![source])?;
        Ok(deleted)
    }

    fn filter_clause(filter: &ChunkFilter) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if !filter.chunk_types.is_empty() {
            let placeholders: Vec<String> = filter
                .chunk_types
                .iter()
                .map(|t| {
                    args.push(t.as_str().to_string());
                    format!("?{}", args.len())
                })
                .collect();
            clauses.push(format!("chunk_type IN ({})", placeholders.join(", ")));
        }
        if let Some(domain) = &filter.domain {
            args.push(domain.clone());
            clauses.push(format!("domain = ?{}", args.len()));
        }
        if let Some(source) = &filter.source {
            args.push(source.clone());
            clauses.push(format!("source = ?{}", args.len()));
        }
        let clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (clause, args)
    }

    /// Cosine-similarity search over the filtered rows, descending, capped
    /// at `top_k`, dropping results under `min_similarity`.
    pub fn search_similar(
        &self,
        query: &[f32],
        filter: &ChunkFilter,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let (clause, args) = Self::filter_clause(filter);
        let sql = format!(
            "SELECT id, source, content, embedding, chunk_type, domain, language, tags, token_count, created_at
             FROM chunks {}",
            clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter()),
            Self::row_to_chunk,
        )?;
        let mut scored = Vec::new();
        for row in rows {
            let chunk = row??;
            let similarity = cosine_similarity(query, &chunk.embedding);
            if similarity >= min_similarity {
                scored.push(ScoredChunk { chunk, similarity });
            }
        }
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Full-text OR query over the mirror. Results carry a fixed
    /// similarity marker since no vector was involved.
    pub fn keyword_search(
        &self,
        terms: &[String],
        filter: &ChunkFilter,
        limit: usize,
        similarity_marker: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let query = terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut stmt = self.conn.prepare(
            "SELECT id FROM chunks_fts WHERE chunks_fts MATCH ?1 LIMIT ?2",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![query, (limit * 4) as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        let mut results = Vec::new();
        for id in ids {
            if results.len() >= limit {
                break;
            }
            if let Some(chunk) = self.get(&id)? {
                if !filter.chunk_types.is_empty() && !filter.chunk_types.contains(&chunk.chunk_type)
                {
                    continue;
                }
                if let Some(domain) = &filter.domain
                    && chunk.domain.as_deref() != Some(domain)
                {
                    continue;
                }
                results.push(ScoredChunk {
                    chunk,
                    similarity: similarity_marker,
                });
            }
        }
        Ok(results)
    }

    #[allow(clippy::type_complexity)]
    fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Chunk, StoreError>> {
        let id: String = row.get(0)?;
        let source: String = row.get(1)?;
        let content: String = row.get(2)?;
        let embedding: Vec<u8> = row.get(3)?;
        let chunk_type: String = row.get(4)?;
        let domain: Option<String> = row.get(5)?;
        let language: Option<String> = row.get(6)?;
        let tags: String = row.get(7)?;
        let token_count: i64 = row.get(8)?;
        let created_at: String = row.get(9)?;
        Ok(Self::assemble_chunk(
            id, source, content, embedding, chunk_type, domain, language, tags, token_count,
            created_at,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_chunk(
        id: String,
        source: String,
        content: String,
        embedding: Vec<u8>,
        chunk_type: String,
        domain: Option<String>,
        language: Option<String>,
        tags: String,
        token_count: i64,
        created_at: String,
    ) -> Result<Chunk, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            entity: "chunks",
            id: id.clone(),
            message,
        };
        Ok(Chunk {
            chunk_type: ChunkType::parse(&chunk_type).map_err(&corrupt)?,
            tags: serde_json::from_str(&tags).map_err(|e| corrupt(e.to_string()))?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(e.to_string()))?,
            embedding: decode_embedding(&embedding),
            token_count: token_count as usize,
            id,
            source,
            content,
            domain,
            language,
        })
    }
}
