//! Embedding backends for the chunk store.
//!
//! The remote embedder calls a hosted embedding API in document mode. When
//! no credential is configured, a deterministic feature-hashing fallback
//! keeps retrieval functional: less accurate, but it always returns
//! results and never needs the network.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Dimension of the feature-hashing fallback vectors.
pub const HASH_DIM: usize = 256;

/// Environment variable holding the embedding API key.
pub const ENV_KEY: &str = "VOYAGE_API_KEY";

const REMOTE_URL: &str = "https://api.voyageai.com/v1/embeddings";
const REMOTE_MODEL: &str = "voyage-code-2";

/// Cosine similarity of two vectors; 0.0 when either is all-zero or the
/// dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic 256-dimensional feature-hashing embedder.
///
/// Unigram and bigram word tokens hash into a bucket; one hash bit picks
/// the sign. The vector is L2-normalised so cosine similarity behaves.
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; HASH_DIM];
        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(String::from)
            .collect();
        let mut feed = |token: &str| {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % HASH_DIM;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        };
        for word in &words {
            feed(word);
        }
        for pair in words.windows(2) {
            feed(&format!("{} {}", pair[0], pair[1]));
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

/// Hosted embedding API client (document mode).
pub struct RemoteEmbedder {
    api_key: String,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn from_env() -> Option<Self> {
        std::env::var(ENV_KEY).ok().map(|api_key| Self {
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": REMOTE_MODEL,
            "input": texts,
            "input_type": "document",
        });
        let response = self
            .client
            .post(REMOTE_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("embedding request failed")?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .context("embedding response was not JSON")?;
        if !status.is_success() {
            return Err(anyhow!("embedding API returned {}: {}", status, value));
        }
        let data = value
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow!("embedding response missing data array"))?;
        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow!("embedding item missing vector"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            vectors.push(embedding);
        }
        if vectors.len() != texts.len() {
            return Err(anyhow!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                vectors.len()
            ));
        }
        Ok(vectors)
    }
}

/// Best available embedder: remote when the credential exists, hashing
/// fallback otherwise.
pub fn default_embedder() -> Box<dyn Embedder> {
    match RemoteEmbedder::from_env() {
        Some(remote) => Box::new(remote),
        None => {
            tracing::info!("no embedding credential, using hashing fallback");
            Box::new(HashingEmbedder)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_vector_with_itself_is_one() {
        let v = HashingEmbedder::embed_one("retry the merge with backoff");
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-5, "got {}", sim);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_handles_dimension_mismatch_and_zero_vectors() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn hashing_embedder_is_deterministic() {
        let a = HashingEmbedder::embed_one("pool capacity check");
        let b = HashingEmbedder::embed_one("pool capacity check");
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_DIM);
    }

    #[test]
    fn hashing_embedder_output_is_normalised() {
        let v = HashingEmbedder::embed_one("tokens flow through the pipeline");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let query = HashingEmbedder::embed_one("merge queue retries failed merges");
        let close = HashingEmbedder::embed_one("the merge queue retries a failed merge attempt");
        let far = HashingEmbedder::embed_one("css grid layout for the dashboard sidebar");
        assert!(
            cosine_similarity(&query, &close) > cosine_similarity(&query, &far),
            "expected related text to rank above unrelated text"
        );
    }

    #[tokio::test]
    async fn batch_embedding_matches_single_embedding() {
        let embedder = HashingEmbedder;
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], HashingEmbedder::embed_one("one"));
    }
}
