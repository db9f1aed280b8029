//! Collaborator interfaces (§6): the vector store, embedding service,
//! artifact sink, and clock the core depends on but does not implement.
//! Concrete production clients for these are out of scope (§1); this module
//! carries only the trait contracts plus simple in-memory implementations
//! sufficient to exercise the scheduler's call-handle contract in tests.
//!
//! Grounded on the teacher's `engine::storage::WorkflowStorage` trait shape
//! (an `#[async_trait]` interface plus a default in-memory implementation
//! behind a lock), generalized to the four collaborator roles named in §6.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use crate::error::Result;

/// One item upserted into a vector store collection (§6).
#[derive(Debug, Clone)]
pub struct VectorItem {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
}

/// A query hit returned from `VectorStore::query`.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, items: Vec<VectorItem>) -> Result<()>;
    async fn query(&self, collection: &str, text: &str, k: usize) -> Result<Vec<VectorMatch>>;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn write(&self, name: &str, bytes: Vec<u8>) -> Result<String>;
    async fn read(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Injected for determinism in tests (§6).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Deterministic generation parameters hashed into the LLM Gateway's cache
/// key (§4.C). `model` is the symbolic name (`fast|smart|code`, §4.C); the
/// gateway resolves it to a concrete provider model id.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: String,
    pub deterministic_params: serde_json::Value,
}

/// The facade the DAG Scheduler's call handle depends on (§4.F step 4: "the
/// call handle ... exposes the LLM Gateway"). Kept here, rather than as a
/// direct dependency on `crate::llm::LLMGateway`, so `engine::scheduler`
/// never has to import `llm` — the gateway implements this trait instead of
/// the scheduler reaching into its internals.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<String>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock whose value only advances when told to, for deterministic
/// checkpoint-restore and retry tests (§8 property 4).
pub struct FixedClock {
    micros_since_epoch: AtomicI64,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros_since_epoch: AtomicI64::new(start.timestamp_micros()),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.micros_since_epoch
            .fetch_add(delta.num_microseconds().unwrap_or(0), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros_since_epoch.load(Ordering::SeqCst);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

/// In-memory vector store: cosine similarity over whatever embeddings were
/// upserted (or deterministically hashed, if none were provided — §6 "the
/// store may compute embeddings if not provided").
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Vec<VectorItem>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: &str, items: Vec<VectorItem>) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let entry = collections.entry(collection.to_string()).or_default();
        for item in items {
            if let Some(pos) = entry.iter().position(|existing| existing.id == item.id) {
                entry[pos] = item;
            } else {
                entry.push(item);
            }
        }
        Ok(())
    }

    async fn query(&self, collection: &str, text: &str, k: usize) -> Result<Vec<VectorMatch>> {
        let collections = self.collections.read().unwrap();
        let query_vec = hash_embedding(text, 32);
        let mut scored: Vec<VectorMatch> = collections
            .get(collection)
            .into_iter()
            .flatten()
            .map(|item| {
                let item_vec = item
                    .embedding
                    .clone()
                    .unwrap_or_else(|| hash_embedding(&item.text, 32));
                VectorMatch {
                    id: item.id.clone(),
                    text: item.text.clone(),
                    metadata: item.metadata.clone(),
                    score: cosine_similarity(&query_vec, &item_vec),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Deterministic, hash-based embedding so tests never depend on a real
/// model: enough to exercise `VectorStore`/`EmbeddingService` call sites
/// without pulling in an inference stack, which is explicitly out of scope.
pub struct NullEmbeddingService {
    dimension: usize,
}

impl NullEmbeddingService {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for NullEmbeddingService {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl EmbeddingService for NullEmbeddingService {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(text, self.dimension))
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embedding(t, self.dimension)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut vec = Vec::with_capacity(dimension);
    for i in 0..dimension {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        i.hash(&mut hasher);
        let bucket = (hasher.finish() % 2000) as f32 / 1000.0 - 1.0;
        vec.push(bucket);
    }
    vec
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// In-memory artifact sink: `name` maps to a `mem://<name>` reference.
#[derive(Default)]
pub struct InMemoryArtifactSink {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactSink for InMemoryArtifactSink {
    async fn write(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        let reference = format!("mem://{}", name);
        self.blobs.write().unwrap().insert(reference.clone(), bytes);
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| crate::error::OrchestratorError::Internal(format!("no such artifact: {reference}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vector_store_round_trips_exact_match_first() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "docs",
                vec![VectorItem {
                    id: "a".to_string(),
                    text: "hello world".to_string(),
                    metadata: serde_json::json!({}),
                    embedding: None,
                }],
            )
            .await
            .unwrap();
        let hits = store.query("docs", "hello world", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn fixed_clock_only_advances_when_told() {
        let clock = FixedClock::new(Utc::now());
        let t0 = clock.now();
        let t1 = clock.now();
        assert_eq!(t0, t1);
        clock.advance(chrono::Duration::seconds(5));
        assert!(clock.now() > t0);
    }
}
