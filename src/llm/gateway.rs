//! The LLM Gateway itself (§4.C): one object shared by every agent that
//! needs text generation. Owns the ordered provider fallback chain, each
//! provider's token-bucket rate limiter, and a singleflight content-hash
//! cache shared across the whole gateway.
//!
//! Token bucket: grounded on the teacher's spawn-a-background-tick-task
//! idiom (`ConnectionManager::start_cleanup_task` in the WebSocket layer) —
//! a `tokio::sync::Semaphore` sized to the requests-per-minute limit, with a
//! `tokio::time::interval` task adding one permit back per refill tick.
//!
//! Singleflight cache: a `dashmap::DashMap<CacheKey, CacheEntry>` where an
//! in-flight request is represented by a `tokio::sync::broadcast::Sender`
//! that every concurrent identical request subscribes to, so exactly one
//! upstream call happens per cache key no matter how many callers ask for it
//! at once (§4.C, §8 property 7).

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tracing::{info_span, warn, Instrument};

use super::traits::{GenerateOutcome, GenerateParams, LLMError, LLMResult, ProviderClient};
use super::{ApiKey, ProviderKey};

/// Content-hash cache key (§4.C: "hashes `(provider-key, model, prompt,
/// deterministic-params)`").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

fn compute_cache_key(provider: ProviderKey, model: &str, prompt: &str, params: &GenerateParams) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(provider.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(prompt.as_bytes());
    hasher.update(b"\0");
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    CacheKey(format!("{:x}", hasher.finalize()))
}

type CacheResult = LLMResult<GenerateOutcome>;

enum CacheEntry {
    InFlight(broadcast::Sender<CacheResult>),
    Ready(CacheResult, Instant),
}

/// Per-provider evenly-replenished token bucket (§4.C).
struct TokenBucket {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    refill_task: tokio::task::JoinHandle<()>,
}

impl TokenBucket {
    fn new(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute.max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(capacity));
        let refill_interval = Duration::from_secs_f64(60.0 / capacity as f64);
        let sem_for_task = semaphore.clone();
        let refill_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refill_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sem_for_task.available_permits() < capacity {
                    sem_for_task.add_permits(1);
                }
            }
        });
        Self { semaphore, capacity, refill_task }
    }

    /// Acquire a token before `deadline` elapses, or fail with `Timeout`
    /// (§4.C "`acquire()` blocks or returns with a deadline").
    async fn acquire(&self, deadline: Duration) -> LLMResult<()> {
        match tokio::time::timeout(deadline, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(LLMError::Upstream("rate limiter closed".to_string())),
            Err(_) => Err(LLMError::Timeout("rate limit token deadline exceeded".to_string())),
        }
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.refill_task.abort();
    }
}

/// One entry in the ordered provider chain (§4.C "Providers form an ordered
/// list").
pub struct ProviderSlot {
    pub key: ProviderKey,
    client: Arc<dyn ProviderClient>,
    limiter: TokenBucket,
    healthy: AtomicBool,
    #[allow(dead_code)]
    api_key: Option<ApiKey>,
}

impl ProviderSlot {
    pub fn new(
        key: ProviderKey,
        client: Arc<dyn ProviderClient>,
        requests_per_minute: u32,
        api_key: Option<ApiKey>,
    ) -> Self {
        Self {
            key,
            client,
            limiter: TokenBucket::new(requests_per_minute),
            healthy: AtomicBool::new(true),
            api_key,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Options for a single `generate` call (§4.C).
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Symbolic or provider-specific model name.
    pub model: String,
    pub params: GenerateParams,
    /// Per-call deadline for acquiring a rate-limit token (§5 "awaiting a
    /// rate-limit token inside the LLM Gateway" is a suspension point, not
    /// an unbounded block).
    pub token_deadline: Duration,
}

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
const MAX_RETRIES_PER_PROVIDER: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// The provider-agnostic text-generation facade (§4.C).
pub struct LLMGateway {
    providers: Vec<ProviderSlot>,
    cache: DashMap<CacheKey, CacheEntry>,
    cache_ttl: Duration,
    inflight_waiters: AtomicUsize,
}

/// Every provider in the chain failed, was unhealthy, or none are
/// configured (§7 `LLMUnavailable`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("no provider in the fallback chain could satisfy the request: {0}")]
pub struct LLMUnavailable(pub String);

impl LLMGateway {
    pub fn new(providers: Vec<ProviderSlot>) -> Self {
        Self {
            providers,
            cache: DashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            inflight_waiters: AtomicUsize::new(0),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Count of callers currently waiting on an in-flight singleflight call
    /// (diagnostic only, exercised by the singleflight test).
    pub fn inflight_waiters(&self) -> usize {
        self.inflight_waiters.load(Ordering::Relaxed)
    }

    /// `generate(prompt, options) -> text` (§4.C). Cache hit returns
    /// immediately; otherwise walks the fallback chain with bounded
    /// exponential retry inside each provider before moving to the next.
    pub async fn generate(&self, prompt: &str, options: GenerateOptions) -> LLMResult<GenerateOutcome> {
        if self.providers.is_empty() {
            return Err(LLMError::Upstream("no providers configured".to_string()));
        }
        let primary = self.providers[0].key;
        let key = compute_cache_key(primary, &options.model, prompt, &options.params);

        loop {
            let entry = self.cache.entry(key.clone());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(existing) => match existing.get() {
                    CacheEntry::Ready(result, inserted_at) => {
                        if inserted_at.elapsed() < self.cache_ttl {
                            return result.clone();
                        }
                        // Expired: fall through to re-issue, replacing this
                        // entry with a fresh in-flight marker below.
                        drop(existing);
                        self.cache.remove(&key);
                        continue;
                    }
                    CacheEntry::InFlight(sender) => {
                        let mut receiver = sender.subscribe();
                        drop(existing);
                        self.inflight_waiters.fetch_add(1, Ordering::Relaxed);
                        let result = receiver.recv().await;
                        self.inflight_waiters.fetch_sub(1, Ordering::Relaxed);
                        match result {
                            Ok(outcome) => return outcome,
                            Err(_) => continue, // leader dropped without sending; retry as leader
                        }
                    }
                },
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, _rx) = broadcast::channel(1);
                    vacant.insert(CacheEntry::InFlight(tx.clone()));
                    let outcome = self.call_chain(prompt, &options).await;
                    // §4.C: "Successful responses are cached with a TTL" —
                    // a transient chain failure must not be pinned in the
                    // cache for the full TTL, or every caller behind it
                    // would replay the same stale error instead of
                    // re-attempting the provider chain. Remove the
                    // in-flight marker so the next caller becomes the new
                    // leader; current waiters still get this result once.
                    if outcome.is_ok() {
                        self.cache
                            .insert(key.clone(), CacheEntry::Ready(outcome.clone(), Instant::now()));
                    } else {
                        self.cache.remove(&key);
                    }
                    let _ = tx.send(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    async fn call_chain(&self, prompt: &str, options: &GenerateOptions) -> LLMResult<GenerateOutcome> {
        let mut last_error = LLMError::Upstream("no providers configured".to_string());
        for slot in &self.providers {
            let Some(model) = slot.client.model_for(&options.model) else {
                continue;
            };
            let model = model.to_string();
            if let Err(err) = slot.limiter.acquire(options.token_deadline).await {
                last_error = err;
                continue;
            }

            let mut attempt = 0;
            loop {
                attempt += 1;
                let started = Instant::now();
                let span = info_span!(
                    "llm.request",
                    provider = %slot.key,
                    model = %model,
                    cache_hit = false,
                    duration_ms = tracing::field::Empty,
                    token_count = tracing::field::Empty,
                );
                let call = slot.client.generate(&model, prompt, &options.params).instrument(span.clone());
                match call.await {
                    Ok(outcome) => {
                        slot.healthy.store(true, Ordering::Relaxed);
                        span.record("duration_ms", started.elapsed().as_millis() as u64);
                        if let Some(tokens) = outcome.token_count {
                            span.record("token_count", tokens);
                        }
                        return Ok(outcome);
                    }
                    Err(err @ LLMError::InvalidRequest(_)) => {
                        // Not retryable and not a fallback candidate: the
                        // prompt itself is malformed, every provider would
                        // reject it the same way.
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(provider = %slot.key, attempt, error = %err, "llm.request failed");
                        last_error = err;
                        if attempt >= MAX_RETRIES_PER_PROVIDER {
                            slot.healthy.store(false, Ordering::Relaxed);
                            break;
                        }
                        tokio::time::sleep(RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1)).await;
                    }
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait::async_trait]
impl crate::collaborators::TextGenerator for LLMGateway {
    async fn generate(&self, prompt: &str, options: crate::collaborators::GenerateOptions) -> crate::error::Result<String> {
        let gateway_options = GenerateOptions {
            model: options.model,
            params: serde_json::from_value(options.deterministic_params).unwrap_or_default(),
            token_deadline: Duration::from_secs(10),
        };
        self.generate(prompt, gateway_options)
            .await
            .map(|outcome| outcome.text)
            .map_err(|err| crate::error::OrchestratorError::LLMUnavailable(err.to_string()))
    }
}
