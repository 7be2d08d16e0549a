//! System prompt provision
//!
//! Rendered system prompts are cached keyed by (model, context, tenant
//! hash) with a TTL and an entry-count ceiling. Hits refresh entry
//! metadata only; eviction takes the oldest entry by last access. A
//! background sweep clears expired entries so misses stay cheap.
//!
//! Prompt loading failures never fail a request: the service logs a
//! warning, counts the degradation, and substitutes a built-in minimal
//! prompt.

use crate::brain::BrainRequest;
use crate::error::{BrainError, BrainResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Served when the loader cannot produce a prompt
const MINIMAL_SYSTEM_PROMPT: &str = "You are a helpful assistant for a task-management \
workspace. Answer concisely and accurately. When tools are available and the user asks \
for an action, use them instead of describing what you would do.";

/// Parameters handed to the prompt loader
#[derive(Debug, Clone, Copy)]
pub struct PromptParams<'a> {
    pub model_id: &'a str,
    pub context_id: Option<&'a str>,
    pub specialist_id: Option<&'a str>,
    pub now_epoch_secs: u64,
}

/// Collaborator seam: renders a system prompt for the given parameters
#[async_trait]
pub trait PromptLoader: Send + Sync {
    async fn load(&self, params: PromptParams<'_>) -> BrainResult<String>;
}

/// Loads prompt templates from a directory: `{model_id}.md` first, then
/// `default.md`.
pub struct TemplateLoader {
    dir: PathBuf,
}

impl TemplateLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PromptLoader for TemplateLoader {
    async fn load(&self, params: PromptParams<'_>) -> BrainResult<String> {
        let candidates = [
            self.dir.join(format!("{}.md", params.model_id)),
            self.dir.join("default.md"),
        ];
        for path in &candidates {
            match tokio::fs::read_to_string(path).await {
                Ok(template) => return Ok(template),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BrainError::Internal(format!(
                        "prompt template {} unreadable: {e}",
                        path.display()
                    )));
                }
            }
        }
        Err(BrainError::Internal(format!(
            "no prompt template for model {} under {}",
            params.model_id,
            self.dir.display()
        )))
    }
}

/// Read-only seam to persisted conversation summaries
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn recent_summary(&self, context_id: &str) -> BrainResult<Option<String>>;
}

/// Default store for deployments without summary persistence
pub struct NoSummaries;

#[async_trait]
impl SummaryStore for NoSummaries {
    async fn recent_summary(&self, _context_id: &str) -> BrainResult<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PromptKey {
    model: String,
    context: Option<String>,
    tenant_hash: u64,
}

impl PromptKey {
    fn new(model: &str, context: Option<&str>, specialist: Option<&str>) -> Self {
        let mut hasher = DefaultHasher::new();
        specialist.hash(&mut hasher);
        Self {
            model: model.to_string(),
            context: context.map(str::to_string),
            tenant_hash: hasher.finish(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    created_at_secs: u64,
    ttl_seconds: u64,
    access_count: u64,
    /// Monotonic touch sequence; the eviction victim is the minimum
    last_access_seq: u64,
    estimated_size_bytes: usize,
}

impl CacheEntry {
    fn expired(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.created_at_secs) >= self.ttl_seconds
    }
}

/// Bounded TTL cache for rendered prompts
pub struct PromptCache {
    max_entries: usize,
    ttl_seconds: u64,
    entries: Mutex<HashMap<PromptKey, CacheEntry>>,
    touch_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PromptCache {
    pub fn new(max_entries: usize, ttl_seconds: u64) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl_seconds,
            entries: Mutex::new(HashMap::new()),
            touch_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PromptKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_at(&self, now_secs: u64, key: &PromptKey) -> Option<String> {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expired(now_secs) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access_seq = self.touch_seq.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert_at(&self, now_secs: u64, key: PromptKey, value: String) {
        let mut entries = self.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access_seq)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                if let Some(evicted) = entries.remove(&victim) {
                    tracing::debug!(
                        accesses = evicted.access_count,
                        "prompt cache at capacity, evicted least recently used entry"
                    );
                }
            }
        }
        let estimated_size_bytes = value.len();
        entries.insert(
            key,
            CacheEntry {
                value,
                created_at_secs: now_secs,
                ttl_seconds: self.ttl_seconds,
                access_count: 0,
                last_access_seq: self.touch_seq.fetch_add(1, Ordering::Relaxed),
                estimated_size_bytes,
            },
        );
    }

    /// Remove expired entries; returns how many were dropped
    pub fn sweep(&self) -> usize {
        self.sweep_at(epoch_secs())
    }

    pub(crate) fn sweep_at(&self, now_secs: u64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now_secs));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn estimated_total_bytes(&self) -> usize {
        self.lock().values().map(|e| e.estimated_size_bytes).sum()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Where a resolved system prompt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    /// Served from the cache
    Cache,
    /// Loaded from the underlying source on a cache miss
    Loaded,
    /// Loader failed; the built-in minimal prompt was served
    Fallback,
}

/// Caching prompt provider with built-in degradation
pub struct PromptService {
    loader: std::sync::Arc<dyn PromptLoader>,
    summaries: std::sync::Arc<dyn SummaryStore>,
    cache: PromptCache,
    fallbacks: AtomicU64,
}

impl PromptService {
    pub fn new(
        loader: std::sync::Arc<dyn PromptLoader>,
        max_entries: usize,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            loader,
            summaries: std::sync::Arc::new(NoSummaries),
            cache: PromptCache::new(max_entries, ttl_seconds),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Use a summary store instead of the default no-op one.
    pub fn with_summary_store(mut self, summaries: std::sync::Arc<dyn SummaryStore>) -> Self {
        self.summaries = summaries;
        self
    }

    /// Resolve the system prompt for a request. Never fails: loader errors
    /// degrade to the built-in minimal prompt.
    ///
    /// When the request names a context and the summary store holds a prior
    /// conversation summary for it, the summary is appended as a section.
    /// Summaries change as conversations grow, so only the base prompt is
    /// cached.
    pub async fn system_prompt(&self, request: &BrainRequest) -> (String, PromptSource) {
        let now = epoch_secs();
        let key = PromptKey::new(
            request.selected_model(),
            request.context_id(),
            request.specialist_id(),
        );
        if let Some(cached) = self.cache.get_at(now, &key) {
            let prompt = self.with_summary(cached, request.context_id()).await;
            return (prompt, PromptSource::Cache);
        }

        let params = PromptParams {
            model_id: request.selected_model(),
            context_id: request.context_id(),
            specialist_id: request.specialist_id(),
            now_epoch_secs: now,
        };
        match self.loader.load(params).await {
            Ok(prompt) => {
                self.cache.insert_at(now, key, prompt.clone());
                let prompt = self.with_summary(prompt, request.context_id()).await;
                (prompt, PromptSource::Loaded)
            }
            Err(e) => {
                tracing::warn!(
                    model = request.selected_model(),
                    error = %e,
                    "Prompt load failed; serving built-in minimal prompt"
                );
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                let prompt = self
                    .with_summary(MINIMAL_SYSTEM_PROMPT.to_string(), request.context_id())
                    .await;
                (prompt, PromptSource::Fallback)
            }
        }
    }

    /// Append the prior-conversation summary section when one exists.
    /// Lookup failures never fail prompt resolution.
    async fn with_summary(&self, base: String, context_id: Option<&str>) -> String {
        let Some(context_id) = context_id else {
            return base;
        };
        match self.summaries.recent_summary(context_id).await {
            Ok(Some(summary)) => {
                format!("{base}\n\nSummary of the conversation so far:\n{summary}")
            }
            Ok(None) => base,
            Err(e) => {
                tracing::warn!(
                    context_id,
                    error = %e,
                    "Summary lookup failed; continuing without it"
                );
                base
            }
        }
    }

    pub fn cache(&self) -> &PromptCache {
        &self.cache
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
