//! Two-tier cache layer
//!
//! Hot tier: a fixed-capacity ring of recent ticks plus the last depth
//! snapshot, per symbol. A symbol-level LRU bounds how many symbols stay
//! resident. An optional shared tier (cross-process key-value store with
//! TTL entries) is written through on accept and read through on hot-tier
//! miss; hot-tier hits never touch it.
//!
//! Writes for a symbol come from exactly one lane worker. Reads from
//! elsewhere (dispatcher bootstrap, REST-style queries) take short-lived
//! entry locks and clone out a snapshot; no lock is held across await.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;
use types::ids::Symbol;

use crate::config::CacheConfig;
use crate::events::{DepthSnapshot, Tick};
use crate::metrics::PipelineMetrics;

/// Errors from the shared cache tier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("shared tier unavailable: {0}")]
    Unavailable(String),

    #[error("shared tier serialization failed: {0}")]
    Serialization(String),
}

/// Cross-process cache tier. Entries carry an absolute expiry so reads
/// are deterministic given a clock value.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Store the recent-tick window for a symbol.
    async fn put_ticks(
        &self,
        symbol: &Symbol,
        ticks: &[Tick],
        expires_at: i64,
    ) -> Result<(), CacheError>;

    /// Fetch the recent-tick window for a symbol, honoring expiry.
    async fn get_ticks(&self, symbol: &Symbol, now: i64) -> Result<Option<Vec<Tick>>, CacheError>;
}

/// In-process [`SharedTier`] implementation.
///
/// Serves as the default tier in tests and single-instance deployments;
/// a networked store implements the same trait in multi-instance setups.
pub struct MemoryTier {
    entries: DashMap<Symbol, (i64, Vec<u8>)>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of unexpired and expired entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedTier for MemoryTier {
    async fn put_ticks(
        &self,
        symbol: &Symbol,
        ticks: &[Tick],
        expires_at: i64,
    ) -> Result<(), CacheError> {
        let payload =
            serde_json::to_vec(ticks).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.entries.insert(symbol.clone(), (expires_at, payload));
        Ok(())
    }

    async fn get_ticks(&self, symbol: &Symbol, now: i64) -> Result<Option<Vec<Tick>>, CacheError> {
        match self.entries.get(symbol) {
            Some(entry) => {
                let (expires_at, payload) = entry.value();
                if *expires_at <= now {
                    return Ok(None);
                }
                let ticks = serde_json::from_slice(payload)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                Ok(Some(ticks))
            }
            None => Ok(None),
        }
    }
}

/// Hot-tier state for one symbol: ring of recent ticks + last depth.
#[derive(Debug)]
pub struct SymbolCacheEntry {
    ticks: VecDeque<Tick>,
    capacity: usize,
    depth: Option<DepthSnapshot>,
}

impl SymbolCacheEntry {
    pub fn new(capacity: usize) -> Self {
        Self {
            ticks: VecDeque::with_capacity(capacity),
            capacity,
            depth: None,
        }
    }

    /// Insert a tick, evicting the oldest when at capacity. Updates the
    /// depth snapshot when the tick carries one.
    pub fn insert(&mut self, tick: Tick) {
        if let Some(snap) = tick.depth_snapshot() {
            self.depth = Some(snap);
        }
        if self.ticks.len() >= self.capacity {
            self.ticks.pop_front();
        }
        self.ticks.push_back(tick);
    }

    /// Up to `n` most recent ticks, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Tick> {
        let skip = self.ticks.len().saturating_sub(n);
        self.ticks.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn depth(&self) -> Option<&DepthSnapshot> {
        self.depth.as_ref()
    }
}

/// Recency index over resident symbols.
///
/// A monotonic touch counter keyed both ways: symbol → stamp for
/// updates, stamp → symbol (BTreeMap) so the eviction victim is the
/// minimum key.
#[derive(Debug, Default)]
struct LruIndex {
    counter: u64,
    stamp_of: HashMap<Symbol, u64>,
    by_stamp: BTreeMap<u64, Symbol>,
}

impl LruIndex {
    fn touch(&mut self, symbol: &Symbol) {
        self.counter += 1;
        if let Some(old) = self.stamp_of.insert(symbol.clone(), self.counter) {
            self.by_stamp.remove(&old);
        }
        self.by_stamp.insert(self.counter, symbol.clone());
    }

    fn remove(&mut self, symbol: &Symbol) {
        if let Some(stamp) = self.stamp_of.remove(symbol) {
            self.by_stamp.remove(&stamp);
        }
    }

    /// Least-recently-touched symbol, excluding `keep`.
    fn victim(&self, keep: &Symbol) -> Option<Symbol> {
        self.by_stamp
            .values()
            .find(|s| *s != keep)
            .cloned()
    }

    fn len(&self) -> usize {
        self.stamp_of.len()
    }
}

/// The cache layer shared across the service.
pub struct CacheLayer {
    entries: DashMap<Symbol, SymbolCacheEntry>,
    lru: Mutex<LruIndex>,
    shared: Option<Arc<dyn SharedTier>>,
    config: CacheConfig,
    metrics: Arc<PipelineMetrics>,
}

impl CacheLayer {
    pub fn new(config: CacheConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            entries: DashMap::new(),
            lru: Mutex::new(LruIndex::default()),
            shared: None,
            config,
            metrics,
        }
    }

    /// Attach a shared tier (write-through / read-through).
    pub fn with_shared_tier(mut self, tier: Arc<dyn SharedTier>) -> Self {
        self.shared = Some(tier);
        self
    }

    /// Insert an accepted tick into the hot tier.
    ///
    /// Touches the symbol's LRU slot; inserting a previously-unseen
    /// symbol at capacity evicts the least-recently-touched one.
    /// Returns the evicted symbol, if any.
    pub fn insert(&self, tick: Tick) -> Option<Symbol> {
        let symbol = tick.symbol.clone();
        let mut evicted = None;

        {
            let mut lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());
            let is_new = !lru.stamp_of.contains_key(&symbol);
            lru.touch(&symbol);
            if is_new && lru.len() > self.config.max_symbols {
                if let Some(victim) = lru.victim(&symbol) {
                    lru.remove(&victim);
                    evicted = Some(victim);
                }
            }
        }

        if let Some(victim) = &evicted {
            self.entries.remove(victim);
            self.metrics.cache_evictions.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %victim, "Evicted least-recently-touched symbol");
        }

        self.entries
            .entry(symbol)
            .or_insert_with(|| SymbolCacheEntry::new(self.config.ring_capacity))
            .insert(tick);

        evicted
    }

    /// Up to `n` most recent ticks in arrival order; empty for unknown
    /// symbols. Hot-tier only, so it never blocks on network I/O.
    pub fn get_recent(&self, symbol: &Symbol, n: usize) -> Vec<Tick> {
        match self.entries.get(symbol) {
            Some(entry) => {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                let ticks = entry.recent(n);
                drop(entry);
                self.lru
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .touch(symbol);
                ticks
            }
            None => {
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        }
    }

    /// Recent ticks with shared-tier read-through on hot miss.
    pub async fn fetch_recent(&self, symbol: &Symbol, n: usize, now: i64) -> Vec<Tick> {
        let hot = self.get_recent(symbol, n);
        if !hot.is_empty() {
            return hot;
        }
        let Some(tier) = &self.shared else {
            return hot;
        };
        match tier.get_ticks(symbol, now).await {
            Ok(Some(ticks)) => {
                let skip = ticks.len().saturating_sub(n);
                ticks.into_iter().skip(skip).collect()
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                debug!(symbol = %symbol, error = %err, "Shared tier read failed");
                Vec::new()
            }
        }
    }

    /// Push the symbol's recent window to the shared tier.
    pub async fn write_through(&self, symbol: &Symbol, now: i64) {
        let Some(tier) = &self.shared else {
            return;
        };
        let ticks = match self.entries.get(symbol) {
            Some(entry) => entry.recent(self.config.ring_capacity),
            None => return,
        };
        let expires_at = now + self.config.shared_ttl_nanos;
        if let Err(err) = tier.put_ticks(symbol, &ticks, expires_at).await {
            debug!(symbol = %symbol, error = %err, "Shared tier write failed");
        }
    }

    /// Last-known depth snapshot for a symbol.
    pub fn depth(&self, symbol: &Symbol) -> Option<DepthSnapshot> {
        self.entries.get(symbol).and_then(|e| e.depth().cloned())
    }

    /// Ticks currently cached for a symbol.
    pub fn len(&self, symbol: &Symbol) -> usize {
        self.entries.get(symbol).map(|e| e.len()).unwrap_or(0)
    }

    /// Number of resident symbols.
    pub fn resident_symbols(&self) -> usize {
        self.entries.len()
    }
}
