// Query Cache
// "One copy of the truth, many ways to look at it"

mod index;
mod key;


pub use index::{collect_entity_ids, EntityIndex};
pub use key::{query_keys, QueryKey};

use crate::error::{DocFiscalResult, TypedError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cached value plus bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryState {
    pub data: Value,
    /// Set by invalidation; the next [`QueryCache::fetch_query`] goes to the network
    pub is_invalidated: bool,
    pub updated_at: DateTime<Utc>,
    /// Number of times the value came from a fetcher
    pub fetch_count: u32,
}

/// Change notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Updated(QueryKey),
    Removed(QueryKey),
    Invalidated(QueryKey),
    Refetched(QueryKey),
}

/// Loads fresh data for keys under a registered prefix
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> DocFiscalResult<Value>;
}

/// Shared key/value query cache.
///
/// Values go in and come out as owned copies; callers never mutate a stored
/// value in place. Every write refreshes the [`EntityIndex`] so the keys that
/// embed a given entity can be found without scanning the cache.
pub struct QueryCache {
    entries: DashMap<QueryKey, QueryState>,
    index: EntityIndex,
    fetchers: RwLock<Vec<(QueryKey, Arc<dyn QueryFetcher>)>>,
    events: broadcast::Sender<CacheEvent>,
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            index: EntityIndex::new(),
            fetchers: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.entries.get(key).map(|state| state.data.clone())
    }

    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.entries.get(key).map(|state| state.clone())
    }

    pub fn is_invalidated(&self, key: &QueryKey) -> bool {
        self.entries
            .get(key)
            .map(|state| state.is_invalidated)
            .unwrap_or(false)
    }

    /// Store a value, replacing whatever was cached under `key`
    pub fn set_query_data(&self, key: QueryKey, data: Value) {
        self.store(key, data, false);
    }

    /// Replace the value under `key` with `updater(current)`.
    ///
    /// The updater runs without any cache lock held, so it may read the
    /// cache. The write only lands if the entry is unchanged since it was
    /// read; otherwise the updater runs again on the newer value.
    pub fn set_query_data_with<F>(&self, key: QueryKey, mut updater: F) -> Value
    where
        F: FnMut(Option<&Value>) -> Value,
    {
        loop {
            let current = self.get_query_data(&key);
            let data = updater(current.as_ref());

            let written = match self.entries.entry(key.clone()) {
                Entry::Occupied(mut occupied) if Some(&occupied.get().data) == current.as_ref() => {
                    let state = occupied.get_mut();
                    state.data = data.clone();
                    state.is_invalidated = false;
                    state.updated_at = Utc::now();
                    true
                }
                Entry::Vacant(vacant) if current.is_none() => {
                    vacant.insert(QueryState {
                        data: data.clone(),
                        is_invalidated: false,
                        updated_at: Utc::now(),
                        fetch_count: 0,
                    });
                    true
                }
                _ => false,
            };

            if written {
                self.index.update(&key, collect_entity_ids(&data));
                let _ = self.events.send(CacheEvent::Updated(key));
                return data;
            }
            debug!(key = %key, "Cache entry changed during update, retrying");
        }
    }

    fn store(&self, key: QueryKey, data: Value, fetched: bool) {
        let ids = collect_entity_ids(&data);
        let now = Utc::now();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                state.data = data;
                state.is_invalidated = false;
                state.updated_at = now;
                if fetched {
                    state.fetch_count += 1;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(QueryState {
                    data,
                    is_invalidated: false,
                    updated_at: now,
                    fetch_count: u32::from(fetched),
                });
            }
        }

        self.index.update(&key, ids);
        let event = if fetched {
            CacheEvent::Refetched(key)
        } else {
            CacheEvent::Updated(key)
        };
        let _ = self.events.send(event);
    }

    pub fn remove_query(&self, key: &QueryKey) -> Option<Value> {
        let removed = self.entries.remove(key).map(|(_, state)| state.data);
        if removed.is_some() {
            self.index.remove_key(key);
            let _ = self.events.send(CacheEvent::Removed(key.clone()));
        }
        removed
    }

    /// Cached keys starting with `prefix`, in key order
    pub fn matching_keys(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Mark every key under `prefix` stale; returns how many were marked
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let keys = self.matching_keys(prefix);
        let mut invalidated = 0;

        for key in keys {
            if let Some(mut state) = self.entries.get_mut(&key) {
                state.is_invalidated = true;
                invalidated += 1;
            }
            let _ = self.events.send(CacheEvent::Invalidated(key));
        }

        debug!(prefix = %prefix, invalidated, "Queries invalidated");
        invalidated
    }

    /// Mark exactly `key` stale
    pub fn invalidate_query(&self, key: &QueryKey) -> bool {
        let invalidated = match self.entries.get_mut(key) {
            Some(mut state) => {
                state.is_invalidated = true;
                true
            }
            None => false,
        };
        if invalidated {
            let _ = self.events.send(CacheEvent::Invalidated(key.clone()));
        }
        invalidated
    }

    /// Register the fetcher used for keys under `prefix`. The longest
    /// registered prefix wins.
    pub fn register_fetcher(&self, prefix: QueryKey, fetcher: Arc<dyn QueryFetcher>) {
        if let Ok(mut fetchers) = self.fetchers.write() {
            fetchers.retain(|(existing, _)| existing != &prefix);
            fetchers.push((prefix, fetcher));
        }
    }

    fn fetcher_for(&self, key: &QueryKey) -> Option<Arc<dyn QueryFetcher>> {
        let fetchers = self.fetchers.read().ok()?;
        fetchers
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, fetcher)| Arc::clone(fetcher))
    }

    async fn fetch_into(&self, key: &QueryKey) -> DocFiscalResult<Value> {
        let fetcher = self.fetcher_for(key).ok_or_else(|| {
            TypedError::client("No fetcher registered for query")
                .with_context("query_key", key.to_string())
        })?;

        let data = fetcher.fetch(key).await?;
        self.store(key.clone(), data.clone(), true);
        Ok(data)
    }

    /// Read through the cache: fresh values are served from memory, missing
    /// or invalidated ones are fetched and stored.
    pub async fn fetch_query(&self, key: &QueryKey) -> DocFiscalResult<Value> {
        if let Some(state) = self.entries.get(key) {
            if !state.is_invalidated {
                return Ok(state.data.clone());
            }
        }
        self.fetch_into(key).await
    }

    /// Refetch every cached key under `prefix` that has a fetcher.
    ///
    /// All keys are attempted; the first failure is returned after the rest
    /// have been tried.
    pub async fn refetch_queries(&self, prefix: &QueryKey) -> DocFiscalResult<usize> {
        let mut refetched = 0;
        let mut first_error = None;

        for key in self.matching_keys(prefix) {
            if self.fetcher_for(&key).is_none() {
                debug!(key = %key, "No fetcher for query, skipping refetch");
                continue;
            }
            match self.fetch_into(&key).await {
                Ok(_) => refetched += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Query refetch failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(refetched),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every entry, in key order
    pub fn get_all(&self) -> Vec<(QueryKey, QueryState)> {
        let mut all: Vec<(QueryKey, QueryState)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Keys whose cached value embeds the entity
    pub fn keys_containing(&self, entity_id: &str) -> Vec<QueryKey> {
        self.index.keys_for(entity_id)
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        let keys: Vec<QueryKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove_query(&key);
        }
        self.index.clear();
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
