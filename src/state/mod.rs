// Enhanced State Management
// "Show the future early, keep the past until it is safe to forget"

mod propagation;
mod recovery;


pub use propagation::patch_entity;
pub use recovery::StateRecoveryMechanism;

use crate::cache::{query_keys, QueryCache, QueryKey};
use crate::error::log::ErrorLogger;
use crate::error::{DocFiscalResult, ErrorContext, TypedError};
use crate::service::{Order, OrderStatus, ServiceQueryFetcher, SharedService};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// How an update treats the cache before the server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Write the new value into the cache before the request completes
    pub optimistic: bool,
    /// Restore the pre-update snapshot if the request fails
    pub rollback_on_error: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            optimistic: true,
            rollback_on_error: true,
        }
    }
}

/// Snapshot held between "apply optimistic" and "commit or rollback".
///
/// `previous_value` is the value before the FIRST pending update to the key;
/// later optimistic writes only move `applied_value`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimisticUpdateRecord {
    pub query_key: QueryKey,
    pub previous_value: Option<Value>,
    pub applied_value: Option<Value>,
}

/// Outcome of [`EnhancedStateManager::update_order_status`]
#[derive(Debug)]
pub struct StateUpdateResult {
    pub success: bool,
    pub order: Option<Order>,
    pub error: Option<TypedError>,
    pub recovery: Option<StateRecoveryMechanism>,
}

struct StateManagerInner {
    cache: Arc<QueryCache>,
    service: SharedService,
    logger: Option<Arc<ErrorLogger>>,
    pending: Mutex<HashMap<QueryKey, OptimisticUpdateRecord>>,
    batch_lock: tokio::sync::Mutex<()>,
}

/// Optimistic cache updates with snapshot rollback and propagation of
/// entity changes to every cached view that embeds the entity.
#[derive(Clone)]
pub struct EnhancedStateManager {
    inner: Arc<StateManagerInner>,
}

impl EnhancedStateManager {
    /// Create a manager and register the service as the cache's fetcher for
    /// order and payment queries.
    pub fn new(cache: Arc<QueryCache>, service: SharedService) -> Self {
        Self::build(cache, service, None)
    }

    /// Like [`Self::new`], also recording failed updates in the error log
    pub fn with_logger(
        cache: Arc<QueryCache>,
        service: SharedService,
        logger: Arc<ErrorLogger>,
    ) -> Self {
        Self::build(cache, service, Some(logger))
    }

    fn build(
        cache: Arc<QueryCache>,
        service: SharedService,
        logger: Option<Arc<ErrorLogger>>,
    ) -> Self {
        let fetcher = Arc::new(ServiceQueryFetcher::new(Arc::clone(&service)));
        cache.register_fetcher(query_keys::orders(), fetcher.clone());
        cache.register_fetcher(query_keys::payments(), fetcher);

        Self {
            inner: Arc::new(StateManagerInner {
                cache,
                service,
                logger,
                pending: Mutex::new(HashMap::new()),
                batch_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.inner.cache
    }

    pub fn service(&self) -> &SharedService {
        &self.inner.service
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<QueryKey, OptimisticUpdateRecord>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every cached key holding a copy of the entity, including its own key
    fn entity_keys(&self, entity_id: &str) -> BTreeSet<QueryKey> {
        let cache = &self.inner.cache;
        let mut keys: BTreeSet<QueryKey> = cache.keys_containing(entity_id).into_iter().collect();
        let own = query_keys::order(entity_id);
        if cache.get_query_data(&own).is_some() {
            keys.insert(own);
        }
        keys
    }

    /// Record a snapshot of `key` unless one is already pending.
    /// The first snapshot is the rollback baseline.
    fn snapshot(&self, key: &QueryKey) {
        let mut pending = self.pending();
        if !pending.contains_key(key) {
            let current = self.inner.cache.get_query_data(key);
            pending.insert(
                key.clone(),
                OptimisticUpdateRecord {
                    query_key: key.clone(),
                    previous_value: current.clone(),
                    applied_value: current,
                },
            );
        }
    }

    /// Write `value` under `key` ahead of the server, keeping the original
    /// value for rollback.
    pub fn apply_optimistic_update(&self, key: QueryKey, value: Value) {
        self.snapshot(&key);
        if let Some(record) = self.pending().get_mut(&key) {
            record.applied_value = Some(value.clone());
        }
        self.inner.cache.set_query_data(key.clone(), value);
        debug!(key = %key, "Optimistic update applied");
    }

    /// Forget the snapshot for `key`; the current value stays
    pub fn commit_optimistic_update(&self, key: &QueryKey) -> bool {
        self.pending().remove(key).is_some()
    }

    /// Restore the snapshot for `key`. Returns `false` when no snapshot is
    /// pending, which makes a second rollback a no-op.
    pub fn rollback_optimistic_update(&self, key: &QueryKey) -> bool {
        let record = match self.pending().remove(key) {
            Some(record) => record,
            None => return false,
        };

        match record.previous_value {
            Some(previous) => self.inner.cache.set_query_data(key.clone(), previous),
            None => {
                self.inner.cache.remove_query(key);
            }
        }
        warn!(key = %key, "↩️ Optimistic update rolled back");
        true
    }

    /// Snapshots currently awaiting commit or rollback
    pub fn pending_updates(&self) -> Vec<OptimisticUpdateRecord> {
        let mut records: Vec<OptimisticUpdateRecord> = self.pending().values().cloned().collect();
        records.sort_by(|a, b| a.query_key.cmp(&b.query_key));
        records
    }

    pub fn has_pending_update(&self, key: &QueryKey) -> bool {
        self.pending().contains_key(key)
    }

    /// Merge `patch` into every cached copy of the entity. Returns the number
    /// of cache entries that changed.
    pub fn propagate_state_changes(&self, entity_id: &str, patch: &Map<String, Value>) -> usize {
        let cache = &self.inner.cache;
        let mut updated = 0;

        for key in self.entity_keys(entity_id) {
            let Some(mut data) = cache.get_query_data(&key) else {
                continue;
            };
            if patch_entity(&mut data, entity_id, patch) {
                cache.set_query_data(key.clone(), data.clone());
                if let Some(record) = self.pending().get_mut(&key) {
                    record.applied_value = Some(data);
                }
                updated += 1;
            }
        }

        debug!(entity_id, updated, "State changes propagated");
        updated
    }

    /// Store the server's copy of an order and patch every view embedding it
    fn apply_server_order(&self, order: &Order) -> DocFiscalResult<usize> {
        let value = serde_json::to_value(order)?;
        let patch = match &value {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        self.inner
            .cache
            .set_query_data(query_keys::order(&order.id), value);
        Ok(self.propagate_state_changes(&order.id, &patch))
    }

    /// Change an order's status with optional optimistic write and rollback.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        options: UpdateOptions,
    ) -> StateUpdateResult {
        let keys = self.entity_keys(order_id);

        if options.optimistic || options.rollback_on_error {
            for key in &keys {
                self.snapshot(key);
            }
        }

        if options.optimistic {
            let mut patch = Map::new();
            patch.insert("status".to_string(), Value::from(status.as_str()));
            self.propagate_state_changes(order_id, &patch);
        }

        match self.inner.service.update_order_status(order_id, status).await {
            Ok(order) => {
                if let Err(e) = self.apply_server_order(&order) {
                    warn!(order_id, error = %e, "Failed to cache updated order");
                }
                for key in &keys {
                    self.commit_optimistic_update(key);
                }
                info!(order_id, status = %order.status, "✅ Order status updated");

                StateUpdateResult {
                    success: true,
                    order: Some(order),
                    error: None,
                    recovery: None,
                }
            }
            Err(error) => {
                let recovery = self.handle_state_failure(order_id, status, &error, options);
                StateUpdateResult {
                    success: false,
                    order: None,
                    error: Some(error),
                    recovery: Some(recovery),
                }
            }
        }
    }

    /// Log a failed update, roll back if requested, and hand back the
    /// operations the caller can use to recover.
    pub fn handle_state_failure(
        &self,
        order_id: &str,
        status: OrderStatus,
        error: &TypedError,
        options: UpdateOptions,
    ) -> StateRecoveryMechanism {
        match &self.inner.logger {
            Some(logger) => {
                let mut context = ErrorContext::new();
                context.insert("order_id".to_string(), Value::from(order_id));
                context.insert("target_status".to_string(), Value::from(status.as_str()));
                logger.log_error(error, context);
            }
            None => crate::log_error!(error, "Order status update failed", order_id),
        }

        let keys: Vec<QueryKey> = self
            .entity_keys(order_id)
            .into_iter()
            .filter(|key| self.has_pending_update(key))
            .collect();

        if options.rollback_on_error {
            let restored = keys
                .iter()
                .filter(|key| self.rollback_optimistic_update(key))
                .count();
            debug!(order_id, restored, "Rolled back after failed update");
        }

        StateRecoveryMechanism::new(self.clone(), order_id.to_string(), status, options, keys)
    }

    /// Invalidate every cached copy of an order, refetch it from the service
    /// and propagate the fresh copy. The order's own entry ends fresh; every
    /// other view stays invalidated for its next fetch.
    pub async fn ensure_data_consistency(&self, order_id: &str) -> DocFiscalResult<Order> {
        let keys = self.entity_keys(order_id);
        for key in &keys {
            self.inner.cache.invalidate_query(key);
        }
        let own = query_keys::order(order_id);
        self.inner.cache.invalidate_query(&own);

        let fresh = self.inner.cache.fetch_query(&own).await?;
        let order: Order = serde_json::from_value(fresh)?;
        self.apply_server_order(&order)?;
        // Patching clears the flag, but views embedding the order still hold
        // other entities that were never refetched
        for key in keys.iter().filter(|key| **key != own) {
            self.inner.cache.invalidate_query(key);
        }
        info!(order_id, invalidated = keys.len(), "🔄 Order data refreshed");
        Ok(order)
    }

    /// Apply updates one after another, never concurrently
    pub async fn batch_update_order_status(
        &self,
        updates: Vec<(String, OrderStatus)>,
        options: UpdateOptions,
    ) -> Vec<StateUpdateResult> {
        let _batch = self.inner.batch_lock.lock().await;
        let mut results = Vec::with_capacity(updates.len());
        for (order_id, status) in updates {
            results.push(self.update_order_status(&order_id, status, options).await);
        }
        results
    }
}
