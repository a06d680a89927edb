use super::{EnhancedStateManager, StateUpdateResult, UpdateOptions};
use crate::cache::{query_keys, QueryKey};
use crate::error::DocFiscalResult;
use crate::service::{Order, OrderStatus};
use tracing::debug;

/// Ways out of a failed state update, handed to the caller by
/// [`EnhancedStateManager::handle_state_failure`].
#[derive(Clone)]
pub struct StateRecoveryMechanism {
    manager: EnhancedStateManager,
    order_id: String,
    status: OrderStatus,
    options: UpdateOptions,
    keys: Vec<QueryKey>,
}

impl StateRecoveryMechanism {
    pub(super) fn new(
        manager: EnhancedStateManager,
        order_id: String,
        status: OrderStatus,
        options: UpdateOptions,
        keys: Vec<QueryKey>,
    ) -> Self {
        Self {
            manager,
            order_id,
            status,
            options,
            keys,
        }
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// Refetch the order from the service and propagate the fresh copy
    pub async fn retry(&self) -> DocFiscalResult<Order> {
        self.manager.ensure_data_consistency(&self.order_id).await
    }

    /// Issue the failed update again with the same options
    pub async fn retry_update(&self) -> StateUpdateResult {
        self.manager
            .update_order_status(&self.order_id, self.status, self.options)
            .await
    }

    /// Restore the pre-update snapshots that are still pending. Once they are
    /// gone this does nothing and returns `false`.
    pub fn rollback(&self) -> bool {
        let restored = self
            .keys
            .iter()
            .filter(|key| self.manager.rollback_optimistic_update(key))
            .count();
        debug!(order_id = %self.order_id, restored, "Recovery rollback");
        restored > 0
    }

    /// Invalidate every cached copy of the order so the next read refetches
    pub fn refresh(&self) -> usize {
        let cache = self.manager.cache();
        let mut keys: Vec<QueryKey> = cache.keys_containing(&self.order_id);
        keys.push(query_keys::order(&self.order_id));
        keys.sort();
        keys.dedup();

        keys.iter().filter(|key| cache.invalidate_query(key)).count()
    }
}

impl std::fmt::Debug for StateRecoveryMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRecoveryMechanism")
            .field("order_id", &self.order_id)
            .field("status", &self.status)
            .field("keys", &self.keys)
            .finish()
    }
}
