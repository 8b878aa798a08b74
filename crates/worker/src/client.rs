//! Commerce platform client contract.
//!
//! The concrete transport and auth of the two platforms are out of scope
//! for the core; the orchestration layer only depends on this abstract
//! contract. The in-memory implementation backs tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stockbridge_core::{ResourceId, SyncError, SyncResult};

/// Product state on a platform. Fields are optional so a partial update
/// (inventory-only or price-only) leaves the other field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    pub quantity: Option<i64>,
    pub price_cents: Option<i64>,
}

impl RemoteState {
    pub fn new(quantity: i64, price_cents: i64) -> Self {
        Self {
            quantity: Some(quantity),
            price_cents: Some(price_cents),
        }
    }
}

/// Abstract client for one commerce platform.
#[async_trait]
pub trait CommerceClient: Send + Sync {
    /// Read the current state of a product mapping.
    async fn fetch_remote_state(&self, resource_id: &ResourceId) -> SyncResult<RemoteState>;

    /// Write (part of) a product mapping's state. `None` fields are left
    /// untouched on the platform.
    async fn apply_local_update(&self, resource_id: &ResourceId, state: RemoteState)
    -> SyncResult<()>;
}

/// Source of the product mappings the auto-sync loop iterates.
pub trait ResourceCatalog: Send + Sync {
    fn resource_ids(&self) -> Vec<ResourceId>;
}

/// Fixed catalog for tests and single-process deployments.
#[derive(Debug, Clone)]
pub struct StaticCatalog(pub Vec<ResourceId>);

impl ResourceCatalog for StaticCatalog {
    fn resource_ids(&self) -> Vec<ResourceId> {
        self.0.clone()
    }
}

/// In-memory platform for tests/dev.
///
/// Failures can be scripted: each queued error is consumed by the next
/// call, then the client behaves normally again. Writes are recorded so
/// tests can assert an update was applied exactly once.
#[derive(Debug, Default)]
pub struct InMemoryCommerceClient {
    states: RwLock<HashMap<ResourceId, RemoteState>>,
    failures: Mutex<VecDeque<SyncError>>,
    applied: Mutex<Vec<(ResourceId, RemoteState)>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryCommerceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, resource_id: ResourceId, state: RemoteState) {
        self.states.write().expect("client state poisoned").insert(resource_id, state);
    }

    pub fn state(&self, resource_id: &ResourceId) -> Option<RemoteState> {
        self.states.read().expect("client state poisoned").get(resource_id).cloned()
    }

    /// Queue an error for the next call (fetch or apply, whichever lands
    /// first).
    pub fn push_failure(&self, error: SyncError) {
        self.failures.lock().expect("failure script poisoned").push_back(error);
    }

    pub fn pending_failures(&self) -> usize {
        self.failures.lock().expect("failure script poisoned").len()
    }

    /// Every write applied, in order.
    pub fn applied(&self) -> Vec<(ResourceId, RemoteState)> {
        self.applied.lock().expect("applied log poisoned").clone()
    }

    /// Simulated per-call latency, for timeout tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency poisoned") = Some(latency);
    }

    async fn simulate_call(&self) -> SyncResult<()> {
        let latency = *self.latency.lock().expect("latency poisoned");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let next_failure = self.failures.lock().expect("failure script poisoned").pop_front();
        match next_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommerceClient for InMemoryCommerceClient {
    async fn fetch_remote_state(&self, resource_id: &ResourceId) -> SyncResult<RemoteState> {
        self.simulate_call().await?;
        self.states
            .read()
            .expect("client state poisoned")
            .get(resource_id)
            .cloned()
            .ok_or_else(|| SyncError::upstream(404, format!("unknown resource {resource_id}")))
    }

    async fn apply_local_update(
        &self,
        resource_id: &ResourceId,
        state: RemoteState,
    ) -> SyncResult<()> {
        self.simulate_call().await?;
        let mut states = self.states.write().expect("client state poisoned");
        let current = states.entry(resource_id.clone()).or_default();
        if let Some(quantity) = state.quantity {
            current.quantity = Some(quantity);
        }
        if let Some(price_cents) = state.price_cents {
            current.price_cents = Some(price_cents);
        }
        drop(states);
        self.applied
            .lock()
            .expect("applied log poisoned")
            .push((resource_id.clone(), state));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str) -> ResourceId {
        ResourceId::new(id).unwrap()
    }

    #[tokio::test]
    async fn fetch_unknown_resource_is_a_client_error() {
        let client = InMemoryCommerceClient::new();
        let err = client.fetch_remote_state(&resource("missing")).await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let client = InMemoryCommerceClient::new();
        client.set_state(resource("map-1"), RemoteState::new(5, 1299));
        client.push_failure(SyncError::transient("reset"));

        assert!(client.fetch_remote_state(&resource("map-1")).await.is_err());
        assert!(client.fetch_remote_state(&resource("map-1")).await.is_ok());
    }

    #[tokio::test]
    async fn partial_update_leaves_other_field_untouched() {
        let client = InMemoryCommerceClient::new();
        client.set_state(resource("map-1"), RemoteState::new(5, 1299));

        client
            .apply_local_update(
                &resource("map-1"),
                RemoteState { quantity: Some(9), price_cents: None },
            )
            .await
            .unwrap();

        let state = client.state(&resource("map-1")).unwrap();
        assert_eq!(state.quantity, Some(9));
        assert_eq!(state.price_cents, Some(1299));
        assert_eq!(client.applied().len(), 1);
    }
}
