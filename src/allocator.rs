//! Allocator (C3): node + port + resource reservation (§4.3)
//!
//! The heavy lifting (row locks, candidate selection, slot assignment) lives
//! in `Store::allocate_ports_for_server`; this module's job is narrower —
//! apply the overhead factor to the caller's resource requirement before
//! delegating, so the Store never has to know about that policy constant.

use crate::error::Result;
use crate::store::models::{Allocation, PortRequirement};
use crate::store::Store;
use crate::types::ResourceRequirement;
use std::sync::Arc;
use tracing::instrument;

/// Reserves node capacity and ports for servers, and checks capacity
/// without mutating anything.
pub struct Allocator {
    store: Arc<dyn Store>,
    overhead_factor: f64,
}

impl Allocator {
    pub fn new(store: Arc<dyn Store>, overhead_factor: f64) -> Self {
        Self { store, overhead_factor }
    }

    /// Reserve ports and capacity for `server_id`. `resource` is the raw
    /// (un-inflated) requirement from the plan; the overhead factor is
    /// applied here.
    #[instrument(skip(self, requirements))]
    pub async fn allocate(
        &self,
        server_id: crate::types::ServerId,
        requirements: &[PortRequirement],
        resource: ResourceRequirement,
    ) -> Result<Allocation> {
        let inflated = resource.with_overhead(self.overhead_factor);
        self.store.allocate_ports_for_server(server_id, requirements, inflated).await
    }

    /// Release all port reservations held by `server_id`.
    pub async fn release(&self, server_id: crate::types::ServerId) -> Result<()> {
        self.store.release_server_ports(server_id).await
    }

    /// Advisory, read-only capacity probe (§4.3): may race with concurrent
    /// allocations, never locks or mutates.
    pub async fn has_capacity(&self, resource: ResourceRequirement) -> Result<bool> {
        let inflated = resource.with_overhead(self.overhead_factor);
        self.store.has_capacity(inflated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::{NodeName, Protocol, ServerId};

    #[tokio::test]
    async fn overhead_factor_is_applied_before_capacity_check() {
        let store = Arc::new(MemoryStore::new());
        let node = NodeName::from("n1");
        // 1000 allocatable; a request for 950 raw only fits after *not*
        // inflating, so with overhead 0.90 the inflated ask (1056) should fail.
        store.upsert_node(&node, "203.0.113.1", 1000, 1_000_000_000).await.unwrap();

        let allocator = Allocator::new(store, 0.90);
        let has = allocator.has_capacity(ResourceRequirement::new(950, 1)).await.unwrap();
        assert!(!has, "inflated requirement should exceed the node's allocatable capacity");
    }

    #[tokio::test]
    async fn allocate_then_release_frees_the_slot() {
        let store = Arc::new(MemoryStore::new());
        let node = NodeName::from("n1");
        store.upsert_node(&node, "203.0.113.1", 4000, 8_000_000_000).await.unwrap();
        store.initialize_node_ports(&node, 25500, 25501).await.unwrap();

        let allocator = Allocator::new(store.clone(), 0.90);
        let server_id = ServerId::new();
        let reqs = vec![PortRequirement { port_name: "game".into(), protocol: Protocol::Udp }];

        allocator.allocate(server_id, &reqs, ResourceRequirement::new(500, 512)).await.unwrap();
        allocator.release(server_id).await.unwrap();

        let has = allocator.has_capacity(ResourceRequirement::new(500, 512)).await.unwrap();
        assert!(has);
    }
}
