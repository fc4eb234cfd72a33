//! Resource store: worker inventory, flavors, images and slice/VM records.
//!
//! The orchestrator and the drivers only see the [`ResourceStore`] trait.
//! [`PgStore`] is the production implementation; [`MemoryStore`] keeps the
//! same semantics in process.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{
    BackendKind, ClusterNode, Flavor, Image, NewVm, Resources, SliceRecord, VmRecord, VmState,
    Worker,
};

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn workers_in_zone(&self, zone: &str) -> Result<Vec<Worker>, StoreError>;

    async fn worker(&self, id: i64) -> Result<Worker, StoreError>;

    async fn flavor_by_name(&self, name: &str) -> Result<Option<Flavor>, StoreError>;

    async fn image_by_name(&self, name: &str) -> Result<Option<Image>, StoreError>;

    async fn create_image(&self, name: &str, url: &str) -> Result<Image, StoreError>;

    async fn slice(&self, name: &str) -> Result<Option<SliceRecord>, StoreError>;

    async fn max_vlan_id(&self) -> Result<Option<i32>, StoreError>;

    /// Returns the slice record, registering it with the next VLAN id if it
    /// does not exist yet. Allocation is serialized.
    async fn ensure_slice(
        &self,
        name: &str,
        backend: BackendKind,
        zone: &str,
    ) -> Result<SliceRecord, StoreError>;

    /// Writes the inventory rows, the cluster-detail rows, the worker's
    /// headroom decrement and its display-port counter in one transaction.
    async fn record_vm(&self, vm: &NewVm) -> Result<VmRecord, StoreError>;

    async fn slice_vms(&self, slice_name: &str) -> Result<Vec<VmRecord>, StoreError>;

    async fn set_vm_state(&self, vm_name: &str, state: VmState) -> Result<(), StoreError>;

    async fn cluster_node(&self, vm_name: &str) -> Result<Option<ClusterNode>, StoreError>;

    /// Deletes every row of a VM and gives its reservation back to the
    /// worker, in one transaction.
    async fn remove_vm(&self, vm_name: &str) -> Result<(), StoreError>;

    async fn delete_slice(&self, name: &str) -> Result<(), StoreError>;

    async fn upsert_hypervisor(
        &self,
        zone: &str,
        name: &str,
        capacity: Resources,
        headroom: Resources,
    ) -> Result<Worker, StoreError>;
}
