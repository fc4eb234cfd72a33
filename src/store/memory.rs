use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::ResourceStore;
use crate::error::StoreError;
use crate::model::{
    BackendKind, ClusterNode, Demand, Flavor, Image, NewVm, Resources, SliceRecord, VmRecord,
    VmState, Worker,
};

#[derive(Debug, Clone)]
struct StoredVm {
    record: VmRecord,
    slice_name: String,
    reserved: Resources,
}

#[derive(Debug, Default)]
struct Inner {
    workers: BTreeMap<i64, Worker>,
    flavors: Vec<Flavor>,
    images: Vec<Image>,
    slices: Vec<SliceRecord>,
    vms: Vec<StoredVm>,
    nodes: Vec<ClusterNode>,
    next_id: i64,
    writes: u64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store. One mutex guards everything, so each trait call is
/// atomic the same way a transaction is in [`super::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_worker(&self, worker: Worker) {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.max(worker.id);
        inner.workers.insert(worker.id, worker);
    }

    pub async fn insert_flavor(&self, name: &str, demand: Demand) -> Flavor {
        let mut inner = self.inner.lock().await;
        let flavor = Flavor {
            id: inner.next_id(),
            name: name.to_string(),
            demand,
        };
        inner.flavors.push(flavor.clone());
        flavor
    }

    pub async fn insert_image(&self, name: &str, url: Option<&str>) -> Image {
        let mut inner = self.inner.lock().await;
        let image = Image {
            id: inner.next_id(),
            name: name.to_string(),
            url: url.map(str::to_string),
        };
        inner.images.push(image.clone());
        image
    }

    pub async fn worker_snapshot(&self, id: i64) -> Option<Worker> {
        self.inner.lock().await.workers.get(&id).cloned()
    }

    /// Number of mutating trait calls served so far.
    pub async fn write_count(&self) -> u64 {
        self.inner.lock().await.writes
    }

    pub async fn cluster_node_count(&self) -> usize {
        self.inner.lock().await.nodes.len()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn workers_in_zone(&self, zone: &str) -> Result<Vec<Worker>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .workers
            .values()
            .filter(|w| w.zone == zone)
            .cloned()
            .collect())
    }

    async fn worker(&self, id: i64) -> Result<Worker, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .workers
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownWorker(id))
    }

    async fn flavor_by_name(&self, name: &str) -> Result<Option<Flavor>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.flavors.iter().find(|f| f.name == name).cloned())
    }

    async fn image_by_name(&self, name: &str) -> Result<Option<Image>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.images.iter().find(|i| i.name == name).cloned())
    }

    async fn create_image(&self, name: &str, url: &str) -> Result<Image, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.images.iter().any(|i| i.name == name) {
            return Err(StoreError::Duplicate(format!("image {name}")));
        }
        inner.writes += 1;
        let image = Image {
            id: inner.next_id(),
            name: name.to_string(),
            url: Some(url.to_string()),
        };
        inner.images.push(image.clone());
        Ok(image)
    }

    async fn slice(&self, name: &str) -> Result<Option<SliceRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.slices.iter().find(|s| s.name == name).cloned())
    }

    async fn max_vlan_id(&self) -> Result<Option<i32>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.slices.iter().map(|s| s.vlan_id).max())
    }

    async fn ensure_slice(
        &self,
        name: &str,
        backend: BackendKind,
        zone: &str,
    ) -> Result<SliceRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.slices.iter().find(|s| s.name == name) {
            return Ok(existing.clone());
        }

        let vlan_id = inner.slices.iter().map(|s| s.vlan_id).max().unwrap_or(0) + 1;
        inner.writes += 1;
        let record = SliceRecord {
            id: inner.next_id(),
            name: name.to_string(),
            backend,
            zone: zone.to_string(),
            vlan_id,
            created_at: Utc::now(),
        };
        inner.slices.push(record.clone());
        Ok(record)
    }

    async fn record_vm(&self, vm: &NewVm) -> Result<VmRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.slices.iter().any(|s| s.name == vm.slice_name) {
            return Err(StoreError::UnknownSlice(vm.slice_name.clone()));
        }
        if inner.vms.iter().any(|stored| stored.record.name == vm.name) {
            return Err(StoreError::Duplicate(format!("vm {}", vm.name)));
        }
        let worker = inner
            .workers
            .get_mut(&vm.worker_id)
            .ok_or(StoreError::UnknownWorker(vm.worker_id))?;
        // Overcommitted placements can ask for more than is left; only what
        // was actually taken is held against the VM.
        let taken = vm.reserved.min(worker.headroom);
        worker.headroom = worker.headroom.saturating_sub(taken);
        if let Some(port) = vm.display_port {
            worker.max_display_port = Some(worker.max_display_port.map_or(port, |p| p.max(port)));
        }

        inner.writes += 1;
        let record = VmRecord {
            id: inner.next_id(),
            name: vm.name.clone(),
            state: VmState::Active,
            worker_id: vm.worker_id,
            display_port: vm.display_port,
            demand: vm.demand,
        };
        inner.vms.push(StoredVm {
            record: record.clone(),
            slice_name: vm.slice_name.clone(),
            reserved: taken,
        });
        let node = ClusterNode {
            id: inner.next_id(),
            name: vm.name.clone(),
            links: vm.links.clone(),
        };
        inner.nodes.push(node);
        Ok(record)
    }

    async fn slice_vms(&self, slice_name: &str) -> Result<Vec<VmRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vms
            .iter()
            .filter(|stored| stored.slice_name == slice_name)
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn set_vm_state(&self, vm_name: &str, state: VmState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.writes += 1;
        if let Some(stored) = inner.vms.iter_mut().find(|s| s.record.name == vm_name) {
            stored.record.state = state;
        }
        Ok(())
    }

    async fn cluster_node(&self, vm_name: &str) -> Result<Option<ClusterNode>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .iter()
            .find(|node| node.name == vm_name)
            .cloned())
    }

    async fn remove_vm(&self, vm_name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.vms.iter().position(|s| s.record.name == vm_name) else {
            return Ok(());
        };
        inner.writes += 1;
        let stored = inner.vms.remove(index);
        inner.nodes.retain(|n| n.name != vm_name);
        if let Some(worker) = inner.workers.get_mut(&stored.record.worker_id) {
            worker.headroom = worker.headroom.add_capped(stored.reserved, worker.capacity);
        }
        Ok(())
    }

    async fn delete_slice(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.writes += 1;
        inner.slices.retain(|s| s.name != name);
        Ok(())
    }

    async fn upsert_hypervisor(
        &self,
        zone: &str,
        name: &str,
        capacity: Resources,
        headroom: Resources,
    ) -> Result<Worker, StoreError> {
        let headroom = Resources::default().add_capped(headroom, capacity);
        let mut inner = self.inner.lock().await;
        inner.writes += 1;
        if let Some(worker) = inner.workers.values_mut().find(|w| w.name == name) {
            worker.zone = zone.to_string();
            worker.capacity = capacity;
            worker.headroom = headroom;
            return Ok(worker.clone());
        }
        let worker = Worker {
            id: inner.next_id(),
            name: name.to_string(),
            zone: zone.to_string(),
            capacity,
            headroom,
            max_display_port: None,
        };
        inner.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }
}
