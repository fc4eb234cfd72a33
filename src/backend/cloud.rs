use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    assign_tokens, generate_token, reservation, resolve_demand, resolve_image, vm_name, BackendDriver,
    CreateReport, LiveState, NodeOutcome, StatusReport, VmStatus,
};
use crate::config::{CloudConfig, Config, SchedulerConfig};
use crate::error::{BackendError, StoreError, ValidationError};
use crate::model::{BackendKind, CloudNetwork, NewVm, ResourceSpec, Resources, Slice, Worker};
use crate::openstack::services::{NetworkSpec, ServerSpec, SubnetLayout};
use crate::openstack::{Client, Hypervisor};
use crate::store::ResourceStore;

/// A random `10.x.y.0/24` network.
pub fn generate_cidr() -> String {
    let mut rng = rand::thread_rng();
    format!("10.{}.{}.0/24", rng.gen_range(0..=254), rng.gen_range(0..=255))
}

/// Converts a hypervisor's MB/GB figures into byte-denominated capacity and
/// headroom.
pub fn hypervisor_resources(hypervisor: &Hypervisor, units: &SchedulerConfig) -> (Resources, Resources) {
    let capacity = Resources::new(
        hypervisor.memory_mb as f64 * units.ram_unit_bytes,
        hypervisor.local_gb as f64 * units.disk_unit_bytes,
        hypervisor.vcpus as f64,
    );
    let headroom = Resources::new(
        hypervisor.free_ram_mb.max(0) as f64 * units.ram_unit_bytes,
        hypervisor.free_disk_gb.max(0) as f64 * units.disk_unit_bytes,
        hypervisor.vcpus.saturating_sub(hypervisor.vcpus_used) as f64,
    );
    (capacity, headroom)
}

/// Driver for the OpenStack-style control plane: one provider network per
/// slice, servers pinned to the scheduled hypervisor.
pub struct CloudDriver {
    client: Client,
    config: CloudConfig,
    units: SchedulerConfig,
    store: Arc<dyn ResourceStore>,
}

impl CloudDriver {
    pub fn new(config: &Config, store: Arc<dyn ResourceStore>) -> Result<Self, BackendError> {
        Ok(Self {
            client: Client::new(&config.cloud, &config.timeouts)?,
            config: config.cloud.clone(),
            units: config.scheduler.clone(),
            store,
        })
    }

    async fn ensure_network(&self, slice: &Slice, vlan_id: i32) -> Result<CloudNetwork, BackendError> {
        if let Some(network) = &slice.network {
            debug!(slice = %slice.name, network = %network.id, "Reusing slice network");
            return Ok(network.clone());
        }

        let network = self
            .client
            .neutron
            .create_network(&NetworkSpec {
                name: &slice.name,
                network_type: &self.config.provider_network_type,
                physical_network: &self.config.physical_network,
                segmentation_id: vlan_id,
            })
            .await
            .map_err(|e| BackendError::NetworkSetup(format!("network for {}: {e}", slice.name)))?;

        let cidr = generate_cidr();
        let layout = SubnetLayout::for_cidr(&cidr)?;
        self.client
            .neutron
            .create_subnet(
                &format!("{}_subnet", slice.name),
                &network.id,
                &layout,
                &self.config.dns_nameserver,
            )
            .await
            .map_err(|e| BackendError::NetworkSetup(format!("subnet {cidr}: {e}")))?;

        info!(slice = %slice.name, network = %network.id, %cidr, "Created slice network");
        Ok(CloudNetwork {
            id: network.id,
            cidr,
        })
    }

    async fn provision_node(
        &self,
        slice: &Slice,
        key: &str,
        network_id: &str,
    ) -> Result<(String, i64), BackendError> {
        let node = slice
            .nodes
            .get(key)
            .ok_or_else(|| ValidationError::Unassigned(key.to_string()))?;
        let worker_id = node
            .worker_id
            .ok_or_else(|| ValidationError::Unassigned(key.to_string()))?;
        let token = node
            .token
            .clone()
            .ok_or_else(|| ValidationError::Unassigned(key.to_string()))?;

        let demand = resolve_demand(self.store.as_ref(), &node.resources).await?;
        let image = resolve_image(self.store.as_ref(), &node.image).await?;
        let flavor_id = match &node.resources {
            ResourceSpec::Manual(_) => {
                // Nova flavor names are unique, and a retried node keeps its token.
                let name = format!("{}-{}-{}", slice.name, key, generate_token());
                self.client.nova.create_flavor(&name, demand).await?
            }
            ResourceSpec::Flavor(name) => self
                .client
                .nova
                .find_flavor_id(name)
                .await?
                .ok_or_else(|| ValidationError::UnknownFlavor(name.clone()))?,
        };
        let worker = self.store.worker(worker_id).await?;

        let name = vm_name(&token);
        let server_id = self
            .client
            .nova
            .create_server(&ServerSpec {
                name: &name,
                flavor_id: &flavor_id,
                image_ref: &self.config.image_ref,
                network_id,
                key_name: self.config.key_name.as_deref(),
                security_group: &self.config.security_group,
                hypervisor_hostname: &worker.name,
            })
            .await?;

        self.store
            .record_vm(&NewVm {
                slice_name: slice.name.clone(),
                name: name.clone(),
                worker_id,
                image_id: image.id,
                demand,
                reserved: reservation(&self.units, demand),
                display_port: None,
                links: super::peer_tokens(slice, key),
            })
            .await?;

        debug!(node = %key, vm = %name, server = %server_id, host = %worker.name, "Server created");
        Ok((token, worker_id))
    }

    /// Reads every hypervisor's capacity and stores it as a worker of `zone`.
    pub async fn refresh_hypervisors(&self, zone: &str) -> Result<Vec<Worker>, BackendError> {
        self.client.authenticate().await?;
        let hypervisors = self.client.nova.list_hypervisors().await?;

        let mut workers = Vec::with_capacity(hypervisors.len());
        for hypervisor in &hypervisors {
            let (capacity, headroom) = hypervisor_resources(hypervisor, &self.units);
            let worker = self
                .store
                .upsert_hypervisor(zone, &hypervisor.hypervisor_hostname, capacity, headroom)
                .await?;
            workers.push(worker);
        }

        info!(zone, count = workers.len(), "Hypervisor inventory refreshed");
        Ok(workers)
    }
}

#[async_trait]
impl BackendDriver for CloudDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn create(&self, slice: &mut Slice) -> Result<CreateReport, BackendError> {
        self.client.authenticate().await?;

        let record = self
            .store
            .slice(&slice.name)
            .await?
            .ok_or_else(|| StoreError::UnknownSlice(slice.name.clone()))?;
        let vlan_id = record.vlan_id;
        slice.vlan_id = Some(vlan_id);

        let network = self.ensure_network(slice, vlan_id).await?;
        slice.network = Some(network.clone());
        assign_tokens(slice);

        info!(slice = %slice.name, vlan_id, network = %network.id, "Provisioning slice on cloud");

        let pending: Vec<String> = slice.pending_nodes().map(|(key, _)| key.clone()).collect();
        let mut report = CreateReport::default();
        for key in &pending {
            match self.provision_node(slice, key, &network.id).await {
                Ok((token, worker_id)) => {
                    if let Some(node) = slice.nodes.get_mut(key) {
                        node.instantiated = true;
                    }
                    report.record(key, NodeOutcome::Created { token, worker_id });
                }
                Err(e) => {
                    warn!(slice = %slice.name, node = %key, "Server creation failed: {}", e);
                    report.record(key, NodeOutcome::Failed { reason: e.to_string() });
                }
            }
        }

        info!(
            slice = %slice.name,
            created = report.created(),
            failed = report.failed_nodes().len(),
            "Cloud provisioning finished"
        );
        Ok(report)
    }

    async fn delete(&self, slice: &Slice) -> Result<bool, BackendError> {
        self.client.authenticate().await?;

        let vms = self.store.slice_vms(&slice.name).await?;
        let servers: HashMap<String, String> = self
            .client
            .nova
            .list_servers()
            .await?
            .into_iter()
            .map(|server| (server.name, server.id))
            .collect();

        let mut all_removed = true;
        for vm in &vms {
            let Some(server_id) = servers.get(&vm.name) else {
                warn!(slice = %slice.name, vm = %vm.name, "Server not found, keeping its records");
                all_removed = false;
                continue;
            };
            match self.client.nova.delete_server(server_id).await {
                Ok(()) => self.store.remove_vm(&vm.name).await?,
                Err(e) => {
                    warn!(slice = %slice.name, vm = %vm.name, "Server deletion failed: {}", e);
                    all_removed = false;
                }
            }
        }

        if all_removed {
            self.store.delete_slice(&slice.name).await?;
            info!(slice = %slice.name, "Cloud slice deleted");
        }
        Ok(all_removed)
    }

    async fn status(&self, name: &str) -> Result<StatusReport, BackendError> {
        let record = self
            .store
            .slice(name)
            .await?
            .ok_or_else(|| StoreError::UnknownSlice(name.to_string()))?;
        let vms = self.store.slice_vms(name).await?;

        let live: HashMap<String, LiveState> = match self.client.nova.list_servers().await {
            Ok(servers) => servers
                .into_iter()
                .map(|server| {
                    (
                        server.name,
                        LiveState {
                            status: server.status,
                            power_state: server.power_state,
                            task_state: server.task_state,
                        },
                    )
                })
                .collect(),
            Err(e) => {
                warn!(slice = %name, "Live server listing unavailable: {}", e);
                HashMap::new()
            }
        };

        Ok(StatusReport {
            name: record.name,
            backend: record.backend,
            zone: record.zone,
            vlan_id: record.vlan_id,
            created_at: record.created_at,
            vms: vms
                .into_iter()
                .map(|vm| {
                    let live = live.get(&vm.name).cloned();
                    VmStatus {
                        live,
                        ..VmStatus::persisted(vm)
                    }
                })
                .collect(),
        })
    }
}
