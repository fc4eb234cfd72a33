use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    assign_tokens, peer_tokens, reservation, resolve_demand, resolve_image, vm_name,
    BackendDriver, CreateReport, NodeOutcome, StatusReport, VmStatus,
};
use crate::config::{CallClass, ClusterConfig, Config, SchedulerConfig, TimeoutConfig};
use crate::error::{BackendError, StoreError, ValidationError};
use crate::model::{BackendKind, Demand, ImageRef, NewVm, Slice, VmRecord, VM_NAME_PREFIX};
use crate::store::ResourceStore;

#[derive(Serialize)]
struct VmCreateRequest<'a> {
    token: &'a str,
    resources: Demand,
    /// Peer tokens, comma-joined.
    links: String,
    image: &'a ImageRef,
    vlan_id: i32,
    display_port: i32,
    worker_id: i64,
}

#[derive(Serialize)]
struct FlowRequest {
    vlan_id: i32,
    worker_ids: String,
}

/// Tap interface names of a VM: `<token>-<peer token>` per link.
pub fn derive_taps(vm_name: &str, links: &[String]) -> Vec<String> {
    let token = vm_name.strip_prefix(VM_NAME_PREFIX).unwrap_or(vm_name);
    links.iter().map(|link| format!("{token}-{link}")).collect()
}

/// Driver for the Linux cluster controller, which boots VMs on the workers
/// and programs the OpenFlow switches for the slice VLAN.
pub struct ClusterDriver {
    http_client: HttpClient,
    config: ClusterConfig,
    units: SchedulerConfig,
    timeouts: TimeoutConfig,
    store: Arc<dyn ResourceStore>,
}

impl ClusterDriver {
    pub fn new(config: &Config, store: Arc<dyn ResourceStore>) -> Result<Self, BackendError> {
        let http_client = HttpClient::builder()
            .connect_timeout(config.timeouts.connect())
            .build()?;
        Ok(Self {
            http_client,
            config: config.cluster.clone(),
            units: config.scheduler.clone(),
            timeouts: config.timeouts.clone(),
            store,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn provision_node(
        &self,
        slice: &Slice,
        key: &str,
        vlan_id: i32,
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
        let worker = self.store.worker(worker_id).await?;
        let display_port = worker
            .max_display_port
            .map_or(self.config.display_base_port, |port| port + 1);
        let links = peer_tokens(slice, key);

        let request = VmCreateRequest {
            token: &token,
            resources: demand,
            links: links.join(","),
            image: &node.image,
            vlan_id,
            display_port,
            worker_id,
        };
        let response = self
            .http_client
            .post(self.url(&self.config.vm_create_path))
            .timeout(self.timeouts.for_class(CallClass::Create))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::ApiError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let name = vm_name(&token);
        self.store
            .record_vm(&NewVm {
                slice_name: slice.name.clone(),
                name: name.clone(),
                worker_id,
                image_id: image.id,
                demand,
                reserved: reservation(&self.units, demand),
                display_port: Some(display_port),
                links,
            })
            .await?;

        debug!(node = %key, vm = %name, worker_id, display_port, "VM created");
        Ok((token, worker_id))
    }

    async fn program_flows(&self, vlan_id: i32, worker_ids: &[i64]) -> Result<(), BackendError> {
        let request = FlowRequest {
            vlan_id,
            worker_ids: worker_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
        };
        let response = self
            .http_client
            .post(self.url(&self.config.flows_path))
            .timeout(self.timeouts.for_class(CallClass::Create))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::ApiError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn delete_vm(&self, vm: &VmRecord) -> Result<(), BackendError> {
        let links = self
            .store
            .cluster_node(&vm.name)
            .await?
            .map(|node| node.links)
            .unwrap_or_default();
        let taps = derive_taps(&vm.name, &links);

        let response = self
            .http_client
            .get(self.url(&self.config.vm_delete_path))
            .timeout(self.timeouts.for_class(CallClass::Delete))
            .query(&[
                ("worker_id", vm.worker_id.to_string()),
                ("vm_name", vm.name.clone()),
                ("taps", taps.join(",")),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::ApiError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        self.store.remove_vm(&vm.name).await?;
        Ok(())
    }
}

#[async_trait]
impl BackendDriver for ClusterDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn create(&self, slice: &mut Slice) -> Result<CreateReport, BackendError> {
        let record = self
            .store
            .slice(&slice.name)
            .await?
            .ok_or_else(|| StoreError::UnknownSlice(slice.name.clone()))?;
        let vlan_id = record.vlan_id;
        slice.vlan_id = Some(vlan_id);
        assign_tokens(slice);

        info!(slice = %slice.name, vlan_id, "Provisioning slice on cluster");

        let pending: Vec<String> = slice.pending_nodes().map(|(key, _)| key.clone()).collect();
        let mut report = CreateReport::default();
        for key in &pending {
            match self.provision_node(slice, key, vlan_id).await {
                Ok((token, worker_id)) => {
                    if let Some(node) = slice.nodes.get_mut(key) {
                        node.instantiated = true;
                    }
                    report.record(key, NodeOutcome::Created { token, worker_id });
                }
                Err(e) => {
                    warn!(slice = %slice.name, node = %key, "VM creation failed: {}", e);
                    report.record(key, NodeOutcome::Failed { reason: e.to_string() });
                }
            }
        }

        if report.created() > 0 {
            let mut worker_ids: Vec<i64> = Vec::new();
            for node in slice.nodes.values().filter(|n| n.instantiated) {
                if let Some(id) = node.worker_id {
                    if !worker_ids.contains(&id) {
                        worker_ids.push(id);
                    }
                }
            }
            match self.program_flows(vlan_id, &worker_ids).await {
                Ok(()) => debug!(slice = %slice.name, ?worker_ids, "Flows programmed"),
                Err(e) => error!(slice = %slice.name, "Flow programming failed: {}", e),
            }
        }

        info!(
            slice = %slice.name,
            created = report.created(),
            failed = report.failed_nodes().len(),
            "Cluster provisioning finished"
        );
        Ok(report)
    }

    async fn delete(&self, slice: &Slice) -> Result<bool, BackendError> {
        let vms = self.store.slice_vms(&slice.name).await?;
        let mut all_removed = true;
        for vm in &vms {
            if let Err(e) = self.delete_vm(vm).await {
                warn!(slice = %slice.name, vm = %vm.name, "VM deletion failed: {}", e);
                all_removed = false;
            }
        }

        if all_removed {
            self.store.delete_slice(&slice.name).await?;
            info!(slice = %slice.name, "Cluster slice deleted");
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
        Ok(StatusReport {
            name: record.name,
            backend: record.backend,
            zone: record.zone,
            vlan_id: record.vlan_id,
            created_at: record.created_at,
            vms: vms.into_iter().map(VmStatus::persisted).collect(),
        })
    }
}
