//! Slice lifecycle: `Saved -> Executing -> Executed`, and
//! `Executed -> Deleting -> removed`.
//!
//! The orchestrator validates a topology, asks the placement scheduler for
//! an assignment of every pending node, hands the augmented slice to the
//! backend driver and persists the resulting document.

pub mod documents;

pub use documents::SliceDocuments;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{BackendDriver, CreateReport, StatusReport};
use crate::error::{OrchestratorError, ValidationError};
use crate::model::{BackendKind, Demand, ResourceSpec, Slice, SliceState, VmRequest, VmState};
use crate::scheduler::PlacementScheduler;
use crate::store::ResourceStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { message: String },
    /// Some VMs are still ACTIVE; nothing was touched.
    Refused { active_vms: Vec<String>, message: String },
    /// The backend could not remove every VM; the slice stays registered.
    Incomplete { message: String },
}

impl DeleteOutcome {
    pub fn message(&self) -> &str {
        match self {
            DeleteOutcome::Deleted { message }
            | DeleteOutcome::Refused { message, .. }
            | DeleteOutcome::Incomplete { message } => message,
        }
    }
}

pub struct SliceOrchestrator {
    store: Arc<dyn ResourceStore>,
    scheduler: PlacementScheduler,
    documents: SliceDocuments,
    drivers: HashMap<BackendKind, Arc<dyn BackendDriver>>,
}

impl SliceOrchestrator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        scheduler: PlacementScheduler,
        documents: SliceDocuments,
    ) -> Self {
        Self {
            store,
            scheduler,
            documents,
            drivers: HashMap::new(),
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    pub fn documents(&self) -> &SliceDocuments {
        &self.documents
    }

    fn driver(&self, kind: BackendKind) -> Result<&dyn BackendDriver, OrchestratorError> {
        self.drivers
            .get(&kind)
            .map(|driver| driver.as_ref())
            .ok_or(OrchestratorError::NoDriver(kind))
    }

    /// Resolves every pending node's demand and checks its image reference,
    /// without writing anything.
    async fn pending_requests(&self, slice: &Slice) -> Result<Vec<VmRequest>, OrchestratorError> {
        let mut requests = Vec::new();
        for (key, node) in slice.pending_nodes() {
            let demand: Demand = match &node.resources {
                ResourceSpec::Manual(demand) => *demand,
                ResourceSpec::Flavor(name) => self
                    .store
                    .flavor_by_name(name)
                    .await?
                    .map(|flavor| flavor.demand)
                    .ok_or_else(|| ValidationError::UnknownFlavor(name.clone()))?,
            };
            if node.image.url.is_none() && self.store.image_by_name(&node.image.name).await?.is_none() {
                return Err(ValidationError::UnknownImage(node.image.name.clone()).into());
            }
            requests.push(VmRequest {
                node: key.clone(),
                demand,
            });
        }
        Ok(requests)
    }

    /// Schedules and provisions every uninstantiated node of `slice`.
    ///
    /// When no placement exists the call fails with the offending node and
    /// `slice` is left exactly as it was. Per-node provisioning failures do
    /// not fail the call; they are listed in the returned report.
    pub async fn create_topology(&self, slice: &mut Slice) -> Result<CreateReport, OrchestratorError> {
        slice.validate()?;
        let driver = self.driver(slice.backend)?;

        let requests = self.pending_requests(slice).await?;
        if requests.is_empty() {
            info!(slice = %slice.name, "No pending nodes");
            return Ok(CreateReport::default());
        }

        let workers = self.scheduler.filter(self.store.as_ref(), &slice.zone).await?;
        if workers.is_empty() {
            return Err(ValidationError::UnknownZone(slice.zone.clone()).into());
        }
        let assignments = self.scheduler.place_all(workers, &requests)?;

        let record = self
            .store
            .ensure_slice(&slice.name, slice.backend, &slice.zone)
            .await?;
        slice.vlan_id = Some(record.vlan_id);
        for assignment in &assignments {
            if let Some(node) = slice.nodes.get_mut(&assignment.node) {
                node.worker_id = Some(assignment.worker_id);
            }
        }

        let previous = slice.state;
        slice.state = SliceState::Executing;
        info!(slice = %slice.name, backend = %slice.backend, nodes = requests.len(), "Executing slice");

        let report = match driver.create(slice).await {
            Ok(report) => report,
            Err(e) => {
                warn!(slice = %slice.name, "Backend create failed: {}", e);
                slice.state = previous;
                return Err(e.into());
            }
        };

        slice.state = SliceState::Executed;
        self.save_slice(slice).await?;
        info!(
            slice = %slice.name,
            created = report.created(),
            failed = report.failed_nodes().len(),
            "Slice executed"
        );
        Ok(report)
    }

    /// Adds the slice's new nodes. Instantiated nodes are neither
    /// rescheduled nor recreated.
    pub async fn update_slice(&self, slice: &mut Slice) -> Result<CreateReport, OrchestratorError> {
        info!(slice = %slice.name, "Updating slice");
        self.create_topology(slice).await
    }

    /// Deletes the slice only if every VM is INACTIVE.
    pub async fn delete_slice(&self, slice: &mut Slice) -> Result<DeleteOutcome, OrchestratorError> {
        let driver = self.driver(slice.backend)?;

        let vms = self.store.slice_vms(&slice.name).await?;
        let active_vms: Vec<String> = vms
            .iter()
            .filter(|vm| vm.state == VmState::Active)
            .map(|vm| vm.name.clone())
            .collect();
        if !active_vms.is_empty() {
            let message = format!(
                "Slice {} was not deleted: VMs {} are still active",
                slice.name,
                active_vms.join(", ")
            );
            warn!(slice = %slice.name, ?active_vms, "Delete refused");
            return Ok(DeleteOutcome::Refused { active_vms, message });
        }

        let previous = slice.state;
        slice.state = SliceState::Deleting;
        let removed = match driver.delete(slice).await {
            Ok(removed) => removed,
            Err(e) => {
                slice.state = previous;
                return Err(e.into());
            }
        };

        if !removed {
            slice.state = previous;
            return Ok(DeleteOutcome::Incomplete {
                message: format!("Slice {} was only partially deleted", slice.name),
            });
        }

        self.documents.remove(&slice.name).await?;
        info!(slice = %slice.name, "Slice deleted");
        Ok(DeleteOutcome::Deleted {
            message: format!("Slice {} deleted", slice.name),
        })
    }

    pub async fn status(&self, name: &str, backend: BackendKind) -> Result<StatusReport, OrchestratorError> {
        Ok(self.driver(backend)?.status(name).await?)
    }

    /// Records a VM's run state, e.g. once it has been shut down.
    pub async fn set_vm_state(
        &self,
        slice_name: &str,
        vm_name: &str,
        state: VmState,
    ) -> Result<(), OrchestratorError> {
        let vms = self.store.slice_vms(slice_name).await?;
        if !vms.iter().any(|vm| vm.name == vm_name) {
            return Err(OrchestratorError::UnknownVm {
                slice: slice_name.to_string(),
                vm: vm_name.to_string(),
            });
        }
        self.store.set_vm_state(vm_name, state).await?;
        info!(slice = %slice_name, vm = %vm_name, state = state.as_str(), "VM state recorded");
        Ok(())
    }

    /// Validates and stores a topology without executing it.
    pub async fn save_slice(&self, slice: &Slice) -> Result<(), OrchestratorError> {
        slice.validate()?;
        self.documents.save(slice).await?;
        Ok(())
    }

    pub async fn load_slice(&self, name: &str) -> Result<Slice, OrchestratorError> {
        Ok(self.documents.load(name).await?)
    }
}
