//! Domain types shared by the scheduler, the store, the drivers and the
//! orchestrator. The slice types double as the persisted slice document.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Prefix the backends put in front of a VM token to form the VM name.
pub const VM_NAME_PREFIX: &str = "vm-";

/// A RAM/disk/vCPU triple in inventory units (bytes, bytes, cores).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub ram: f64,
    pub disk: f64,
    pub vcpu: f64,
}

impl Resources {
    pub fn new(ram: f64, disk: f64, vcpu: f64) -> Self {
        Self { ram, disk, vcpu }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            ram: self.ram * factor,
            disk: self.disk * factor,
            vcpu: self.vcpu * factor,
        }
    }

    pub fn covers(&self, need: &Resources) -> bool {
        self.ram >= need.ram && self.disk >= need.disk && self.vcpu >= need.vcpu
    }

    pub fn saturating_sub(self, other: Resources) -> Self {
        Self {
            ram: (self.ram - other.ram).max(0.0),
            disk: (self.disk - other.disk).max(0.0),
            vcpu: (self.vcpu - other.vcpu).max(0.0),
        }
    }

    /// Per-dimension minimum.
    pub fn min(self, other: Resources) -> Self {
        Self {
            ram: self.ram.min(other.ram),
            disk: self.disk.min(other.disk),
            vcpu: self.vcpu.min(other.vcpu),
        }
    }

    /// Adds `other` without exceeding `ceiling` on any dimension.
    pub fn add_capped(self, other: Resources, ceiling: Resources) -> Self {
        Self {
            ram: (self.ram + other.ram).min(ceiling.ram),
            disk: (self.disk + other.disk).min(ceiling.disk),
            vcpu: (self.vcpu + other.vcpu).min(ceiling.vcpu),
        }
    }
}

/// A physical host (or hypervisor) that VMs are placed on.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub id: i64,
    pub name: String,
    pub zone: String,
    pub capacity: Resources,
    pub headroom: Resources,
    /// Highest display port handed out on this worker (cluster backend).
    pub max_display_port: Option<i32>,
}

/// Requested VM size: RAM in MB, disk in GB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub vcpu: u32,
    pub ram: u64,
    pub disk: u64,
}

impl Demand {
    pub fn to_inventory(self, ram_unit: f64, disk_unit: f64) -> Resources {
        Resources {
            ram: self.ram as f64 * ram_unit,
            disk: self.disk as f64 * disk_unit,
            vcpu: f64::from(self.vcpu),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSpec {
    Manual(Demand),
    Flavor(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceNode {
    pub resources: ResourceSpec,
    pub image: ImageRef,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub worker_id: Option<i64>,
    #[serde(default)]
    pub instantiated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cluster,
    Cloud,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Cluster => "cluster",
            BackendKind::Cloud => "cloud",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cluster" => Some(BackendKind::Cluster),
            "cloud" => Some(BackendKind::Cloud),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceState {
    #[default]
    Saved,
    Executing,
    Executed,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudNetwork {
    pub id: String,
    pub cidr: String,
}

/// A slice topology. Nodes keep their document (insertion) order, which is
/// also the order they are scheduled and provisioned in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub name: String,
    pub backend: BackendKind,
    pub zone: String,
    #[serde(default)]
    pub state: SliceState,
    #[serde(default)]
    pub vlan_id: Option<i32>,
    pub nodes: IndexMap<String, SliceNode>,
    #[serde(default)]
    pub vm_names: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<CloudNetwork>,
}

impl Slice {
    /// Structural checks that need no store access.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !name_ok {
            return Err(ValidationError::InvalidName(self.name.clone()));
        }
        if self.nodes.is_empty() {
            return Err(ValidationError::EmptyTopology(self.name.clone()));
        }
        for (key, node) in &self.nodes {
            match &node.resources {
                ResourceSpec::Manual(demand) => {
                    if demand.vcpu == 0 || demand.ram == 0 || demand.disk == 0 {
                        return Err(ValidationError::InvalidResources(key.clone()));
                    }
                }
                ResourceSpec::Flavor(name) => {
                    if name.trim().is_empty() {
                        return Err(ValidationError::UnknownFlavor(name.clone()));
                    }
                }
            }
            if let Some(peer) = node.links.iter().find(|peer| !self.nodes.contains_key(*peer)) {
                return Err(ValidationError::UnknownLink {
                    node: key.clone(),
                    peer: peer.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn pending_nodes(&self) -> impl Iterator<Item = (&String, &SliceNode)> {
        self.nodes.iter().filter(|(_, node)| !node.instantiated)
    }
}

/// One VM to place: a slice node key plus its resolved demand.
#[derive(Debug, Clone, PartialEq)]
pub struct VmRequest {
    pub node: String,
    pub demand: Demand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flavor {
    pub id: i64,
    pub name: String,
    pub demand: Demand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Active,
    Inactive,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Active => "ACTIVE",
            VmState::Inactive => "INACTIVE",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("ACTIVE") {
            VmState::Active
        } else {
            VmState::Inactive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceRecord {
    pub id: i64,
    pub name: String,
    pub backend: BackendKind,
    pub zone: String,
    pub vlan_id: i32,
    pub created_at: DateTime<Utc>,
}

/// Everything persisted for one provisioned VM, written atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVm {
    pub slice_name: String,
    pub name: String,
    pub worker_id: i64,
    pub image_id: i64,
    pub demand: Demand,
    /// Headroom requested from the worker, in inventory units. Stores hold
    /// only the part the worker still had.
    pub reserved: Resources,
    pub display_port: Option<i32>,
    /// Peer VM tokens, stored as the cluster link names.
    pub links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRecord {
    pub id: i64,
    pub name: String,
    pub state: VmState,
    pub worker_id: i64,
    pub display_port: Option<i32>,
    pub demand: Demand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    pub id: i64,
    pub name: String,
    pub links: Vec<String>,
}
