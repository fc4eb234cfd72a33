//! Execution backends. Both drivers implement [`BackendDriver`]; the
//! orchestrator picks one by [`BackendKind`].

pub mod cloud;
pub mod cluster;

pub use cloud::CloudDriver;
pub use cluster::ClusterDriver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::Rng;
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::error::{BackendError, ValidationError};
use crate::model::{
    BackendKind, Demand, Image, ImageRef, ResourceSpec, Resources, Slice, VmRecord, VmState,
    VM_NAME_PREFIX,
};
use crate::store::ResourceStore;

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Provisions every uninstantiated node of `slice`. Nodes that come up
    /// are marked instantiated; the rest are reported as failed and left
    /// for a later update.
    async fn create(&self, slice: &mut Slice) -> Result<CreateReport, BackendError>;

    /// Tears down every persisted VM of the slice and removes the slice row.
    async fn delete(&self, slice: &Slice) -> Result<bool, BackendError>;

    async fn status(&self, name: &str) -> Result<StatusReport, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Created { token: String, worker_id: i64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateReport {
    pub outcomes: IndexMap<String, NodeOutcome>,
}

impl CreateReport {
    pub fn record(&mut self, node: &str, outcome: NodeOutcome) {
        self.outcomes.insert(node.to_string(), outcome);
    }

    pub fn created(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, NodeOutcome::Created { .. }))
            .count()
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NodeOutcome::Failed { .. }))
            .map(|(node, _)| node.as_str())
            .collect()
    }
}

/// What the cloud reports for a server right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveState {
    pub status: String,
    pub power_state: Option<i32>,
    pub task_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmStatus {
    pub name: String,
    pub state: VmState,
    pub worker_id: i64,
    pub display_port: Option<i32>,
    /// `None` when the backend has no live view, or the VM is missing there.
    pub live: Option<LiveState>,
}

impl VmStatus {
    pub fn persisted(record: VmRecord) -> Self {
        Self {
            name: record.name,
            state: record.state,
            worker_id: record.worker_id,
            display_port: record.display_port,
            live: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub backend: BackendKind,
    pub zone: String,
    pub vlan_id: i32,
    pub created_at: DateTime<Utc>,
    pub vms: Vec<VmStatus>,
}

/// Six lowercase hex characters.
pub fn generate_token() -> String {
    let bytes: [u8; 3] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn vm_name(token: &str) -> String {
    format!("{VM_NAME_PREFIX}{token}")
}

/// Gives every node without a token a fresh one, unique within the slice,
/// and refreshes the node → token map. Existing tokens are kept.
pub fn assign_tokens(slice: &mut Slice) {
    let mut taken: Vec<String> = slice.nodes.values().filter_map(|n| n.token.clone()).collect();
    for node in slice.nodes.values_mut() {
        if node.token.is_none() {
            let token = loop {
                let candidate = generate_token();
                if !taken.contains(&candidate) {
                    break candidate;
                }
            };
            taken.push(token.clone());
            node.token = Some(token);
        }
    }
    slice.vm_names = slice
        .nodes
        .iter()
        .filter_map(|(key, node)| node.token.clone().map(|token| (key.clone(), token)))
        .collect();
}

/// Tokens of the peers `node` links to, in link order.
pub fn peer_tokens(slice: &Slice, node: &str) -> Vec<String> {
    slice
        .nodes
        .get(node)
        .map(|n| {
            n.links
                .iter()
                .filter_map(|peer| slice.nodes.get(peer).and_then(|p| p.token.clone()))
                .collect()
        })
        .unwrap_or_default()
}

pub async fn resolve_demand(
    store: &dyn ResourceStore,
    spec: &ResourceSpec,
) -> Result<Demand, BackendError> {
    match spec {
        ResourceSpec::Manual(demand) => Ok(*demand),
        ResourceSpec::Flavor(name) => store
            .flavor_by_name(name)
            .await?
            .map(|flavor| flavor.demand)
            .ok_or_else(|| ValidationError::UnknownFlavor(name.clone()).into()),
    }
}

/// Looks the image up by name, registering it when a source url is given.
pub async fn resolve_image(
    store: &dyn ResourceStore,
    image: &ImageRef,
) -> Result<Image, BackendError> {
    if let Some(found) = store.image_by_name(&image.name).await? {
        return Ok(found);
    }
    match image.url.as_deref() {
        Some(url) => Ok(store.create_image(&image.name, url).await?),
        None => Err(ValidationError::UnknownImage(image.name.clone()).into()),
    }
}

/// Headroom a VM of `demand` takes from its worker, in inventory units.
pub fn reservation(config: &SchedulerConfig, demand: Demand) -> Resources {
    demand.to_inventory(config.ram_unit_bytes, config.disk_unit_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SliceNode, SliceState};

    fn node(links: &[&str], token: Option<&str>) -> SliceNode {
        SliceNode {
            resources: ResourceSpec::Manual(Demand { vcpu: 1, ram: 256, disk: 1 }),
            image: ImageRef { name: "cirros".into(), url: None },
            links: links.iter().map(|l| l.to_string()).collect(),
            worker_id: Some(1),
            instantiated: token.is_some(),
            token: token.map(str::to_string),
        }
    }

    fn slice() -> Slice {
        let mut nodes = IndexMap::new();
        nodes.insert("a".to_string(), node(&["b", "c"], Some("aaaaaa")));
        nodes.insert("b".to_string(), node(&["a"], None));
        nodes.insert("c".to_string(), node(&["a"], None));
        Slice {
            name: "lab".into(),
            backend: BackendKind::Cluster,
            zone: "Z1".into(),
            state: SliceState::Saved,
            vlan_id: Some(3),
            nodes,
            vm_names: IndexMap::new(),
            network: None,
        }
    }

    #[test]
    fn tokens_are_six_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 6);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(vm_name(&token), format!("vm-{token}"));
    }

    #[test]
    fn assigning_tokens_keeps_existing_ones() {
        let mut s = slice();
        assign_tokens(&mut s);
        assert_eq!(s.nodes["a"].token.as_deref(), Some("aaaaaa"));
        assert_eq!(s.vm_names.len(), 3);
        assert_ne!(s.vm_names["b"], s.vm_names["c"]);

        let before = s.vm_names.clone();
        assign_tokens(&mut s);
        assert_eq!(s.vm_names, before);
    }

    #[test]
    fn peers_resolve_to_tokens_in_link_order() {
        let mut s = slice();
        assign_tokens(&mut s);
        let peers = peer_tokens(&s, "a");
        assert_eq!(peers, vec![s.vm_names["b"].clone(), s.vm_names["c"].clone()]);
        assert_eq!(peer_tokens(&s, "b"), vec!["aaaaaa".to_string()]);
        assert!(peer_tokens(&s, "missing").is_empty());
    }
}
