use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::client::Transport;
use crate::config::CallClass;
use crate::error::BackendError;
use crate::model::Demand;

/// Microversion that accepts `hypervisor_hostname` on server create.
pub const PINNED_CREATE_VERSION: &str = "2.74";
/// Microversion that still reports hypervisor capacity fields.
pub const INVENTORY_VERSION: &str = "2.47";

// Nova Service for compute resources
#[derive(Clone)]
pub struct NovaService {
    transport: Transport,
    base_url: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlavorSummary {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Debug)]
struct FlavorsResponse {
    flavors: Vec<FlavorSummary>,
}

#[derive(Deserialize, Debug)]
struct FlavorResponse {
    flavor: FlavorSummary,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "OS-EXT-STS:power_state", default)]
    pub power_state: Option<i32>,
    #[serde(rename = "OS-EXT-STS:task_state", default)]
    pub task_state: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ServersResponse {
    servers: Vec<Server>,
}

#[derive(Deserialize, Debug)]
struct CreatedServer {
    id: String,
}

#[derive(Deserialize, Debug)]
struct CreatedServerResponse {
    server: CreatedServer,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Hypervisor {
    pub hypervisor_hostname: String,
    pub memory_mb: u64,
    pub free_ram_mb: i64,
    pub vcpus: u64,
    pub vcpus_used: u64,
    pub local_gb: u64,
    pub free_disk_gb: i64,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize, Debug)]
struct HypervisorsResponse {
    hypervisors: Vec<Hypervisor>,
}

/// Server boot request pinned to one hypervisor.
#[derive(Debug, Clone)]
pub struct ServerSpec<'a> {
    pub name: &'a str,
    pub flavor_id: &'a str,
    pub image_ref: &'a str,
    pub network_id: &'a str,
    pub key_name: Option<&'a str>,
    pub security_group: &'a str,
    pub hypervisor_hostname: &'a str,
}

impl NovaService {
    pub fn new(transport: Transport, base_url: String) -> Self {
        Self {
            transport,
            base_url,
        }
    }

    pub async fn list_flavors(&self) -> Result<Vec<FlavorSummary>, BackendError> {
        let response: FlavorsResponse = self
            .transport
            .make_authenticated_request(
                Method::GET,
                &format!("{}/flavors/detail", self.base_url),
                None,
                CallClass::Status,
                None,
            )
            .await?;
        Ok(response.flavors)
    }

    pub async fn find_flavor_id(&self, name: &str) -> Result<Option<String>, BackendError> {
        Ok(self
            .list_flavors()
            .await?
            .into_iter()
            .find(|flavor| flavor.name == name)
            .map(|flavor| flavor.id))
    }

    /// Creates a flavor sized exactly to `demand` (RAM in MB, disk in GB).
    pub async fn create_flavor(&self, name: &str, demand: Demand) -> Result<String, BackendError> {
        let body = json!({
            "flavor": {
                "name": name,
                "ram": demand.ram,
                "vcpus": demand.vcpu,
                "disk": demand.disk,
                "rxtx_factor": 1.0
            }
        });
        let response: FlavorResponse = self
            .transport
            .make_authenticated_request(
                Method::POST,
                &format!("{}/flavors", self.base_url),
                Some(&body),
                CallClass::Create,
                None,
            )
            .await?;
        debug!("Created flavor {} ({})", name, response.flavor.id);
        Ok(response.flavor.id)
    }

    pub async fn create_server(&self, spec: &ServerSpec<'_>) -> Result<String, BackendError> {
        let mut server = json!({
            "name": spec.name,
            "flavorRef": spec.flavor_id,
            "imageRef": spec.image_ref,
            "networks": [{ "uuid": spec.network_id }],
            "security_groups": [{ "name": spec.security_group }],
            "hypervisor_hostname": spec.hypervisor_hostname
        });
        if let Some(key_name) = spec.key_name {
            server["key_name"] = json!(key_name);
        }
        let body = json!({ "server": server });

        let response: CreatedServerResponse = self
            .transport
            .make_authenticated_request(
                Method::POST,
                &format!("{}/servers", self.base_url),
                Some(&body),
                CallClass::Create,
                Some(PINNED_CREATE_VERSION),
            )
            .await?;
        Ok(response.server.id)
    }

    pub async fn list_servers(&self) -> Result<Vec<Server>, BackendError> {
        let response: ServersResponse = self
            .transport
            .make_authenticated_request(
                Method::GET,
                &format!("{}/servers/detail", self.base_url),
                None,
                CallClass::Status,
                Some(INVENTORY_VERSION),
            )
            .await?;
        Ok(response.servers)
    }

    /// Deletes a server. Only `204 No Content` counts as success.
    pub async fn delete_server(&self, server_id: &str) -> Result<(), BackendError> {
        let status = self
            .transport
            .make_authenticated_call(
                Method::DELETE,
                &format!("{}/servers/{}", self.base_url, server_id),
                CallClass::Delete,
                Some(INVENTORY_VERSION),
            )
            .await?;
        if status != 204 {
            return Err(BackendError::ApiError {
                status,
                message: format!("unexpected status deleting server {server_id}"),
            });
        }
        Ok(())
    }

    pub async fn list_hypervisors(&self) -> Result<Vec<Hypervisor>, BackendError> {
        let response: HypervisorsResponse = self
            .transport
            .make_authenticated_request(
                Method::GET,
                &format!("{}/os-hypervisors/detail", self.base_url),
                None,
                CallClass::Status,
                Some(INVENTORY_VERSION),
            )
            .await?;
        Ok(response.hypervisors)
    }
}

// Neutron Service for networking
#[derive(Clone)]
pub struct NeutronService {
    transport: Transport,
    base_url: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Debug)]
struct NetworkResponse {
    network: Network,
}

/// Provider network attributes for a slice network.
#[derive(Debug, Clone)]
pub struct NetworkSpec<'a> {
    pub name: &'a str,
    pub network_type: &'a str,
    pub physical_network: &'a str,
    pub segmentation_id: i32,
}

/// Addressing of a `/24`: gateway on `.1`, pool `.2`-`.254`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetLayout {
    pub cidr: String,
    pub gateway_ip: String,
    pub pool_start: String,
    pub pool_end: String,
}

impl SubnetLayout {
    pub fn for_cidr(cidr: &str) -> Result<Self, BackendError> {
        let prefix = cidr
            .strip_suffix(".0/24")
            .filter(|prefix| prefix.split('.').count() == 3)
            .ok_or_else(|| BackendError::NetworkSetup(format!("not a /24 network: {cidr}")))?;
        Ok(Self {
            cidr: cidr.to_string(),
            gateway_ip: format!("{prefix}.1"),
            pool_start: format!("{prefix}.2"),
            pool_end: format!("{prefix}.254"),
        })
    }
}

impl NeutronService {
    pub fn new(transport: Transport, base_url: String) -> Self {
        Self {
            transport,
            base_url,
        }
    }

    pub async fn create_network(&self, spec: &NetworkSpec<'_>) -> Result<Network, BackendError> {
        let body = json!({
            "network": {
                "admin_state_up": true,
                "name": spec.name,
                "provider:network_type": spec.network_type,
                "provider:physical_network": spec.physical_network,
                "provider:segmentation_id": spec.segmentation_id,
                "shared": true
            }
        });
        let response: NetworkResponse = self
            .transport
            .make_authenticated_request(
                Method::POST,
                &format!("{}/networks", self.base_url),
                Some(&body),
                CallClass::Create,
                None,
            )
            .await?;
        Ok(response.network)
    }

    pub async fn create_subnet(
        &self,
        name: &str,
        network_id: &str,
        layout: &SubnetLayout,
        dns_nameserver: &str,
    ) -> Result<(), BackendError> {
        let body = json!({
            "subnet": {
                "name": name,
                "network_id": network_id,
                "cidr": layout.cidr,
                "gateway_ip": layout.gateway_ip,
                "dns_nameservers": [dns_nameserver],
                "allocation_pools": [{ "start": layout.pool_start, "end": layout.pool_end }],
                "ip_version": 4
            }
        });
        let _: serde_json::Value = self
            .transport
            .make_authenticated_request(
                Method::POST,
                &format!("{}/subnets", self.base_url),
                Some(&body),
                CallClass::Create,
                None,
            )
            .await?;
        Ok(())
    }
}
