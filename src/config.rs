use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SLICER";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub cluster: ClusterConfig,
    pub cloud: CloudConfig,
    pub timeouts: TimeoutConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Placement tuning. Request RAM is expressed in MB and disk in GB while the
/// worker inventory is byte-denominated; the unit fields bridge the two.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub overcommit_factor: f64,
    pub ram_weight: f64,
    pub disk_weight: f64,
    pub vcpu_weight: f64,
    pub ram_unit_bytes: f64,
    pub disk_unit_bytes: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub api_url: String,
    pub vm_create_path: String,
    pub vm_delete_path: String,
    pub flows_path: String,
    pub display_base_port: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudConfig {
    pub identity_url: String,
    pub compute_url: String,
    pub network_url: String,
    pub username: String,
    pub password: String,
    pub user_domain: String,
    pub project_name: String,
    pub project_domain: String,
    pub image_ref: String,
    pub key_name: Option<String>,
    pub security_group: String,
    pub provider_network_type: String,
    pub physical_network: String,
    pub dns_nameserver: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_seconds: u64,
    pub auth_seconds: u64,
    pub create_seconds: u64,
    pub delete_seconds: u64,
    pub status_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub slices_dir: PathBuf,
}

/// External call classes; each one gets its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Auth,
    Create,
    Delete,
    Status,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://slicer@localhost/slicer".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            overcommit_factor: 2.0,
            ram_weight: 0.5,
            disk_weight: 0.25,
            vcpu_weight: 0.25,
            ram_unit_bytes: 1_048_576.0,
            disk_unit_bytes: 1_073_741_824.0,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8081".to_string(),
            vm_create_path: "/vm/create".to_string(),
            vm_delete_path: "/vm/delete".to_string(),
            flows_path: "/flows".to_string(),
            display_base_port: 5900,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            identity_url: "http://127.0.0.1:5000".to_string(),
            compute_url: "http://127.0.0.1:8774/v2.1".to_string(),
            network_url: "http://127.0.0.1:9696/v2.0".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            user_domain: "Default".to_string(),
            project_name: "admin".to_string(),
            project_domain: "Default".to_string(),
            image_ref: String::new(),
            key_name: None,
            security_group: "default".to_string(),
            provider_network_type: "vlan".to_string(),
            physical_network: "external".to_string(),
            dns_nameserver: "8.8.8.8".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_seconds: 5,
            auth_seconds: 10,
            create_seconds: 120,
            delete_seconds: 60,
            status_seconds: 15,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            slices_dir: PathBuf::from("slices"),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_seconds)
    }

    pub fn for_class(&self, class: CallClass) -> Duration {
        let seconds = match class {
            CallClass::Auth => self.auth_seconds,
            CallClass::Create => self.create_seconds,
            CallClass::Delete => self.delete_seconds,
            CallClass::Status => self.status_seconds,
        };
        Duration::from_secs(seconds)
    }
}

impl Config {
    /// Loads `path` (optional) and then `SLICER__SECTION__KEY` overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_constants() {
        let config = Config::default();
        assert_eq!(config.scheduler.overcommit_factor, 2.0);
        assert_eq!(config.scheduler.ram_weight, 0.5);
        assert_eq!(config.scheduler.disk_weight, 0.25);
        assert_eq!(config.scheduler.vcpu_weight, 0.25);
        assert_eq!(config.cluster.display_base_port, 5900);
    }

    #[test]
    fn each_call_class_has_its_own_timeout() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.for_class(CallClass::Auth), Duration::from_secs(10));
        assert_eq!(timeouts.for_class(CallClass::Create), Duration::from_secs(120));
        assert_eq!(timeouts.for_class(CallClass::Delete), Duration::from_secs(60));
        assert_eq!(timeouts.for_class(CallClass::Status), Duration::from_secs(15));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::from_file("does/not/exist").expect("defaults");
        assert_eq!(config.cluster.vm_create_path, "/vm/create");
        assert_eq!(config.paths.slices_dir, PathBuf::from("slices"));
    }
}
