#![allow(dead_code)]

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use slice_orchestrator::config::Config;
use slice_orchestrator::model::{
    BackendKind, Demand, ImageRef, ResourceSpec, Resources, Slice, SliceNode, SliceState, Worker,
};
use slice_orchestrator::MemoryStore;

pub const ZONE: &str = "Z1";

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Config pointing at the fakes, with unit conversions of 1 so inventory
/// figures read like request figures.
pub fn test_config(cluster: Option<SocketAddr>, cloud: Option<SocketAddr>, slices_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.scheduler.ram_unit_bytes = 1.0;
    config.scheduler.disk_unit_bytes = 1.0;
    if let Some(addr) = cluster {
        config.cluster.api_url = format!("http://{addr}");
    }
    if let Some(addr) = cloud {
        config.cloud.identity_url = format!("http://{addr}");
        config.cloud.compute_url = format!("http://{addr}/v2.1");
        config.cloud.network_url = format!("http://{addr}/v2.0");
        config.cloud.password = "secret".to_string();
        config.cloud.image_ref = "glance-cirros".to_string();
    }
    config.paths.slices_dir = slices_dir.to_path_buf();
    config
}

pub fn worker(id: i64, name: &str, ram: f64, disk: f64, vcpu: f64) -> Worker {
    Worker {
        id,
        name: name.to_string(),
        zone: ZONE.to_string(),
        capacity: Resources::new(ram, disk, vcpu),
        headroom: Resources::new(ram, disk, vcpu),
        max_display_port: None,
    }
}

/// Two workers in `ZONE` and the `cirros` image.
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_worker(worker(1, "compute1", 8192.0, 100.0, 4.0)).await;
    store.insert_worker(worker(2, "compute2", 4096.0, 50.0, 8.0)).await;
    store.insert_image("cirros", None).await;
    store
}

pub fn manual(vcpu: u32, ram: u64, disk: u64) -> ResourceSpec {
    ResourceSpec::Manual(Demand { vcpu, ram, disk })
}

pub fn topology(name: &str, backend: BackendKind, nodes: &[(&str, ResourceSpec, &[&str])]) -> Slice {
    let mut map = IndexMap::new();
    for (key, resources, links) in nodes {
        map.insert(
            key.to_string(),
            SliceNode {
                resources: resources.clone(),
                image: ImageRef {
                    name: "cirros".to_string(),
                    url: None,
                },
                links: links.iter().map(|l| l.to_string()).collect(),
                worker_id: None,
                instantiated: false,
                token: None,
            },
        );
    }
    Slice {
        name: name.to_string(),
        backend,
        zone: ZONE.to_string(),
        state: SliceState::Saved,
        vlan_id: None,
        nodes: map,
        vm_names: IndexMap::new(),
        network: None,
    }
}

// ---------------------------------------------------------------- cluster

#[derive(Default)]
pub struct ClusterCalls {
    pub creates: Vec<Value>,
    pub deletes: Vec<HashMap<String, String>>,
    pub flows: Vec<Value>,
    /// Workers whose VM creations are answered with 500.
    pub failing_workers: Vec<i64>,
    pub failing_deletes: bool,
}

pub type ClusterLog = Arc<Mutex<ClusterCalls>>;

async fn cluster_create(State(log): State<ClusterLog>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut log = log.lock().unwrap();
    let worker_id = body["worker_id"].as_i64().unwrap_or_default();
    log.creates.push(body);
    if log.failing_workers.contains(&worker_id) {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boot failed"})))
    } else {
        (StatusCode::OK, Json(json!({"status": "created"})))
    }
}

async fn cluster_delete(
    State(log): State<ClusterLog>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let mut log = log.lock().unwrap();
    log.deletes.push(params);
    if log.failing_deletes {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn cluster_flows(State(log): State<ClusterLog>, Json(body): Json<Value>) -> StatusCode {
    log.lock().unwrap().flows.push(body);
    StatusCode::OK
}

pub async fn spawn_cluster() -> (SocketAddr, ClusterLog) {
    let log: ClusterLog = Arc::default();
    let app = Router::new()
        .route("/vm/create", post(cluster_create))
        .route("/vm/delete", get(cluster_delete))
        .route("/flows", post(cluster_flows))
        .with_state(log.clone());
    (serve(app).await, log)
}

// ------------------------------------------------------------------ cloud

#[derive(Clone, Debug)]
pub struct FakeServer {
    pub id: String,
    pub name: String,
    pub status: String,
    pub hypervisor: String,
}

#[derive(Default)]
pub struct CloudCalls {
    pub auths: usize,
    pub networks: Vec<Value>,
    pub subnets: Vec<Value>,
    pub flavors_created: Vec<Value>,
    pub server_creates: Vec<(Value, Option<String>)>,
    pub servers: Vec<FakeServer>,
    pub deleted: Vec<String>,
    pub hypervisors: Vec<Value>,
    pub next_id: usize,
}

pub type CloudLog = Arc<Mutex<CloudCalls>>;

async fn cloud_auth(State(log): State<CloudLog>, Json(_body): Json<Value>) -> impl IntoResponse {
    let mut log = log.lock().unwrap();
    log.auths += 1;
    let token = format!("token-{}", log.auths);
    let expires_at = (Utc::now() + Duration::hours(1)).to_rfc3339();
    (
        StatusCode::CREATED,
        [("X-Subject-Token", token)],
        Json(json!({"token": {"expires_at": expires_at, "project": {"id": "p1"}}})),
    )
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("X-Auth-Token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("token-"))
}

async fn cloud_network(
    State(log): State<CloudLog>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    let mut log = log.lock().unwrap();
    log.networks.push(body.clone());
    let id = format!("net-{}", log.networks.len());
    (
        StatusCode::CREATED,
        Json(json!({"network": {"id": id, "name": body["network"]["name"]}})),
    )
}

async fn cloud_subnet(State(log): State<CloudLog>, Json(body): Json<Value>) -> impl IntoResponse {
    log.lock().unwrap().subnets.push(body.clone());
    (StatusCode::CREATED, Json(json!({"subnet": body["subnet"]})))
}

async fn cloud_flavor_list() -> Json<Value> {
    Json(json!({"flavors": [{"id": "flv-small", "name": "m1.small"}]}))
}

async fn cloud_flavor_create(State(log): State<CloudLog>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut log = log.lock().unwrap();
    let name = &body["flavor"]["name"];
    if log.flavors_created.iter().any(|f| &f["flavor"]["name"] == name) {
        return (
            StatusCode::CONFLICT,
            Json(json!({"conflictingRequest": {"code": 409, "message": "Flavor already exists"}})),
        );
    }
    log.flavors_created.push(body.clone());
    let id = format!("flv-{}", log.flavors_created.len());
    (StatusCode::OK, Json(json!({"flavor": {"id": id, "name": name}})))
}

async fn cloud_server_create(
    State(log): State<CloudLog>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut log = log.lock().unwrap();
    let version = headers
        .get("X-OpenStack-Nova-API-Version")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    log.server_creates.push((body.clone(), version));
    log.next_id += 1;
    let server = FakeServer {
        id: format!("srv-{}", log.next_id),
        name: body["server"]["name"].as_str().unwrap_or_default().to_string(),
        status: "ACTIVE".to_string(),
        hypervisor: body["server"]["hypervisor_hostname"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    };
    let id = server.id.clone();
    log.servers.push(server);
    (StatusCode::ACCEPTED, Json(json!({"server": {"id": id}})))
}

async fn cloud_server_list(State(log): State<CloudLog>) -> Json<Value> {
    let log = log.lock().unwrap();
    let servers: Vec<Value> = log
        .servers
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "status": s.status,
                "OS-EXT-STS:power_state": 1,
                "OS-EXT-STS:task_state": null
            })
        })
        .collect();
    Json(json!({ "servers": servers }))
}

async fn cloud_server_delete(State(log): State<CloudLog>, Path(id): Path<String>) -> StatusCode {
    let mut log = log.lock().unwrap();
    log.deleted.push(id.clone());
    log.servers.retain(|s| s.id != id);
    StatusCode::NO_CONTENT
}

async fn cloud_hypervisors(State(log): State<CloudLog>) -> Json<Value> {
    let log = log.lock().unwrap();
    Json(json!({ "hypervisors": log.hypervisors }))
}

pub async fn spawn_cloud() -> (SocketAddr, CloudLog) {
    let log: CloudLog = Arc::default();
    let app = Router::new()
        .route("/v3/auth/tokens", post(cloud_auth))
        .route("/v2.0/networks", post(cloud_network))
        .route("/v2.0/subnets", post(cloud_subnet))
        .route("/v2.1/flavors/detail", get(cloud_flavor_list))
        .route("/v2.1/flavors", post(cloud_flavor_create))
        .route("/v2.1/servers", post(cloud_server_create))
        .route("/v2.1/servers/detail", get(cloud_server_list))
        .route("/v2.1/servers/:id", delete(cloud_server_delete))
        .route("/v2.1/os-hypervisors/detail", get(cloud_hypervisors))
        .with_state(log.clone());
    (serve(app).await, log)
}
