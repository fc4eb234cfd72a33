mod common;

use std::sync::Arc;

use common::{manual, seeded_store, spawn_cluster, test_config, topology, ClusterLog};
use slice_orchestrator::error::{OrchestratorError, SchedulerError, ValidationError};
use slice_orchestrator::model::{BackendKind, ResourceSpec, SliceState, VmState};
use slice_orchestrator::{
    CloudDriver, ClusterDriver, DeleteOutcome, MemoryStore, PlacementScheduler, ResourceStore,
    SliceDocuments, SliceOrchestrator,
};
use tempfile::TempDir;

struct Harness {
    orchestrator: SliceOrchestrator,
    store: Arc<MemoryStore>,
    log: ClusterLog,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let (addr, log) = spawn_cluster().await;
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store().await;
    let config = test_config(Some(addr), None, dir.path());
    let orchestrator = SliceOrchestrator::new(
        store.clone(),
        PlacementScheduler::new(&config.scheduler),
        SliceDocuments::new(dir.path()),
    )
    .with_driver(Arc::new(ClusterDriver::new(&config, store.clone()).unwrap()));
    Harness {
        orchestrator,
        store,
        log,
        _dir: dir,
    }
}

fn lab() -> slice_orchestrator::model::Slice {
    topology(
        "lab",
        BackendKind::Cluster,
        &[("a", manual(1, 1024, 10), &["b"]), ("b", manual(1, 512, 5), &["a"])],
    )
}

#[tokio::test]
async fn create_executes_and_saves_the_document() {
    let h = harness().await;
    let mut slice = lab();

    let report = h.orchestrator.create_topology(&mut slice).await.unwrap();
    assert_eq!(report.created(), 2);
    assert_eq!(slice.state, SliceState::Executed);
    assert_eq!(slice.vlan_id, Some(1));
    assert!(slice.nodes.values().all(|n| n.worker_id.is_some() && n.instantiated));

    let saved = h.orchestrator.load_slice("lab").await.unwrap();
    assert_eq!(saved, slice);
}

#[tokio::test]
async fn infeasible_topology_is_left_untouched() {
    let h = harness().await;
    let mut slice = topology(
        "big",
        BackendKind::Cluster,
        &[("small", manual(1, 256, 1), &[]), ("huge", manual(64, 1_000_000, 10_000), &[])],
    );
    let before = slice.clone();

    let err = h.orchestrator.create_topology(&mut slice).await.unwrap_err();
    match err {
        OrchestratorError::Scheduling(SchedulerError::Infeasible { node }) => assert_eq!(node, "huge"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(slice, before);
    assert_eq!(h.store.write_count().await, 0);
    assert!(h.log.lock().unwrap().creates.is_empty());
    assert!(h.orchestrator.load_slice("big").await.is_err());
}

#[tokio::test]
async fn validation_fails_before_any_external_call() {
    let h = harness().await;

    let mut dangling = lab();
    dangling.nodes.get_mut("a").unwrap().links.push("ghost".into());
    assert!(matches!(
        h.orchestrator.create_topology(&mut dangling).await,
        Err(OrchestratorError::Validation(ValidationError::UnknownLink { .. }))
    ));

    let mut unknown_flavor = lab();
    unknown_flavor.nodes.get_mut("b").unwrap().resources = ResourceSpec::Flavor("m9.huge".into());
    assert!(matches!(
        h.orchestrator.create_topology(&mut unknown_flavor).await,
        Err(OrchestratorError::Validation(ValidationError::UnknownFlavor(_)))
    ));

    let mut unknown_image = lab();
    unknown_image.nodes.get_mut("a").unwrap().image.name = "plan9".into();
    assert!(matches!(
        h.orchestrator.create_topology(&mut unknown_image).await,
        Err(OrchestratorError::Validation(ValidationError::UnknownImage(_)))
    ));

    let mut elsewhere = lab();
    elsewhere.zone = "Z9".into();
    assert!(matches!(
        h.orchestrator.create_topology(&mut elsewhere).await,
        Err(OrchestratorError::Validation(ValidationError::UnknownZone(_)))
    ));

    assert_eq!(h.store.write_count().await, 0);
    assert!(h.log.lock().unwrap().creates.is_empty());
}

#[tokio::test]
async fn update_only_creates_new_nodes() {
    let h = harness().await;
    let mut slice = lab();
    h.orchestrator.create_topology(&mut slice).await.unwrap();
    let token_a = slice.vm_names["a"].clone();

    let mut extra = topology("lab", BackendKind::Cluster, &[("c", manual(1, 256, 1), &["a"])]);
    let node = extra.nodes.shift_remove("c").unwrap();
    slice.nodes.insert("c".into(), node);

    let report = h.orchestrator.update_slice(&mut slice).await.unwrap();
    assert_eq!(report.outcomes.keys().collect::<Vec<_>>(), vec!["c"]);
    assert_eq!(slice.vlan_id, Some(1));
    assert_eq!(slice.vm_names["a"], token_a);

    let calls = h.log.lock().unwrap();
    assert_eq!(calls.creates.len(), 3);
    assert_eq!(calls.creates[2]["links"], token_a.as_str());
    drop(calls);

    let again = h.orchestrator.update_slice(&mut slice).await.unwrap();
    assert!(again.outcomes.is_empty());
    assert_eq!(h.log.lock().unwrap().creates.len(), 3);
}

#[tokio::test]
async fn delete_is_refused_while_a_vm_is_active() {
    let h = harness().await;
    let mut slice = lab();
    h.orchestrator.create_topology(&mut slice).await.unwrap();

    let vm_a = format!("vm-{}", slice.vm_names["a"]);
    let vm_b = format!("vm-{}", slice.vm_names["b"]);
    h.orchestrator
        .set_vm_state("lab", &vm_a, VmState::Inactive)
        .await
        .unwrap();

    let outcome = h.orchestrator.delete_slice(&mut slice).await.unwrap();
    match &outcome {
        DeleteOutcome::Refused { active_vms, message } => {
            assert_eq!(active_vms, &vec![vm_b.clone()]);
            assert!(message.contains(&vm_b));
            assert!(!message.contains(&vm_a));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.log.lock().unwrap().deletes.is_empty());
    assert_eq!(slice.state, SliceState::Executed);
    assert!(h.orchestrator.load_slice("lab").await.is_ok());
}

#[tokio::test]
async fn delete_removes_an_inactive_slice() {
    let h = harness().await;
    let mut slice = lab();
    h.orchestrator.create_topology(&mut slice).await.unwrap();

    for token in slice.vm_names.values() {
        h.orchestrator
            .set_vm_state("lab", &format!("vm-{token}"), VmState::Inactive)
            .await
            .unwrap();
    }

    let outcome = h.orchestrator.delete_slice(&mut slice).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Deleted { .. }));
    assert_eq!(h.log.lock().unwrap().deletes.len(), 2);
    assert!(h.store.slice("lab").await.unwrap().is_none());
    assert!(h.orchestrator.load_slice("lab").await.is_err());

    let worker = h.store.worker_snapshot(1).await.unwrap();
    assert_eq!(worker.headroom, worker.capacity);
}

#[tokio::test]
async fn marking_a_foreign_vm_fails() {
    let h = harness().await;
    let mut slice = lab();
    h.orchestrator.create_topology(&mut slice).await.unwrap();
    assert!(matches!(
        h.orchestrator.set_vm_state("lab", "vm-000000", VmState::Inactive).await,
        Err(OrchestratorError::UnknownVm { .. })
    ));
}

#[tokio::test]
async fn status_twice_is_identical() {
    let h = harness().await;
    let mut slice = lab();
    h.orchestrator.create_topology(&mut slice).await.unwrap();

    let first = h.orchestrator.status("lab", BackendKind::Cluster).await.unwrap();
    let second = h.orchestrator.status("lab", BackendKind::Cluster).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.vms.len(), 2);
}

#[tokio::test]
async fn missing_driver_is_reported() {
    let h = harness().await;
    let mut slice = topology("sky", BackendKind::Cloud, &[("a", manual(1, 256, 1), &[])]);
    assert!(matches!(
        h.orchestrator.create_topology(&mut slice).await,
        Err(OrchestratorError::NoDriver(BackendKind::Cloud))
    ));
}

#[tokio::test]
async fn backend_failure_restores_the_previous_state() {
    let unreachable = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store().await;
    let config = test_config(None, Some(unreachable), dir.path());
    let orchestrator = SliceOrchestrator::new(
        store.clone(),
        PlacementScheduler::new(&config.scheduler),
        SliceDocuments::new(dir.path()),
    )
    .with_driver(Arc::new(CloudDriver::new(&config, store.clone()).unwrap()));

    let mut slice = topology("sky", BackendKind::Cloud, &[("a", manual(1, 256, 1), &[])]);
    let result = orchestrator.create_topology(&mut slice).await;
    assert!(matches!(result, Err(OrchestratorError::Backend(_))));
    assert_eq!(slice.state, SliceState::Saved);
    assert!(slice.nodes.values().all(|n| !n.instantiated));
    assert!(store.slice_vms("sky").await.unwrap().is_empty());
}

#[tokio::test]
async fn saved_topology_is_stored_without_provisioning() {
    let h = harness().await;
    let slice = lab();

    h.orchestrator.save_slice(&slice).await.unwrap();
    assert_eq!(h.orchestrator.load_slice("lab").await.unwrap(), slice);
    assert_eq!(h.store.write_count().await, 0);
    assert!(h.log.lock().unwrap().creates.is_empty());

    let dangling = topology("loose", BackendKind::Cluster, &[("a", manual(1, 256, 1), &["x"])]);
    assert!(matches!(
        h.orchestrator.save_slice(&dangling).await,
        Err(OrchestratorError::Validation(ValidationError::UnknownLink { .. }))
    ));
    assert!(h.orchestrator.load_slice("loose").await.is_err());

    let mut saved = h.orchestrator.load_slice("lab").await.unwrap();
    let report = h.orchestrator.update_slice(&mut saved).await.unwrap();
    assert_eq!(report.created(), 2);
    assert_eq!(saved.state, SliceState::Executed);
}

#[tokio::test]
async fn vlan_ids_follow_the_highest_in_use_and_stay_put_on_update() {
    let h = harness().await;
    let mut first = lab();
    h.orchestrator.create_topology(&mut first).await.unwrap();
    let mut second = topology("lab2", BackendKind::Cluster, &[("a", manual(1, 256, 1), &[])]);
    h.orchestrator.create_topology(&mut second).await.unwrap();

    assert_eq!(first.vlan_id, Some(1));
    assert_eq!(second.vlan_id, Some(2));

    let mut extra = topology("lab", BackendKind::Cluster, &[("c", manual(1, 256, 1), &[])]);
    let node = extra.nodes.shift_remove("c").unwrap();
    first.nodes.insert("c".into(), node);
    h.orchestrator.update_slice(&mut first).await.unwrap();
    assert_eq!(first.vlan_id, Some(1));
    assert_eq!(h.store.slice("lab").await.unwrap().unwrap().vlan_id, 1);

    let calls = h.log.lock().unwrap();
    assert_eq!(calls.creates.last().unwrap()["vlan_id"], 1);
    assert_eq!(calls.flows.last().unwrap()["vlan_id"], 1);
}
