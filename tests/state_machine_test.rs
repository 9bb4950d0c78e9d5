use flowmesh::consensus::{RegistryState, SharedRegistry};
use flowmesh::types::*;
use std::collections::HashMap;

fn register_cmd(id: &str, address: &str, cloud_tag: &str) -> Command {
    Command::register_worker(&RegisterWorkerPayload {
        id: id.to_string(),
        address: address.to_string(),
        cloud_tag: cloud_tag.to_string(),
    })
    .unwrap()
}

fn status_cmd(id: &str, status: WorkerStatus) -> Command {
    Command::update_worker_status(&UpdateWorkerStatusPayload {
        id: id.to_string(),
        status,
    })
    .unwrap()
}

#[test]
fn test_registry_state_new() {
    let state = RegistryState::new();
    assert!(state.workers.is_empty());
    assert_eq!(state.last_applied_index, 0);
}

#[test]
fn test_apply_register_worker() {
    let mut state = RegistryState::new();
    let result = state.apply(&register_cmd("w-1", "10.10.0.20:8081", "aws"), 1);
    assert!(result.error.is_none());

    let worker = state.workers.get("w-1").unwrap();
    assert_eq!(worker.id, "w-1");
    assert_eq!(worker.address, "10.10.0.20:8081");
    assert_eq!(worker.cloud_tag, "aws");
    assert_eq!(worker.status, WorkerStatus::Online);
}

#[test]
fn test_reregister_overwrites_and_resets_online() {
    let mut state = RegistryState::new();
    state.apply(&register_cmd("w-1", "10.10.0.20:8081", "aws"), 1);
    state.apply(&status_cmd("w-1", WorkerStatus::Offline), 2);
    assert_eq!(state.workers["w-1"].status, WorkerStatus::Offline);

    let result = state.apply(&register_cmd("w-1", "10.10.0.99:8081", "gcp"), 3);
    assert!(result.error.is_none());

    let worker = &state.workers["w-1"];
    assert_eq!(worker.status, WorkerStatus::Online);
    assert_eq!(worker.address, "10.10.0.99:8081");
    assert_eq!(worker.cloud_tag, "gcp");
}

#[test]
fn test_apply_update_worker_status() {
    let mut state = RegistryState::new();
    state.apply(&register_cmd("w-1", "10.10.0.20:8081", "aws"), 1);

    let result = state.apply(&status_cmd("w-1", WorkerStatus::Offline), 2);
    assert!(result.error.is_none());
    assert_eq!(state.workers["w-1"].status, WorkerStatus::Offline);
}

#[test]
fn test_update_unknown_worker_is_error_not_panic() {
    let mut state = RegistryState::new();
    let result = state.apply(&status_cmd("ghost", WorkerStatus::Offline), 1);
    let err = result.error.expect("expected an error result");
    assert!(err.contains("ghost"), "error should name the worker: {err}");
    assert!(state.workers.is_empty());
}

#[test]
fn test_malformed_payload_is_error_not_panic() {
    let mut state = RegistryState::new();
    let cmd = Command {
        kind: CommandType::RegisterWorker,
        payload: serde_json::json!("definitely not an object"),
    };
    let result = state.apply(&cmd, 1);
    assert!(result.error.is_some());
    assert!(state.workers.is_empty());
}

#[test]
fn test_unknown_command_type_is_error() {
    // A command written by a newer version decodes to the catch-all type.
    let cmd: Command =
        serde_json::from_str(r#"{"type":"decommission_worker","payload":{"id":"w-1"}}"#).unwrap();
    assert_eq!(cmd.kind, CommandType::Unknown);

    let mut state = RegistryState::new();
    let result = state.apply(&cmd, 1);
    assert!(result.error.is_some());
}

#[test]
fn test_command_wire_format_is_stable() {
    let cmd = register_cmd("w-1", "10.10.0.20:8081", "aws");
    let encoded = serde_json::to_value(&cmd).unwrap();
    assert_eq!(
        encoded,
        serde_json::json!({
            "type": "register_worker",
            "payload": {"id": "w-1", "address": "10.10.0.20:8081", "cloud_tag": "aws"}
        })
    );

    let cmd = status_cmd("w-1", WorkerStatus::Offline);
    let encoded = serde_json::to_value(&cmd).unwrap();
    assert_eq!(
        encoded,
        serde_json::json!({
            "type": "update_worker_status",
            "payload": {"id": "w-1", "status": "offline"}
        })
    );
}

/// Two fresh state machines fed the same command sequence end up with the
/// same worker set.
#[test]
fn test_apply_is_deterministic() {
    let commands = vec![
        register_cmd("w-0", "10.10.0.20:8081", "aws"),
        register_cmd("w-1", "10.20.0.20:8081", "gcp"),
        register_cmd("w-2", "10.30.0.20:8081", "azure"),
        status_cmd("w-1", WorkerStatus::Offline),
        register_cmd("w-0", "10.10.0.21:8081", "aws"),
    ];

    let mut a = RegistryState::new();
    let mut b = RegistryState::new();
    for (i, cmd) in commands.iter().enumerate() {
        a.apply(cmd, i as u64 + 1);
        b.apply(cmd, i as u64 + 1);
    }

    assert_eq!(a.workers.len(), b.workers.len());
    for (id, wa) in &a.workers {
        let wb = &b.workers[id];
        assert_eq!(wa.address, wb.address);
        assert_eq!(wa.cloud_tag, wb.cloud_tag);
        assert_eq!(wa.status, wb.status);
    }
    assert_eq!(a.workers["w-1"].status, WorkerStatus::Offline);
    assert_eq!(a.workers["w-0"].address, "10.10.0.21:8081");
}

#[test]
fn test_snapshot_round_trip() {
    let registry = SharedRegistry::new();
    for (i, tag) in ["aws", "gcp", "azure"].iter().enumerate() {
        registry.apply(
            &register_cmd(
                &format!("w-{i}"),
                &format!("10.{}.0.20:8081", (i + 1) * 10),
                tag,
            ),
            i as u64 + 1,
        );
    }
    registry.apply(&status_cmd("w-1", WorkerStatus::Offline), 4);

    let data = serde_json::to_vec(&registry.snapshot_workers()).unwrap();

    let restored = SharedRegistry::new();
    let workers: HashMap<String, WorkerInfo> = serde_json::from_slice(&data).unwrap();
    restored.restore_workers(workers, 4);

    assert_eq!(restored.workers(), registry.workers());
    assert_eq!(restored.last_applied(), 4);
    assert_eq!(
        restored.get_worker("w-1").unwrap().status,
        WorkerStatus::Offline
    );
}

#[test]
fn test_snapshot_ignores_unknown_fields_and_defaults_missing() {
    let data = r#"{
        "w-1": {"id": "w-1", "address": "10.10.0.20:8081", "cloud_tag": "aws",
                "status": "online", "last_seen": "2026-01-01T00:00:00Z",
                "gpu_count": 4},
        "w-2": {"id": "w-2"}
    }"#;
    let workers: HashMap<String, WorkerInfo> = serde_json::from_str(data).unwrap();

    assert_eq!(workers["w-1"].status, WorkerStatus::Online);
    assert_eq!(workers["w-2"].status, WorkerStatus::Offline);
    assert_eq!(workers["w-2"].address, "");
}

#[test]
fn test_accessors_return_deep_copies() {
    let registry = SharedRegistry::new();
    registry.apply(&register_cmd("w-1", "10.10.0.20:8081", "aws"), 1);

    let mut copy = registry.workers();
    copy.get_mut("w-1").unwrap().status = WorkerStatus::Offline;
    copy.remove("w-1");

    assert_eq!(
        registry.get_worker("w-1").unwrap().status,
        WorkerStatus::Online
    );

    let mut one = registry.get_worker("w-1").unwrap();
    one.cloud_tag = "mutated".into();
    assert_eq!(registry.get_worker("w-1").unwrap().cloud_tag, "aws");
}

#[test]
fn test_shared_registry_tracks_last_applied() {
    let registry = SharedRegistry::new();
    assert_eq!(registry.last_applied(), 0);
    registry.apply(&register_cmd("w-1", "10.10.0.20:8081", "aws"), 42);
    assert_eq!(registry.last_applied(), 42);
}

#[test]
fn test_get_worker_missing_is_none() {
    let registry = SharedRegistry::new();
    assert!(registry.get_worker("nope").is_none());
}
