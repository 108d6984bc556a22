//! Storage client flow tests against the in-memory mock
//!
//! These exercise the exact call sequences the reconcilers perform:
//! volume preparation, snapshot/backup capture, and teardown.

use storage_client::{
    CreateVolumeRequest, MockStorageClient, StorageClientTrait, StorageError,
};

fn volume_request(name: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        frontend: "iscsi".to_string(),
        size: "10Gi".to_string(),
        base_image: "registry.local/vm/ubuntu:latest".to_string(),
        number_of_replicas: 3,
        stale_replica_timeout: 20,
    }
}

#[tokio::test]
async fn volume_create_is_guarded_by_get() {
    let client = MockStorageClient::new();

    assert!(client.get_volume("m1").await.unwrap().is_none());
    client.create_volume(volume_request("m1")).await.unwrap();

    let vol = client.get_volume("m1").await.unwrap().unwrap();
    assert_eq!(vol.frontend, "iscsi");
    assert_eq!(vol.number_of_replicas, 3);

    // A duplicate create is what a stale cache would produce; the service
    // rejects it and the reconciler treats the existing volume as success.
    assert!(client.create_volume(volume_request("m1")).await.is_err());
    assert_eq!(client.volume_count(), 1);
}

#[tokio::test]
async fn snapshot_then_backup_then_lookup() {
    let client = MockStorageClient::new();
    client.create_volume(volume_request("m1")).await.unwrap();

    let snapshot = client.create_snapshot("m1").await.unwrap();
    assert!(!snapshot.name.is_empty());

    // Backup not present until created.
    assert!(client
        .get_backup("m1", &snapshot.name)
        .await
        .unwrap()
        .is_none());

    client.create_backup("m1", &snapshot.name).await.unwrap();
    let backup = client
        .get_backup("m1", &snapshot.name)
        .await
        .unwrap()
        .expect("backup should exist after create");
    assert_eq!(backup.volume_name, "m1");
    assert!(backup.url.contains("backup="));
    assert!(backup.url.contains("volume="));
}

#[tokio::test]
async fn get_backup_filters_by_snapshot_name() {
    let client = MockStorageClient::new();
    client.create_volume(volume_request("m1")).await.unwrap();

    let first = client.create_snapshot("m1").await.unwrap();
    let second = client.create_snapshot("m1").await.unwrap();
    client.create_backup("m1", &first.name).await.unwrap();
    client.create_backup("m1", &second.name).await.unwrap();

    let found = client.get_backup("m1", &second.name).await.unwrap().unwrap();
    assert_eq!(found.snapshot_name, second.name);

    let list = client.backup_list("m1").await.unwrap();
    assert_eq!(list.items.len(), 2);
}

#[tokio::test]
async fn attach_records_node() {
    let client = MockStorageClient::new();
    client.create_volume(volume_request("m1")).await.unwrap();
    client.attach_volume("m1", "node-a").await.unwrap();

    let vol = client.get_volume("m1").await.unwrap().unwrap();
    assert_eq!(vol.state, "attached");
    assert_eq!(vol.controllers[0].node_id, "node-a");
}

#[tokio::test]
async fn delete_removes_volume_and_backups() {
    let client = MockStorageClient::new();
    client.create_volume(volume_request("m1")).await.unwrap();
    let snap = client.create_snapshot("m1").await.unwrap();
    client.create_backup("m1", &snap.name).await.unwrap();

    client.delete_volume("m1").await.unwrap();
    assert!(client.get_volume("m1").await.unwrap().is_none());
    assert!(client.backup_list("m1").await.unwrap().items.is_empty());
}

#[tokio::test]
async fn injected_failures_surface_as_api_errors() {
    let client = MockStorageClient::new();
    client.set_fail_all(true);

    match client.get_volume("m1").await {
        Err(StorageError::Api(_)) => {}
        other => panic!("expected an API error, got {:?}", other.map(|_| ())),
    }
}
