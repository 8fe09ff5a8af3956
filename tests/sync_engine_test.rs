mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use pretty_assertions::assert_eq;

use common::{
    fast_settings, non_conformity, photo, sample_record, service_with, service_with_settings, tile,
    Call, RecordingApi,
};
use tile_survey::db::queue::{self, Backoff};
use tile_survey::engine::Trigger;
use tile_survey::model::{OperationKind, RecordStatus, TileConfiguration, UploadStatus};
use tile_survey::remote::{InspectionApi, RemoteError};
use tile_survey::status::ConnectionState;

fn server_error() -> RemoteError {
    RemoteError::Server {
        status: 503,
        body: "maintenance".into(),
    }
}

#[tokio::test]
async fn offline_edits_sync_exactly_once_after_reconnect() {
    let api = RecordingApi::default();
    let service = service_with(api.clone(), false).await;

    let record = service.save_draft(sample_record("PROTO-42")).await.unwrap();
    assert_eq!(record.status, RecordStatus::PendingSync);
    let id = record.local_id;
    service.add_tile(id, tile("T2")).await.unwrap();
    service.add_tile(id, tile("T3")).await.unwrap();
    let entry = service
        .add_non_conformity(
            id,
            non_conformity("Cracked ridge tile", vec![photo(b"ridge-photo")]),
        )
        .await
        .unwrap();

    let status = service.get_sync_status().await.unwrap();
    assert_eq!(status.status, ConnectionState::Offline);
    assert_eq!(status.pending_count, 4);

    // Automatic triggers stay quiet while offline.
    let report = service.engine().drain(Trigger::Periodic).await.unwrap();
    assert!(report.skipped);
    assert!(api.calls().await.is_empty());

    service.monitor().set_platform_state(true);
    let report = service.engine().drain(Trigger::Reconnect).await.unwrap();
    assert_eq!((report.succeeded, report.failed, report.requeued), (4, 0, 0));

    assert_eq!(
        api.call_names().await,
        vec![
            "create_inspection",
            "create_tile",
            "create_tile",
            "create_non_conformity"
        ]
    );
    let calls = api.calls().await;
    for call in &calls[1..3] {
        match call {
            Call::CreateTile {
                parent, gross_area, ..
            } => {
                assert_eq!(parent, "srv-1");
                assert!((gross_area - 268.4).abs() < 1e-9);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }
    match &calls[3] {
        Call::CreateNonConformity {
            parent,
            title,
            photos,
            ..
        } => {
            assert_eq!(parent, "srv-1");
            assert_eq!(title, "Cracked ridge tile");
            assert_eq!(
                photos,
                &vec![(entry.photos[0].photo_id, BASE64_STANDARD.encode(b"ridge-photo"))]
            );
        }
        other => panic!("unexpected call {other:?}"),
    }
    assert_eq!(api.created_count().await, 4);

    let stored = service.get_inspection(id).await.unwrap();
    assert_eq!(stored.status, RecordStatus::Synced);
    assert_eq!(stored.remote_id.as_deref(), Some("srv-1"));
    assert!(stored.synced_at.is_some());
    let photos = service.get_photos(id).await.unwrap();
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].upload_status, UploadStatus::Uploaded);

    let status = service.get_sync_status().await.unwrap();
    assert_eq!(status.status, ConnectionState::Online);
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.needs_attention, 0);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test]
async fn rejected_tile_leaves_inspection_synced() {
    let api = RecordingApi::default();
    api.reject("T-BAD", 422).await;
    let service = service_with(api.clone(), true).await;

    let mut record = sample_record("PROTO-7");
    record
        .tiles
        .push(TileConfiguration::new("T-OK", 1.0, 1.0, 10).unwrap());
    let bad = TileConfiguration::new("T-BAD", 1.0, 1.0, 10).unwrap();
    record.tiles.push(bad.clone());
    let record = service.save_draft(record).await.unwrap();

    let report = service.force_sync().await.unwrap();
    assert_eq!((report.succeeded, report.failed), (2, 1));

    let stored = service.get_inspection(record.local_id).await.unwrap();
    assert_eq!(stored.status, RecordStatus::Synced);
    assert_eq!(stored.remote_id.as_deref(), Some("srv-1"));

    let failed = service.failed_items().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, OperationKind::CreateTile);
    assert_eq!(failed[0].entity_local_id, bad.local_id);
    assert!(failed[0].last_error.as_deref().unwrap().contains("422"));

    let status = service.get_sync_status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.needs_attention, 1);

    // Parked items are off the retry path.
    service.force_sync().await.unwrap();
    assert_eq!(api.calls().await.len(), 3);
}

#[tokio::test]
async fn permanent_failure_does_not_block_other_records() {
    let api = RecordingApi::default();
    api.reject("PROTO-X", 400).await;
    let service = service_with(api.clone(), true).await;

    let mut x = sample_record("PROTO-X");
    x.tiles.push(TileConfiguration::new("T1", 1.0, 1.0, 1).unwrap());
    let x = service.save_draft(x).await.unwrap();
    let y = service.save_draft(sample_record("PROTO-Y")).await.unwrap();

    service.force_sync().await.unwrap();

    let y_stored = service.get_inspection(y.local_id).await.unwrap();
    assert_eq!(y_stored.status, RecordStatus::Synced);
    let x_stored = service.get_inspection(x.local_id).await.unwrap();
    assert_eq!(x_stored.status, RecordStatus::PendingSync);
    assert_eq!(x_stored.remote_id, None);

    // The tile never left the device: its parent has no remote id.
    assert_eq!(
        api.call_names().await,
        vec!["create_inspection", "create_inspection"]
    );
    let failed = service.failed_items().await.unwrap();
    let kinds: Vec<_> = failed.iter().map(|i| i.kind).collect();
    assert_eq!(
        kinds,
        vec![OperationKind::CreateInspection, OperationKind::CreateTile]
    );
    assert!(failed[1].last_error.as_deref().unwrap().contains("no remote id"));

    api.accept("PROTO-X").await;
    assert_eq!(service.retry_failure(failed[0].item_id).await.unwrap(), 2);
    let report = service.force_sync().await.unwrap();
    assert_eq!(report.succeeded, 2);

    let x_stored = service.get_inspection(x.local_id).await.unwrap();
    assert_eq!(x_stored.status, RecordStatus::Synced);
    let tile_parent = api.calls().await.into_iter().find_map(|c| match c {
        Call::CreateTile { parent, .. } => Some(parent),
        _ => None,
    });
    assert_eq!(tile_parent, x_stored.remote_id);
}

#[tokio::test]
async fn update_is_not_sent_before_its_create() {
    let api = RecordingApi::with_failures(vec![server_error()]);
    let service = service_with(api.clone(), true).await;

    let record = service.save_draft(sample_record("P-1")).await.unwrap();
    let mut edited = record.clone();
    edited.protocol_code = "P-1b".into();
    service.save_draft(edited).await.unwrap();

    let report = service.force_sync().await.unwrap();
    assert_eq!((report.succeeded, report.requeued), (0, 1));
    assert_eq!(api.call_names().await, vec!["create_inspection"]);
    assert!(service.monitor().is_online());
    assert_eq!(service.get_sync_status().await.unwrap().pending_count, 2);

    let report = service.force_sync().await.unwrap();
    assert_eq!(report.succeeded, 2);
    let calls = api.calls().await;
    assert_eq!(
        api.call_names().await,
        vec!["create_inspection", "create_inspection", "update_inspection"]
    );
    // The retried create keeps its idempotency key.
    assert_eq!(calls[0].key(), calls[1].key());
    match &calls[2] {
        Call::UpdateInspection {
            remote_id,
            protocol_code,
            ..
        } => {
            assert_eq!(remote_id, "srv-1");
            assert_eq!(protocol_code, "P-1b");
        }
        other => panic!("unexpected call {other:?}"),
    }
    assert_eq!(
        service.get_inspection(record.local_id).await.unwrap().status,
        RecordStatus::Synced
    );
}

#[tokio::test]
async fn transient_failure_does_not_starve_later_records() {
    let api = RecordingApi::with_failures(vec![server_error()]);
    let mut settings = fast_settings();
    settings.batch_size = 1;
    settings.backoff = Backoff {
        base_secs: 5,
        max_secs: 3600,
    };
    let service = service_with_settings(api.clone(), true, settings).await;
    let first = service.save_draft(sample_record("P-A")).await.unwrap();
    let second = service.save_draft(sample_record("P-B")).await.unwrap();

    let report = service.force_sync().await.unwrap();
    assert_eq!((report.succeeded, report.requeued), (1, 1));
    assert_eq!(
        api.call_names().await,
        vec!["create_inspection", "create_inspection"]
    );
    assert_eq!(
        service.get_inspection(first.local_id).await.unwrap().status,
        RecordStatus::PendingSync
    );
    assert_eq!(
        service.get_inspection(second.local_id).await.unwrap().status,
        RecordStatus::Synced
    );
}

#[tokio::test]
async fn pending_count_is_published_after_every_item() {
    let api = RecordingApi::default();
    let service = service_with(api.clone(), true).await;
    let record = service.save_draft(sample_record("P-C")).await.unwrap();
    service.add_tile(record.local_id, tile("T1")).await.unwrap();
    service.add_tile(record.local_id, tile("T2")).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        service.subscribe_status(move |status| {
            seen.lock().unwrap().push(status.pending_count);
        });
    }

    let report = service.force_sync().await.unwrap();
    assert_eq!(report.succeeded, 3);

    let mut counts = seen.lock().unwrap().clone();
    counts.dedup();
    assert_eq!(counts, vec![3, 2, 1, 0]);
}

#[tokio::test]
async fn locally_mapped_create_is_acked_without_a_call() {
    let api = RecordingApi::default();
    let service = service_with(api.clone(), true).await;
    let record = service.save_draft(sample_record("P-2")).await.unwrap();

    // The server answered on an earlier run but the ack never committed.
    sqlx::query("INSERT INTO id_map (local_id, remote_id, entity) VALUES (?, 'srv-earlier', 'inspection')")
        .bind(record.local_id.to_string())
        .execute(service.engine().store().pool())
        .await
        .unwrap();

    let report = service.force_sync().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(api.calls().await.is_empty());

    let stored = service.get_inspection(record.local_id).await.unwrap();
    assert_eq!(stored.remote_id.as_deref(), Some("srv-earlier"));
    assert_eq!(stored.status, RecordStatus::Synced);
}

#[tokio::test]
async fn replayed_item_reuses_its_idempotency_key() {
    let api = RecordingApi::default();
    let service = service_with(api.clone(), true).await;
    let record = service.save_draft(sample_record("P-3")).await.unwrap();

    // The server processed an earlier attempt whose response was lost.
    let pool = service.engine().store().pool();
    let item = queue::list_all(pool).await.unwrap().remove(0);
    assert_eq!(item.idempotency_key(), item.item_id.to_string());
    let first = api
        .create_inspection(&item.idempotency_key(), &record.payload())
        .await
        .unwrap();

    service.force_sync().await.unwrap();

    assert_eq!(api.created_count().await, 1);
    let calls = api.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].key(), item.item_id.to_string());
    let stored = service.get_inspection(record.local_id).await.unwrap();
    assert_eq!(stored.remote_id, Some(first));
}

#[tokio::test]
async fn unreachable_server_goes_offline_and_leaves_items_queued() {
    let api = RecordingApi::with_failures(vec![RemoteError::Unreachable(
        "connection refused".into(),
    )]);
    let mut settings = fast_settings();
    settings.max_concurrency = 1;
    let service = service_with_settings(api.clone(), true, settings).await;
    service.save_draft(sample_record("P-A")).await.unwrap();
    service.save_draft(sample_record("P-B")).await.unwrap();

    let report = service.force_sync().await.unwrap();
    assert_eq!((report.succeeded, report.requeued), (0, 1));
    assert_eq!(api.calls().await.len(), 1);
    assert!(!service.monitor().is_online());

    let status = service.get_sync_status().await.unwrap();
    assert_eq!(status.status, ConnectionState::Offline);
    assert_eq!(status.pending_count, 2);

    let items = queue::list_all(service.engine().store().pool()).await.unwrap();
    assert_eq!(items[0].attempt, 1);
    assert_eq!(items[1].attempt, 0);

    assert!(service.engine().drain(Trigger::Periodic).await.unwrap().skipped);

    let report = service.force_sync().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(service.monitor().is_online());
}

#[tokio::test]
async fn second_trigger_during_a_pass_is_skipped() {
    let api = RecordingApi::with_delay(Duration::from_millis(200));
    let service = service_with(api.clone(), true).await;
    service.save_draft(sample_record("P-S")).await.unwrap();

    let engine = service.engine().clone();
    let first = tokio::spawn(async move { engine.drain(Trigger::Manual).await.unwrap() });

    for _ in 0..100 {
        if service.engine().is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(service.engine().is_running());
    assert_eq!(
        service.get_sync_status().await.unwrap().status,
        ConnectionState::Syncing
    );

    let second = service.force_sync().await.unwrap();
    assert!(second.skipped);

    let first = first.await.unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(api.calls().await.len(), 1);
    assert_eq!(
        service.get_sync_status().await.unwrap().status,
        ConnectionState::Online
    );
}

#[tokio::test]
async fn repeated_transient_failures_escalate() {
    let api = RecordingApi::with_failures(vec![server_error(), server_error(), server_error()]);
    let service = service_with(api.clone(), true).await;
    service.save_draft(sample_record("P-E")).await.unwrap();

    for round in 1..=3 {
        let report = service.force_sync().await.unwrap();
        assert_eq!(report.requeued, 1, "round {round}");
    }
    let status = service.get_sync_status().await.unwrap();
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.needs_attention, 1);
    assert!(service.failed_items().await.unwrap().is_empty());

    service.force_sync().await.unwrap();
    let status = service.get_sync_status().await.unwrap();
    assert_eq!((status.pending_count, status.needs_attention), (0, 0));
}

#[tokio::test]
async fn slow_call_times_out_as_transient() {
    let api = RecordingApi::with_delay(Duration::from_millis(500));
    let mut settings = fast_settings();
    settings.request_timeout = Duration::from_millis(50);
    let service = service_with_settings(api.clone(), true, settings).await;
    service.save_draft(sample_record("P-T")).await.unwrap();

    let report = service.force_sync().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert!(!service.monitor().is_online());

    let items = queue::list_all(service.engine().store().pool()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attempt, 1);
    assert!(items[0].last_error.as_deref().unwrap().contains("timed out"));
    assert_eq!(api.created_count().await, 0);
}

#[tokio::test]
async fn reconnect_runs_one_pass_regardless_of_listeners() {
    let api = RecordingApi::default();
    let service = service_with(api.clone(), false).await;
    service.save_draft(sample_record("P-R")).await.unwrap();

    let passes = Arc::new(AtomicUsize::new(0));
    {
        let passes = passes.clone();
        service.subscribe_status(move |status| {
            if status.status == ConnectionState::Syncing {
                passes.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    for _ in 0..3 {
        service.monitor().subscribe(|_| {});
    }

    let auto = service.engine().spawn_auto_sync();
    service.monitor().set_platform_state(true);

    for _ in 0..200 {
        if service.get_sync_status().await.unwrap().pending_count == 0
            && !service.engine().is_running()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(api.call_names().await, vec!["create_inspection"]);
    assert_eq!(passes.load(Ordering::SeqCst), 1);

    auto.abort();
}
