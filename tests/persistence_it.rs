mod common;

use common::{config_with_checkpoint_log, Harness};
use std::fs;
use tablet_retention::cdc::{RecordFormat, SourceType};
use tablet_retention::{
    CheckpointStore, CheckpointType, FileCheckpointStore, OpId, RetentionConfig, StreamOptions,
    StreamState, TabletScope,
};
use tempfile::tempdir;

fn namespace_stream() -> StreamOptions {
    StreamOptions::new(TabletScope::Namespace("shop".into()))
}

#[tokio::test]
async fn checkpoints_and_anchors_survive_a_restart() {
    let dir = tempdir().unwrap();
    let config = config_with_checkpoint_log(&dir.path().join("cdc/checkpoints.jsonl"));
    let h = Harness::with_config(config.clone());
    let tablet = h.leader_tablet("t1", "orders", 20);
    let stream = h.context.cdc().create_stream(namespace_stream()).unwrap();
    h.consensus.append_many(&tablet, 1, 20);
    h.context
        .cdc()
        .acknowledge(&stream, &tablet, OpId::new(1, 35))
        .unwrap();

    let h = h.restart(config);
    assert_eq!(h.context.cdc().list_streams().len(), 1);
    h.leader_tablet("t1", "orders", 0);
    assert_eq!(h.context.anchors().effective_floor(&tablet), Some(35));
    let checkpoint = h.context.cdc().get_checkpoint(&stream, &tablet).unwrap();
    assert_eq!(checkpoint.op_id, OpId::new(1, 35));

    let response = h.context.cdc().poll(&stream, &tablet).await.unwrap();
    assert_eq!(response.records.len(), 5);
    assert_eq!(response.records[0].op_id.index, 36);
}

#[test]
fn a_stream_draining_at_shutdown_is_released_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.jsonl");
    let config = config_with_checkpoint_log(&path);
    let h = Harness::with_config(config.clone());
    let tablet = h.leader_tablet("t1", "orders", 12);
    let stream = h.context.cdc().create_stream(namespace_stream()).unwrap();
    h.context.cdc().delete_stream(&stream).unwrap();

    let h = h.restart(config.clone());
    h.leader_tablet("t1", "orders", 0);
    assert_eq!(h.context.anchors().effective_floor(&tablet), Some(12));
    assert_eq!(h.context.cdc().pending_release_count(), 1);
    assert_eq!(h.context.cdc().drain_pending_releases(), 1);
    assert_eq!(h.context.anchors().effective_floor(&tablet), None);

    let h = h.restart(config);
    assert_eq!(h.context.cdc().pending_release_count(), 0);
    let persisted = FileCheckpointStore::open(&path).unwrap().load().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].state, StreamState::Deleted);
}

#[test]
fn a_release_drained_before_the_tablet_returns_does_not_leak_its_anchor() {
    let dir = tempdir().unwrap();
    let config = config_with_checkpoint_log(&dir.path().join("checkpoints.jsonl"));
    let h = Harness::with_config(config.clone());
    let tablet = h.leader_tablet("t1", "orders", 12);
    let stream = h.context.cdc().create_stream(namespace_stream()).unwrap();
    h.context.cdc().delete_stream(&stream).unwrap();

    let h = h.restart(config);
    // The tablet is not hosted yet, so there is nothing to release here and
    // the stream is marked deleted regardless.
    assert_eq!(h.context.cdc().drain_pending_releases(), 1);
    assert_eq!(
        h.context.cdc().stream_status(&stream).unwrap().state,
        StreamState::Deleted
    );

    h.leader_tablet("t1", "orders", 0);
    assert!(h.context.anchors().anchors(&tablet).is_empty());
    assert_eq!(h.context.anchors().effective_floor(&tablet), None);
}

#[test]
fn stream_anchors_without_a_stream_record_are_released_on_reload() {
    let dir = tempdir().unwrap();
    let config = config_with_checkpoint_log(&dir.path().join("checkpoints.jsonl"));
    let h = Harness::with_config(config.clone());
    let tablet = h.leader_tablet("t1", "orders", 12);
    // What a crash between anchoring and recording a new stream leaves behind.
    h.context
        .anchors()
        .register_anchor(&tablet, "lost-stream", 10, "cdc-stream")
        .unwrap();
    h.context
        .anchors()
        .register_anchor(&tablet, "remote-bootstrap", 4, "bootstrap")
        .unwrap();
    let live = h.context.cdc().create_stream(namespace_stream()).unwrap();

    let h = h.restart(config);
    h.leader_tablet("t1", "orders", 0);
    let mut owners: Vec<String> = h
        .context
        .anchors()
        .anchors(&tablet)
        .into_iter()
        .map(|anchor| anchor.owner)
        .collect();
    owners.sort();
    assert_eq!(owners, vec![live.as_str().to_string(), "remote-bootstrap".to_string()]);
    assert_eq!(h.context.anchors().effective_floor(&tablet), Some(4));
}

#[test]
fn stream_options_survive_a_restart() {
    let dir = tempdir().unwrap();
    let config = config_with_checkpoint_log(&dir.path().join("checkpoints.jsonl"));
    let h = Harness::with_config(config.clone());
    h.leader_tablet("t1", "orders", 3);
    let stream = h
        .context
        .cdc()
        .create_stream(
            namespace_stream()
                .with_source_type(SourceType::Xcluster)
                .with_record_format("json")
                .with_checkpoint_type(CheckpointType::Explicit),
        )
        .unwrap();

    let h = h.restart(config);
    let info = h
        .context
        .cdc()
        .list_streams()
        .into_iter()
        .find(|info| info.id == stream)
        .unwrap();
    assert_eq!(info.options.source_type, SourceType::Xcluster);
    assert_eq!(info.options.record_format, RecordFormat("json".into()));
    assert_eq!(info.options.checkpoint_type, CheckpointType::Explicit);
    assert_eq!(info.state, StreamState::Active);
}

#[test]
fn config_file_resolves_checkpoint_log_next_to_itself() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("retention.json");
    fs::write(
        &config_path,
        r#"{
            "maintenance": { "max_concurrent_ops": 2, "reserved_log_gc_slots": 1 },
            "cdc": { "checkpoint_log_path": "state/checkpoints.jsonl" }
        }"#,
    )
    .unwrap();
    let config = RetentionConfig::load(&config_path).unwrap();
    let log_path = dir.path().join("state/checkpoints.jsonl");
    assert_eq!(config.cdc.checkpoint_log_path.as_deref(), Some(log_path.as_path()));
    assert_eq!(config.maintenance.max_concurrent_ops, 2);

    let h = Harness::with_config(config);
    h.leader_tablet("t1", "orders", 3);
    h.context.cdc().create_stream(namespace_stream()).unwrap();
    let contents = fs::read_to_string(&log_path).unwrap();
    assert_eq!(contents.lines().count(), 1);
}
