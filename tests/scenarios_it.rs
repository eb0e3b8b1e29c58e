mod common;

use common::{config_with_checkpoint_log, Harness};
use tablet_retention::{
    AnchorError, CdcError, CheckpointType, OpId, PeerRole, RecordKind, StreamOptions,
    TabletScope, TabletState, TruncationDecision,
};
use tempfile::tempdir;

fn namespace() -> TabletScope {
    TabletScope::Namespace("shop".into())
}

#[tokio::test]
async fn explicit_ack_moves_floor_and_clamps_log_gc() {
    let h = Harness::new();
    let tablet = h.leader_tablet("t1", "orders", 100);
    let cdc = h.context.cdc();
    let anchors = h.context.anchors();

    let stream = cdc.create_stream(StreamOptions::new(namespace())).unwrap();
    assert_eq!(anchors.effective_floor(&tablet), Some(100));

    h.consensus.append_many(&tablet, 1, 50);
    let response = cdc.poll(&stream, &tablet).await.unwrap();
    assert_eq!(response.records.len(), 50);
    assert!(response
        .records
        .iter()
        .all(|record| record.kind == RecordKind::Change));
    assert_eq!(response.records[0].op_id.index, 101);
    assert_eq!(response.checkpoint, OpId::new(1, 150));
    // Explicit streams do not move until acknowledged.
    assert_eq!(anchors.effective_floor(&tablet), Some(100));

    let checkpoint = cdc.acknowledge(&stream, &tablet, OpId::new(1, 150)).unwrap();
    assert_eq!(checkpoint.op_id.index, 150);
    assert_eq!(cdc.get_checkpoint(&stream, &tablet).unwrap().op_id.index, 150);
    assert_eq!(anchors.effective_floor(&tablet), Some(150));

    match anchors.reserve_truncation(&tablet, 160).unwrap() {
        TruncationDecision::Admitted { target, floor, .. } => {
            assert_eq!(target, 150);
            assert_eq!(floor, Some(150));
        }
        other => panic!("expected admission, got {other:?}"),
    }
    assert_eq!(anchors.last_truncation(&tablet), 150);
}

#[tokio::test]
async fn implicit_stream_advances_on_poll() {
    let h = Harness::new();
    let tablet = h.leader_tablet("t1", "orders", 0);
    let cdc = h.context.cdc();
    let stream = cdc
        .create_stream(
            StreamOptions::new(namespace()).with_checkpoint_type(CheckpointType::Implicit),
        )
        .unwrap();
    assert_eq!(h.context.anchors().effective_floor(&tablet), Some(0));

    h.consensus.append_many(&tablet, 1, 50);
    let response = cdc.poll(&stream, &tablet).await.unwrap();
    assert_eq!(response.records.len(), 50);
    assert_eq!(cdc.get_checkpoint(&stream, &tablet).unwrap().op_id.index, 50);
    assert_eq!(h.context.anchors().effective_floor(&tablet), Some(50));

    // Nothing new: the checkpoint stays put.
    let empty = cdc.poll(&stream, &tablet).await.unwrap();
    assert!(empty.records.is_empty());
    assert_eq!(empty.checkpoint.index, 50);
}

#[test]
fn anchor_above_committed_index_is_rejected() {
    let h = Harness::new();
    let tablet = h.leader_tablet("t1", "orders", 150);
    let err = h
        .context
        .anchors()
        .register_anchor(&tablet, "reader", 200, "bootstrap")
        .unwrap_err();
    assert!(matches!(
        err,
        AnchorError::InvalidAnchor {
            min_index: 200,
            bound: 150,
            ..
        }
    ));
    assert_eq!(h.context.anchors().effective_floor(&tablet), None);
}

#[test]
fn deleting_the_lowest_stream_raises_the_floor() {
    let h = Harness::new();
    let tablet = h.leader_tablet("t1", "orders", 40);
    let cdc = h.context.cdc();
    let anchors = h.context.anchors();

    let s2 = cdc.create_stream(StreamOptions::new(namespace())).unwrap();
    h.consensus.append_many(&tablet, 1, 40);
    let s1 = cdc.create_stream(StreamOptions::new(namespace())).unwrap();
    assert_eq!(cdc.get_checkpoint(&s1, &tablet).unwrap().op_id.index, 80);
    assert_eq!(anchors.effective_floor(&tablet), Some(40));

    cdc.delete_stream(&s2).unwrap();
    // The anchor is held until the release is drained.
    assert_eq!(anchors.effective_floor(&tablet), Some(40));
    assert_eq!(cdc.drain_pending_releases(), 1);
    assert_eq!(anchors.effective_floor(&tablet), Some(80));
    assert_eq!(anchors.anchors(&tablet).len(), 1);
}

#[tokio::test]
async fn bootstrapping_tablet_rejects_poll_until_running() {
    let dir = tempdir().unwrap();
    let config = config_with_checkpoint_log(&dir.path().join("checkpoints.jsonl"));
    let h = Harness::with_config(config.clone());
    let tablet = h.leader_tablet("t1", "orders", 10);
    let stream = h
        .context
        .cdc()
        .create_stream(StreamOptions::new(namespace()))
        .unwrap();

    // Restart: the stream comes back from the checkpoint log, the tablet
    // has to bootstrap again.
    let h = h.restart(config);
    h.add_tablet("t1", "orders");
    h.move_to(&tablet, &[TabletState::Bootstrapping]);
    h.consensus.set_role(&tablet, PeerRole::Leader);
    let err = h.context.cdc().poll(&stream, &tablet).await.unwrap_err();
    assert!(matches!(
        err,
        CdcError::TabletNotReady {
            state: TabletState::Bootstrapping,
            ..
        }
    ));
    assert!(err.is_retryable());

    h.move_to(&tablet, &[TabletState::Running]);
    h.consensus.append_many(&tablet, 1, 5);
    let response = h.context.cdc().poll(&stream, &tablet).await.unwrap();
    assert_eq!(response.records.len(), 5);
    assert_eq!(response.records[0].op_id.index, 11);
}
