#![cfg(feature = "test-utils")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use pg_stream::cdc_error;
use pg_stream::concurrency::shutdown::create_shutdown_channel;
use pg_stream::connector::ConnectorState;
use pg_stream::conversions::encoder::{EventEncoder, JsonEventEncoder};
use pg_stream::error::{CdcResult, ErrorKind};
use pg_stream::input::{PgStreamInput, ReadResult};
use pg_stream::store::checkpoint::CheckpointStore;
use pg_stream::store::kv::MemoryKeyValueStore;
use pg_stream::test_utils::event::{insert_event, lsn, slot, update_event};
use pg_stream::test_utils::kv::RecordingKeyValueStore;
use pg_stream::test_utils::source::ScriptedReplicationSource;
use pg_stream::types::{ChangeEvent, EventSource};
use pg_stream_telemetry::tracing::init_test_tracing;

fn decode(payload: &[u8]) -> ChangeEvent {
    serde_json::from_slice(payload).expect("payload is not a change event")
}

/// Fails the first event it is given and encodes every later one as JSON.
#[derive(Debug, Default)]
struct FailFirstEncoder {
    failed: AtomicBool,
}

impl EventEncoder for FailFirstEncoder {
    fn encode(&self, event: &ChangeEvent) -> CdcResult<Bytes> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(cdc_error!(
                ErrorKind::SerializationError,
                "Change event could not be encoded",
                event.qualified_table()
            ));
        }

        JsonEventEncoder.encode(event)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_then_change_are_read_in_order_and_change_ack_checkpoints() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new()
        .with_snapshot(vec![insert_event("orders", 1), insert_event("orders", 2)])
        .with_changes(vec![update_event("orders", 1, Some(lsn("16/B374D848")))]);
    let checkpoints = CheckpointStore::new(MemoryKeyValueStore::new());
    let mut input = PgStreamInput::new(source, slot("orders_slot"), checkpoints.clone());
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();
    assert_eq!(input.state(), ConnectorState::Streaming);

    let mut read = Vec::new();
    for _ in 0..3 {
        match input.read(&mut cancel_rx).await.unwrap() {
            ReadResult::Message(message, ack) => read.push((message, ack)),
            ReadResult::EndOfStream => panic!("stream ended early"),
        }
    }

    let sources: Vec<_> = read.iter().map(|(message, _)| message.source()).collect();
    assert_eq!(
        sources,
        vec![EventSource::Snapshot, EventSource::Snapshot, EventSource::Changes]
    );
    let events: Vec<_> = read
        .iter()
        .map(|(message, _)| decode(message.payload()))
        .collect();
    assert_eq!(events[0], insert_event("orders", 1));
    assert_eq!(events[1], insert_event("orders", 2));
    assert_eq!(events[2], update_event("orders", 1, Some(lsn("16/B374D848"))));

    for (_, ack) in read {
        ack.ack(Ok::<(), String>(())).await.unwrap();
    }

    assert_eq!(
        checkpoints.get_checkpoint("orders_slot").await.unwrap(),
        Some("16/B374D848".to_owned())
    );

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_acks_never_write_checkpoints() {
    init_test_tracing();

    let rows: Vec<_> = (0..10).map(|id| insert_event("orders", id)).collect();
    let source = ScriptedReplicationSource::new().with_snapshot(rows);
    let kv = RecordingKeyValueStore::new();
    let mut input = PgStreamInput::new(source, slot("orders_slot"), CheckpointStore::new(kv.clone()));
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    for _ in 0..10 {
        let ReadResult::Message(message, ack) = input.read(&mut cancel_rx).await.unwrap() else {
            panic!("expected a snapshot row");
        };
        assert_eq!(message.source(), EventSource::Snapshot);
        ack.ack(Ok::<(), String>(())).await.unwrap();
    }

    assert_eq!(kv.write_count(), 0);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn change_ack_writes_once_with_position_and_never_without() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new().with_changes(vec![
        update_event("orders", 1, None),
        update_event("orders", 2, Some(lsn("0/16B3748"))),
    ]);
    let kv = RecordingKeyValueStore::new();
    let mut input = PgStreamInput::new(source, slot("orders_slot"), CheckpointStore::new(kv.clone()));
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    let ReadResult::Message(without_position, ack) = input.read(&mut cancel_rx).await.unwrap()
    else {
        panic!("expected a change");
    };
    assert_eq!(without_position.lsn(), None);
    ack.ack(Ok::<(), String>(())).await.unwrap();
    assert_eq!(kv.write_count(), 0);

    let ReadResult::Message(with_position, ack) = input.read(&mut cancel_rx).await.unwrap() else {
        panic!("expected a change");
    };
    assert_eq!(with_position.lsn(), Some(lsn("0/16B3748")));
    ack.ack(Ok::<(), String>(())).await.unwrap();

    assert_eq!(
        kv.writes(),
        vec![(
            "rs_checkpoint_orders_slot".to_owned(),
            "0/16B3748".to_owned()
        )]
    );

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn encoding_failure_fails_only_that_read() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new().with_changes(vec![
        update_event("orders", 1, None),
        update_event("orders", 2, Some(lsn("0/16B3780"))),
    ]);
    let kv = RecordingKeyValueStore::new();
    let mut input = PgStreamInput::new(source, slot("orders_slot"), CheckpointStore::new(kv.clone()))
        .with_encoder(FailFirstEncoder::default());
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    let Err(err) = input.read(&mut cancel_rx).await else {
        panic!("expected the first read to fail");
    };
    assert_eq!(err.kind(), ErrorKind::SerializationError);
    assert_eq!(input.state(), ConnectorState::Streaming);
    assert_eq!(kv.write_count(), 0);

    let ReadResult::Message(message, ack) = input.read(&mut cancel_rx).await.unwrap() else {
        panic!("expected the next change");
    };
    assert_eq!(
        decode(message.payload()),
        update_event("orders", 2, Some(lsn("0/16B3780")))
    );
    ack.ack(Ok::<(), String>(())).await.unwrap();

    assert_eq!(
        kv.writes(),
        vec![(
            "rs_checkpoint_orders_slot".to_owned(),
            "0/16B3780".to_owned()
        )]
    );

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_processing_does_not_checkpoint() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new()
        .with_changes(vec![update_event("orders", 1, Some(lsn("0/200")))]);
    let kv = RecordingKeyValueStore::new();
    let mut input = PgStreamInput::new(source, slot("orders_slot"), CheckpointStore::new(kv.clone()));
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    let ReadResult::Message(_, ack) = input.read(&mut cancel_rx).await.unwrap() else {
        panic!("expected a change");
    };
    ack.ack(Err("sink rejected the event")).await.unwrap();

    assert_eq!(kv.write_count(), 0);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_write_failure_is_returned_from_ack() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new()
        .with_changes(vec![update_event("orders", 1, Some(lsn("0/200")))]);
    let kv = RecordingKeyValueStore::new();
    let mut input = PgStreamInput::new(source, slot("orders_slot"), CheckpointStore::new(kv.clone()));
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();
    kv.fail_writes(true);

    let ReadResult::Message(_, ack) = input.read(&mut cancel_rx).await.unwrap() else {
        panic!("expected a change");
    };
    let err = ack.ack(Ok::<(), String>(())).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CheckpointWriteFailed);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_ends_stream_and_stops_once() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new();
    let mut input = PgStreamInput::new(
        source.clone(),
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );
    let (cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.shutdown().unwrap();
        cancel_tx
    });

    assert!(matches!(
        input.read(&mut cancel_rx).await.unwrap(),
        ReadResult::EndOfStream
    ));
    assert_eq!(input.state(), ConnectorState::Draining);
    assert_eq!(source.stops(), 1);

    assert!(matches!(
        input.read(&mut cancel_rx).await.unwrap(),
        ReadResult::EndOfStream
    ));
    input.close().await.unwrap();
    input.close().await.unwrap();

    assert_eq!(source.stops(), 1);
    assert_eq!(input.state(), ConnectorState::Closed);

    canceller.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_failure_during_cancellation_is_reported_by_close() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new().failing_on_stop(ErrorKind::SourceIoError);
    let kv = RecordingKeyValueStore::new();
    kv.fail_close(true);
    let mut input = PgStreamInput::new(source, slot("orders_slot"), CheckpointStore::new(kv.clone()));
    let (cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();
    cancel_tx.shutdown().unwrap();

    assert!(matches!(
        input.read(&mut cancel_rx).await.unwrap(),
        ReadResult::EndOfStream
    ));

    let err = input.close().await.unwrap_err();

    assert_eq!(
        err.kinds(),
        vec![ErrorKind::SourceIoError, ErrorKind::CheckpointStoreCloseFailed]
    );
    assert_eq!(input.state(), ConnectorState::Closed);
    assert!(input.close().await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn session_ending_by_itself_drains_then_ends() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new()
        .with_changes(vec![update_event("orders", 1, Some(lsn("0/10")))])
        .ending_after_changes();
    let mut input = PgStreamInput::new(
        source,
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    assert!(matches!(
        input.read(&mut cancel_rx).await.unwrap(),
        ReadResult::Message(_, _)
    ));
    assert!(matches!(
        input.read(&mut cancel_rx).await.unwrap(),
        ReadResult::EndOfStream
    ));
    assert_eq!(input.state(), ConnectorState::Draining);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn session_failure_is_returned_from_read() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new()
        .failing_after_changes(ErrorKind::SourceConnectionFailed);
    let mut input = PgStreamInput::new(
        source,
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    let err = input.read(&mut cancel_rx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);

    assert!(matches!(
        input.read(&mut cancel_rx).await.unwrap(),
        ReadResult::EndOfStream
    ));
    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn read_outside_streaming_fails_cleanly() {
    init_test_tracing();

    let mut input = PgStreamInput::new(
        ScriptedReplicationSource::new(),
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    let err = input.read(&mut cancel_rx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    input.close().await.unwrap();

    let err = input.read(&mut cancel_rx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectorClosed);

    let err = input.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectorClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_connect_is_rejected_while_streaming() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new();
    let mut input = PgStreamInput::new(
        source.clone(),
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );

    input.connect().await.unwrap();
    let err = input.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConnectorAlreadyStreaming);
    assert_eq!(source.connects(), 1);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_leaves_input_idle() {
    init_test_tracing();

    let source =
        ScriptedReplicationSource::new().failing_with(ErrorKind::SourceConnectionFailed);
    let mut input = PgStreamInput::new(
        source,
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );

    let err = input.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
    assert_eq!(input.state(), ConnectorState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_resumes_from_stored_checkpoint() {
    init_test_tracing();

    let checkpoints = CheckpointStore::new(MemoryKeyValueStore::new());
    checkpoints
        .set_checkpoint("orders_slot", "16/B374D848")
        .await
        .unwrap();
    let source = ScriptedReplicationSource::new();
    let mut input = PgStreamInput::new(source.clone(), slot("orders_slot"), checkpoints);

    input.connect().await.unwrap();

    assert_eq!(source.start_lsns(), vec![Some(lsn("16/B374D848"))]);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_checkpoint_fails_connect_and_caller_may_choose_start() {
    init_test_tracing();

    let kv = RecordingKeyValueStore::new();
    kv.fail_reads(true);
    let source = ScriptedReplicationSource::new();
    let mut input = PgStreamInput::new(source.clone(), slot("orders_slot"), CheckpointStore::new(kv));

    let err = input.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckpointReadFailed);
    assert_eq!(input.state(), ConnectorState::Idle);
    assert_eq!(source.connects(), 0);

    input.connect_from(None).await.unwrap();
    assert_eq!(source.start_lsns(), vec![None]);

    input.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_positions_are_reported_to_the_session() {
    init_test_tracing();

    let source = ScriptedReplicationSource::new()
        .with_changes(vec![update_event("orders", 1, Some(lsn("0/400")))]);
    let mut input = PgStreamInput::new(
        source.clone(),
        slot("orders_slot"),
        CheckpointStore::new(MemoryKeyValueStore::new()),
    );
    let (_cancel_tx, mut cancel_rx) = create_shutdown_channel();

    input.connect().await.unwrap();

    let ReadResult::Message(_, ack) = input.read(&mut cancel_rx).await.unwrap() else {
        panic!("expected a change");
    };
    ack.ack(Ok::<(), String>(())).await.unwrap();

    let mut confirmed = Vec::new();
    for _ in 0..50 {
        confirmed = source.confirmed_lsns();
        if !confirmed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(confirmed, vec![lsn("0/400")]);

    input.close().await.unwrap();
}
