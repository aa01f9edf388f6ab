//! Process bridge against `/bin/sh` scripts.
#![cfg(unix)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use collector_link_core::{HandlerError, LinkError};
use collector_link_process::{
    Backpressure, BridgeConfig, BridgeConfigBuilder, ProcessBridge, ProcessState, RecordConsumer,
    StreamItem, StreamRecord,
};
use serde_json::json;
use tokio::{sync::mpsc, time::timeout};

const WAIT: Duration = Duration::from_secs(10);

fn bridge(configure: impl FnOnce(BridgeConfigBuilder) -> BridgeConfigBuilder) -> ProcessBridge {
    let builder = BridgeConfig::builder("/bin/sh").base_args(["-c"]);
    ProcessBridge::new(configure(builder).build().unwrap())
}

async fn next(rx: &mut mpsc::Receiver<StreamItem>) -> Option<StreamItem> {
    timeout(WAIT, rx.recv()).await.expect("timed out waiting for record")
}

async fn collect(mut rx: mpsc::Receiver<StreamItem>) -> Vec<StreamItem> {
    let mut items = Vec::new();
    while let Some(item) = next(&mut rx).await {
        items.push(item);
    }
    items
}

#[tokio::test]
async fn test_records_arrive_in_order() {
    let bridge = bridge(|b| b);
    let session = bridge
        .spawn([r#"printf '{"n":1}\n{"n":2}\r\n\n'; printf '{"n":3}'"#])
        .await
        .unwrap();
    assert_eq!(session.state(), ProcessState::Running);

    let items = collect(session.take_records().unwrap()).await;
    let records: Vec<StreamRecord> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        records,
        vec![
            StreamRecord { seq: 0, value: json!({"n": 1}) },
            StreamRecord { seq: 1, value: json!({"n": 2}) },
            StreamRecord { seq: 2, value: json!({"n": 3}) },
        ]
    );

    let exit = timeout(WAIT, session.wait()).await.unwrap().unwrap();
    assert_eq!(exit.exit_code, 0);
    assert_eq!(session.state(), ProcessState::Terminated(0));
}

#[tokio::test]
async fn test_malformed_line_reported_and_decoding_continues() {
    let bridge = bridge(|b| b);
    let session = bridge
        .spawn([r#"echo 'this is not json'; echo '{"ok":true}'"#])
        .await
        .unwrap();

    let items = collect(session.take_records().unwrap()).await;
    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], Err(LinkError::Process { .. })));
    assert_eq!(
        items[1].as_ref().unwrap(),
        &StreamRecord { seq: 0, value: json!({"ok": true}) }
    );
    assert!(session.wait().await.is_ok());
}

#[tokio::test]
async fn test_nonzero_exit_carries_stderr() {
    let bridge = bridge(|b| b);
    let session = bridge
        .spawn(["echo 'artifact not found' >&2; exit 3"])
        .await
        .unwrap();

    let err = timeout(WAIT, session.wait()).await.unwrap().unwrap_err();
    match err {
        LinkError::Process {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, Some(3));
            assert!(stderr.contains("artifact not found"), "{stderr:?}");
        }
        other => panic!("expected process error, got {other:?}"),
    }
    assert_eq!(session.state(), ProcessState::Terminated(3));
}

#[tokio::test]
async fn test_cancel_terminates_gracefully() {
    let bridge = bridge(|b| b.grace_period(Duration::from_secs(5)));
    let session = bridge
        .spawn([r#"echo '{"ready":true}'; sleep 30"#])
        .await
        .unwrap();
    let mut records = session.take_records().unwrap();
    assert!(next(&mut records).await.unwrap().is_ok());

    bridge.cancel(&session);

    let err = timeout(WAIT, session.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, LinkError::Cancelled), "{err:?}");
    assert_eq!(session.state(), ProcessState::Terminated(143));
}

#[tokio::test]
async fn test_kill_during_grace_window() {
    let bridge = bridge(|b| b.grace_period(Duration::from_secs(30)));
    let session = bridge
        .spawn([r#"trap '' TERM; echo 'ignoring TERM' >&2; echo '{"ready":true}'; sleep 30"#])
        .await
        .unwrap();
    let mut records = session.take_records().unwrap();
    assert!(next(&mut records).await.unwrap().is_ok());

    bridge.cancel(&session);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.state(), ProcessState::Running);

    bridge.kill(&session);

    let err = timeout(WAIT, session.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, LinkError::Cancelled), "{err:?}");
    assert_eq!(session.state(), ProcessState::Killed);
    assert!(session.stderr().contains("ignoring TERM"));
}

#[tokio::test]
async fn test_timeout_stops_collector() {
    let bridge = bridge(|b| {
        b.timeout(Duration::from_millis(200))
            .grace_period(Duration::from_secs(5))
    });
    let session = bridge.spawn(["sleep 30"]).await.unwrap();

    let err = timeout(WAIT, session.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, LinkError::Timeout(_)), "{err:?}");
    assert_eq!(session.state(), ProcessState::Terminated(143));
}

#[tokio::test]
async fn test_drop_mode_counts_discarded_records() {
    let bridge = bridge(|b| b.backpressure(Backpressure::Drop { capacity: 1 }));
    let session = bridge
        .spawn([r#"i=0; while [ $i -lt 50 ]; do echo "{\"i\":$i}"; i=$((i+1)); done"#])
        .await
        .unwrap();

    timeout(WAIT, session.wait()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let items = collect(session.take_records().unwrap()).await;
    let received = u64::try_from(items.len()).unwrap();
    assert!(session.dropped_records() > 0);
    assert_eq!(received + session.dropped_records(), 50);

    let seqs: Vec<u64> = items.into_iter().map(|item| item.unwrap().seq).collect();
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
}

struct Collecting(Mutex<Vec<StreamRecord>>);

#[async_trait]
impl RecordConsumer for Collecting {
    async fn on_record(&self, record: StreamRecord) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(record);
        Ok(())
    }
}

#[tokio::test]
async fn test_block_mode_delivers_everything_to_consumer() {
    let bridge = bridge(|b| b.backpressure(Backpressure::Block { capacity: 2 }));
    let session = bridge
        .spawn([r#"i=0; while [ $i -lt 200 ]; do echo "{\"i\":$i}"; i=$((i+1)); done"#])
        .await
        .unwrap();

    let consumer = Arc::new(Collecting(Mutex::new(Vec::new())));
    let task = bridge
        .attach_consumer(&session, Arc::clone(&consumer) as Arc<dyn RecordConsumer>)
        .unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
    timeout(WAIT, session.wait()).await.unwrap().unwrap();

    let records = consumer.0.lock().unwrap();
    assert_eq!(records.len(), 200);
    for (expected, record) in records.iter().enumerate() {
        assert_eq!(record.seq, expected as u64);
        assert_eq!(record.value, json!({"i": expected}));
    }
    assert_eq!(session.dropped_records(), 0);
}

#[tokio::test]
async fn test_records_can_only_be_taken_once() {
    let bridge = bridge(|b| b);
    let session = bridge.spawn(["true"]).await.unwrap();

    assert!(session.take_records().is_some());
    assert!(session.take_records().is_none());
    assert!(matches!(
        bridge.attach_consumer(&session, Arc::new(Collecting(Mutex::new(Vec::new())))),
        Err(LinkError::Configuration(_))
    ));
    timeout(WAIT, session.wait()).await.unwrap().unwrap();
}
