//! Unit tests for optimistic-concurrency updates of the machine record.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_steward::models::machine::{
    DaemonState, DaemonStatus, MachineMetadata, ShutdownSource, Versioned,
};
use agent_steward::sync::channel::SyncTransport;
use agent_steward::sync::client::{MachineSnapshot, MachineSyncClient, RetryPolicy};
use agent_steward::sync::crypto::{decrypt_json, encrypt_json, AesGcmCipher, Cipher};
use agent_steward::sync::protocol::{EVENT_UPDATE_METADATA, EVENT_UPDATE_STATE};
use agent_steward::{AppError, BoxFuture, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Transport that replays scripted acks and records every payload sent.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Value>>>,
    sent: Mutex<Vec<(String, Value)>>,
    state_gate: Option<Arc<Notify>>,
    closed: Mutex<bool>,
}

impl ScriptedTransport {
    fn with_replies(replies: Vec<Result<Value>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().expect("lock").clone()
    }

    fn sent_for(&self, event: &str) -> usize {
        self.sent().iter().filter(|(e, _)| e == event).count()
    }
}

impl SyncTransport for ScriptedTransport {
    fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.sent.lock().expect("lock").push((event.to_owned(), data));
        Ok(())
    }

    fn emit_with_ack<'a>(
        &'a self,
        event: &'a str,
        data: Value,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Value>> {
        self.sent.lock().expect("lock").push((event.to_owned(), data));
        Box::pin(async move {
            if event == EVENT_UPDATE_STATE {
                if let Some(gate) = &self.state_gate {
                    gate.notified().await;
                }
            }
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(AppError::Sync("no scripted reply".into())))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            *self.closed.lock().expect("lock") = true;
        })
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        budget: Duration::from_secs(2),
        ack_timeout: Duration::from_millis(100),
    }
}

fn running() -> DaemonState {
    DaemonState::running(100, 4000, Utc::now())
}

fn metadata(host: &str) -> MachineMetadata {
    MachineMetadata {
        host: host.into(),
        platform: "linux".into(),
        cli_version: "0.3.0".into(),
        home_dir: "/home/u".into(),
        steward_home_dir: "/home/u/.agent-steward".into(),
    }
}

const SECRET: [u8; 32] = [5; 32];

fn cipher() -> Arc<dyn Cipher> {
    Arc::new(AesGcmCipher::new(&SECRET))
}

fn sealed<T: serde::Serialize>(value: &T) -> Value {
    Value::String(encrypt_json(cipher().as_ref(), value).expect("seal"))
}

fn client(transport: Arc<ScriptedTransport>, snapshot: MachineSnapshot) -> MachineSyncClient {
    MachineSyncClient::new("m-1".into(), transport, cipher(), snapshot, fast_policy())
}

#[tokio::test]
async fn success_adopts_new_version() {
    let transport = Arc::new(ScriptedTransport::with_replies(vec![Ok(
        json!({"result": "success", "version": 4}),
    )]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    let state = running();
    let stored = client
        .update_daemon_state(|_| state.clone())
        .await
        .expect("accepted");

    assert_eq!(stored, state);
    assert_eq!(client.daemon_state().await, Versioned::new(Some(state), 4));

    let sent = transport.sent();
    assert_eq!(sent[0].0, EVENT_UPDATE_STATE);
    assert_eq!(sent[0].1["machineId"], "m-1");
    assert_eq!(sent[0].1["expectedVersion"], 0);
    assert!(sent[0].1["daemonState"].is_string());
}

#[tokio::test]
async fn field_value_is_sent_encrypted() {
    let transport = Arc::new(ScriptedTransport::with_replies(vec![Ok(
        json!({"result": "success", "version": 1}),
    )]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    let state = DaemonState::running(42, 9, Utc::now());
    client
        .update_daemon_state(|_| state.clone())
        .await
        .expect("accepted");

    let sent = transport.sent();
    let blob = sent[0].1["daemonState"].as_str().expect("sealed string");
    assert!(!blob.contains("running"));
    let opened: DaemonState = decrypt_json(cipher().as_ref(), blob).expect("opens with the key");
    assert_eq!(opened, state);

    let other_key = AesGcmCipher::new(&[6; 32]);
    assert!(decrypt_json::<DaemonState>(&other_key, blob).is_err());
}

#[tokio::test]
async fn unreadable_remote_value_is_treated_as_absent() {
    let transport = Arc::new(ScriptedTransport::with_replies(vec![
        Ok(json!({
            "result": "version-mismatch",
            "version": 3,
            "daemonState": {"status": "running"},
        })),
        Ok(json!({"result": "success", "version": 4})),
    ]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    client
        .update_daemon_state(move |current| {
            record.lock().expect("lock").push(current.is_some());
            running()
        })
        .await
        .expect("accepted on retry");

    assert_eq!(*seen.lock().expect("lock"), vec![false, false]);
    assert_eq!(transport.sent()[1].1["expectedVersion"], 3);
}

#[tokio::test]
async fn mismatch_reapplies_mutator_to_remote_value() {
    let remote = running();
    let transport = Arc::new(ScriptedTransport::with_replies(vec![
        Ok(json!({
            "result": "version-mismatch",
            "version": 7,
            "daemonState": sealed(&remote),
        })),
        Ok(json!({"result": "success", "version": 8})),
    ]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    let now = Utc::now();
    let stored = client
        .update_daemon_state(|current| {
            current
                .cloned()
                .unwrap_or_else(running)
                .shutting_down(ShutdownSource::Local, now)
        })
        .await
        .expect("accepted on retry");

    assert_eq!(stored.status, DaemonStatus::ShuttingDown);
    assert_eq!(stored.pid, remote.pid);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1["expectedVersion"], 7);
    assert_eq!(client.daemon_state().await.version, 8);
}

#[tokio::test]
async fn server_value_in_success_ack_wins() {
    let transport = Arc::new(ScriptedTransport::with_replies(vec![Ok(json!({
        "result": "success",
        "version": 2,
        "metadata": sealed(&metadata("server-host")),
    }))]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    let stored = client
        .update_metadata(|_| metadata("local-host"))
        .await
        .expect("accepted");
    assert_eq!(stored.host, "server-host");
}

#[tokio::test]
async fn error_ack_abandons_update() {
    let transport = Arc::new(ScriptedTransport::with_replies(vec![Ok(
        json!({"result": "error", "message": "machine revoked"}),
    )]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    let err = client
        .update_daemon_state(|_| running())
        .await
        .expect_err("rejected");
    assert!(matches!(err, AppError::Sync(ref msg) if msg.contains("machine revoked")));
    assert_eq!(transport.sent().len(), 1, "errors are not retried");
    assert_eq!(client.daemon_state().await.version, 0);
}

#[tokio::test]
async fn missing_ack_is_retried() {
    let transport = Arc::new(ScriptedTransport::with_replies(vec![
        Err(AppError::Timeout("no ack".into())),
        Ok(json!({"result": "bogus"})),
        Ok(json!({"result": "success", "version": 1})),
    ]));
    let client = client(Arc::clone(&transport), MachineSnapshot::default());

    client
        .update_daemon_state(|_| running())
        .await
        .expect("eventually accepted");
    assert_eq!(transport.sent().len(), 3);
}

#[tokio::test]
async fn exhausted_budget_is_timeout() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = MachineSyncClient::new(
        "m-1".into(),
        Arc::clone(&transport) as Arc<dyn SyncTransport>,
        cipher(),
        MachineSnapshot::default(),
        RetryPolicy {
            budget: Duration::from_millis(30),
            ..fast_policy()
        },
    );

    let err = client
        .update_daemon_state(|_| running())
        .await
        .expect_err("no replies at all");
    assert!(matches!(err, AppError::Timeout(_)));
}

#[tokio::test]
async fn different_fields_interleave_same_field_serializes() {
    let gate = Arc::new(Notify::new());
    let transport = Arc::new(ScriptedTransport {
        replies: Mutex::new(
            vec![
                Ok(json!({"result": "success", "version": 1})),
                Ok(json!({"result": "success", "version": 1})),
                Ok(json!({"result": "success", "version": 2})),
            ]
            .into(),
        ),
        state_gate: Some(Arc::clone(&gate)),
        ..ScriptedTransport::default()
    });
    let client = Arc::new(client(Arc::clone(&transport), MachineSnapshot::default()));

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.update_daemon_state(|_| running()).await })
    };
    while transport.sent_for(EVENT_UPDATE_STATE) == 0 {
        tokio::task::yield_now().await;
    }

    let second = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.update_daemon_state(|_| running()).await })
    };

    client
        .update_metadata(|_| metadata("host"))
        .await
        .expect("metadata is not blocked by the state update");
    assert_eq!(
        transport.sent_for(EVENT_UPDATE_STATE),
        1,
        "second state update waits for the first"
    );
    assert_eq!(transport.sent_for(EVENT_UPDATE_METADATA), 1);

    gate.notify_one();
    first.await.expect("join").expect("first accepted");
    while transport.sent_for(EVENT_UPDATE_STATE) < 2 {
        tokio::task::yield_now().await;
    }
    gate.notify_one();
    second.await.expect("join").expect("second accepted");

    let sent = transport.sent();
    let state_versions: Vec<&Value> = sent
        .iter()
        .filter(|(e, _)| e == EVENT_UPDATE_STATE)
        .map(|(_, d)| &d["expectedVersion"])
        .collect();
    assert_eq!(state_versions, vec![&json!(0), &json!(1)]);
}

#[tokio::test]
async fn shutdown_closes_transport() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = client(Arc::clone(&transport), MachineSnapshot::default());
    client.shutdown().await;
    assert!(*transport.closed.lock().expect("lock"));
    assert_eq!(client.machine_id(), "m-1");
}
