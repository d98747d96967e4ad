#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end test over a real socket.
//!
//!   1. Start the relay on a temp socket with an offline backend
//!   2. Connect a client and a bridge
//!   3. Forward a capture from the bridge and check the receipt
//!   4. List the registry and read service status
//!   5. Issue a command through the bridge and get its result back
//!   6. Check error codes for commands without surfaces and unknown methods

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pagetap_core::backend::{BackendClient, BackendError};
use pagetap_core::delegator::{RuleClassifier, TaskDelegator};
use pagetap_core::{EndpointRegistry, RelayDeps, RelayProcess, RelaySettings};
use pagetap_protocol::ingest::IngestRecord;
use pagetap_protocol::{BridgeMessage, Capture, CommandId, CommandResult, SourceChannel, SurfaceId};
use pagetap_relay::PROTOCOL_VERSION;
use pagetap_relay::ipc::{self, BridgeHub, RelayService};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

struct OfflineBackend;

#[async_trait]
impl BackendClient for OfflineBackend {
    async fn ingest(&self, _record: &IngestRecord) -> Result<(), BackendError> {
        Err(BackendError::Unreachable("offline".to_string()))
    }

    async fn health(&self) -> Result<(), BackendError> {
        Err(BackendError::Unreachable("offline".to_string()))
    }
}

/// Stateful client that keeps a single connection + buffered reader.
struct TestClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl TestClient {
    fn connect(socket_path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(socket_path).expect("Failed to connect to relay");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        let writer = stream.try_clone().expect("clone stream");
        let reader = BufReader::new(stream);
        Self { writer, reader }
    }

    fn send(&mut self, msg: Value) {
        let mut bytes = serde_json::to_vec(&msg).expect("serialize");
        bytes.push(b'\n');
        self.writer.write_all(&bytes).expect("write");
        self.writer.flush().expect("flush");
    }

    fn read(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read line");
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("parse line: {e}\nraw: {line}"))
    }

    fn rpc(&mut self, msg: Value) -> Value {
        self.send(msg);
        self.read()
    }

    fn handshake(&mut self, role: &str) -> String {
        let resp = self.rpc(json!({
            "id": 0,
            "method": "hello",
            "params": {
                "protocol_version": PROTOCOL_VERSION,
                "client_version": "test-0.1.0",
                "role": role
            }
        }));
        assert!(resp.get("result").is_some(), "Hello should succeed: {resp}");
        resp["result"]["instance_id"].as_str().unwrap().to_string()
    }
}

/// Start the relay in the background and return a handle.
async fn start_service(
    socket_path: &std::path::Path,
) -> (Arc<RelayService>, CancellationToken, tokio::task::JoinHandle<()>) {
    let hub = Arc::new(BridgeHub::new());
    let relay = Arc::new(RelayProcess::new(
        RelaySettings::default(),
        RelayDeps {
            backend: Arc::new(OfflineBackend),
            transport: hub.clone(),
            delegator: Arc::new(TaskDelegator::rules_only(RuleClassifier::default())),
            registry: EndpointRegistry::in_memory(),
        },
    ));
    let service = Arc::new(RelayService::new(relay, hub));
    let cancel = CancellationToken::new();

    let listener = ipc::bind(socket_path).unwrap();
    let svc = Arc::clone(&service);
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        ipc::serve(svc, listener, token).await.unwrap();
    });

    // Wait for socket to be ready
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    (service, cancel, handle)
}

fn envelope_request(id: u64, message: BridgeMessage) -> Value {
    json!({
        "id": id,
        "method": "bridge.envelope",
        "params": {"envelope": message.seal()}
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walking_skeleton_e2e() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("test-relay.sock");

    let (service, cancel, server_handle) = start_service(&socket_path).await;

    // The synchronous clients block, so drive them off the runtime threads.
    let path = socket_path.clone();
    let expected_instance = service.relay().instance_id().to_string();
    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&path);
        let mut bridge = TestClient::connect(&path);

        // 1. Handshakes report the same relay instance
        assert_eq!(client.handshake("client"), expected_instance);
        assert_eq!(bridge.handshake("bridge"), expected_instance);

        // 2. A command before any surface is reported has nowhere to go
        let resp = client.rpc(json!({
            "id": 1,
            "method": "command.issue",
            "params": {"action": "ping"}
        }));
        assert_eq!(resp["error"]["code"].as_i64().unwrap(), 30, "{resp}");

        // 3. Bridge forwards a capture and gets a receipt
        let capture = Capture::new(
            SourceChannel::PrimaryHook,
            "GET",
            "https://ehr.example/api/chart/4411/medications",
            200,
            json!({"medications": [{"name": "lisinopril"}]}),
        );
        let resp = bridge.rpc(envelope_request(1, BridgeMessage::Capture(capture)));
        let receipt = &resp["result"];
        assert_eq!(
            receipt["endpoint"].as_str().unwrap(),
            "ehr.example/api/chart/{id}/medications",
            "{resp}"
        );
        assert!(receipt["discovered"].as_bool().unwrap());
        assert_eq!(receipt["delivery"].as_str().unwrap(), "queued");

        // 4. Registry shows the discovered endpoint
        let resp = client.rpc(json!({"id": 2, "method": "registry.list"}));
        let endpoints = resp["result"]["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 1, "{resp}");
        assert_eq!(
            endpoints[0]["normalized_key"].as_str().unwrap(),
            "ehr.example/api/chart/{id}/medications"
        );

        // 5. Bridge reports a surface, then a command round-trips through it
        let resp = bridge.rpc(envelope_request(
            2,
            BridgeMessage::Surfaces(vec![SurfaceId::new("tab-1")]),
        ));
        assert_eq!(resp["result"]["surfaces"].as_u64().unwrap(), 1, "{resp}");

        client.send(json!({
            "id": 3,
            "method": "command.issue",
            "params": {"action": "fetch_json", "url": "/api/chart/4411/labs"}
        }));
        let push = bridge.read();
        assert_eq!(push["method"].as_str().unwrap(), "bridge.command", "{push}");
        let envelope = &push["params"]["envelope"];
        assert_eq!(envelope["kind"].as_str().unwrap(), "command");
        assert_eq!(envelope["payload"]["surface"].as_str().unwrap(), "tab-1");
        let command_id = envelope["payload"]["command_id"].as_str().unwrap();

        let reply = CommandResult::ok(CommandId::from(command_id), json!({"labs": []}));
        bridge.send(json!({
            "method": "bridge.envelope",
            "params": {"envelope": BridgeMessage::CommandResult(reply).seal()}
        }));
        let resp = client.read();
        assert_eq!(resp["id"].as_u64().unwrap(), 3, "{resp}");
        assert!(resp["result"]["success"].as_bool().unwrap());
        assert_eq!(resp["result"]["data"], json!({"labs": []}));

        // 6. Service status reflects all of the above
        let resp = client.rpc(json!({"id": 4, "method": "service.status"}));
        let status = &resp["result"];
        assert_eq!(status["bridges"].as_u64().unwrap(), 1, "{resp}");
        assert_eq!(status["endpoints"].as_u64().unwrap(), 1);
        assert_eq!(status["queue_depth"].as_u64().unwrap(), 1);
        assert_eq!(status["counters"]["captures_received"].as_u64().unwrap(), 1);
        assert_eq!(status["counters"]["commands_resolved"].as_u64().unwrap(), 1);

        // 7. Unknown method
        let resp = client.rpc(json!({"id": 5, "method": "no.such.method"}));
        assert_eq!(resp["error"]["code"].as_i64().unwrap(), -32601);
    })
    .await
    .unwrap();

    cancel.cancel();
    server_handle.abort();
}
