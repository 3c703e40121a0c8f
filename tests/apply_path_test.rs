use async_trait::async_trait;
use fenceline::agent::{ApplyAgent, Watermark};
use fenceline::api::{payload_checksum, LedgerClient, Segment, WriteOp};
use fenceline::config::{AgentConfig, LedgerConfig};
use fenceline::ledger::LedgerService;
use fenceline::sql::{SqlEndpoint, SqlError, SqlExecutor};
use fenceline::store::DurableStore;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct RecordingExecutor {
    statements: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn statements(&self) -> Vec<String> {
        self.statements.lock().expect("lock statements").clone()
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn execute(&self, _endpoint: &SqlEndpoint, statement: &str) -> Result<(), SqlError> {
        self.statements
            .lock()
            .expect("lock statements")
            .push(statement.to_string());
        Ok(())
    }
}

struct LedgerHandle {
    addr: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LedgerHandle {
    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn client(&self) -> LedgerClient {
        LedgerClient::new(&self.base_url(), Duration::from_secs(2)).expect("build client")
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn start_leader(data_path: &Path) -> LedgerHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let config = LedgerConfig {
        listen: addr.clone(),
        data_path: data_path.to_path_buf(),
        replication_timeout_ms: 500,
        ..LedgerConfig::default()
    };
    let store = DurableStore::open(&config.data_path).expect("open store");
    let service = LedgerService::new(&config, store).expect("build service");
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let app = service.app();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
    });
    LedgerHandle {
        addr,
        shutdown,
        task,
    }
}

fn agent_for(ledger: &LedgerHandle, sql: Arc<RecordingExecutor>) -> ApplyAgent {
    let config = AgentConfig {
        ledger_addr: ledger.base_url(),
        request_timeout_ms: 2_000,
        ..AgentConfig::default()
    };
    ApplyAgent::new(&config, sql).expect("build agent")
}

fn update_segment(epoch: u64, txn_id: &str, balance: i64) -> Segment {
    let op = WriteOp::Update {
        table: "accounts".to_string(),
        id: 7,
        data: json!({"balance": balance})
            .as_object()
            .cloned()
            .unwrap_or_default(),
    };
    let payload = serde_json::to_vec(&op).expect("encode payload");
    Segment {
        range_id: "R".to_string(),
        epoch,
        txn_id: txn_id.to_string(),
        commit_index: 0,
        payload_type: "json".to_string(),
        checksum: payload_checksum(&payload),
        payload_bytes: payload,
    }
}

#[tokio::test]
async fn agent_applies_the_tail_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let ledger = start_leader(&dir.path().join("ledger.json")).await;
    let client = ledger.client();
    client
        .append_segment(&update_segment(3, "T1", 100))
        .await
        .expect("append");
    client
        .append_segment(&update_segment(3, "T2", 200))
        .await
        .expect("append");

    let sql = Arc::new(RecordingExecutor::default());
    let mut agent = agent_for(&ledger, sql.clone());
    let applied = agent.poll_once().await.expect("poll");
    assert_eq!(applied, 2);
    assert_eq!(agent.from_index(), 3);
    assert_eq!(
        agent.watermark("R"),
        Some(Watermark {
            epoch: 3,
            commit_index: 2
        })
    );

    let statements = sql.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].contains("balance=100"));
    assert!(statements[0].contains("'T1'"));
    assert!(statements[1].contains("balance=200"));

    // Nothing new: the next poll applies nothing and holds position.
    let applied = agent.poll_once().await.expect("poll");
    assert_eq!(applied, 0);
    assert_eq!(agent.from_index(), 3);

    ledger.stop().await;
}

#[tokio::test]
async fn stale_epochs_are_fenced_out() {
    let dir = TempDir::new().expect("tempdir");
    let ledger = start_leader(&dir.path().join("ledger.json")).await;
    let client = ledger.client();
    // A fenced-out owner's write lands in the log with its old epoch.
    client
        .append_segment(&update_segment(9, "T-stale", 150))
        .await
        .expect("append");

    let sql = Arc::new(RecordingExecutor::default());
    let mut agent = agent_for(&ledger, sql.clone());
    agent.seed_watermark("R", 10, 0);

    let applied = agent.poll_once().await.expect("poll");
    assert_eq!(applied, 0);
    assert!(sql.statements().is_empty());
    assert_eq!(
        agent.watermark("R"),
        Some(Watermark {
            epoch: 10,
            commit_index: 0
        })
    );

    // A write under the new owner applies and advances past the stale one.
    client
        .append_segment(&update_segment(11, "T-fresh", 300))
        .await
        .expect("append");
    let applied = agent.poll_once().await.expect("poll");
    assert_eq!(applied, 1);
    assert_eq!(agent.from_index(), 3);
    assert_eq!(
        agent.watermark("R"),
        Some(Watermark {
            epoch: 11,
            commit_index: 2
        })
    );

    ledger.stop().await;
}

#[tokio::test]
async fn re_delivery_is_idempotent_bookkeeping() {
    let dir = TempDir::new().expect("tempdir");
    let ledger = start_leader(&dir.path().join("ledger.json")).await;
    ledger
        .client()
        .append_segment(&update_segment(3, "T1", 200))
        .await
        .expect("append");

    let sql = Arc::new(RecordingExecutor::default());
    let mut agent = agent_for(&ledger, sql.clone());
    agent.poll_once().await.expect("first delivery");

    // Re-deliver the identical segment, as a restarted agent would see it.
    let redelivered = ledger.client().subscribe(1).await.expect("subscribe");
    agent
        .process_batch(redelivered)
        .await
        .expect("re-delivery");

    let statements = sql.statements();
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0], statements[1]);
    // The data write is naturally idempotent and the applied-set row
    // upserts on its (range_id, txn_id) key.
    assert!(statements[0].contains("UPDATE `accounts` SET balance=200"));
    assert!(statements[0].contains("INSERT INTO rlr_meta.applied_segments"));
    assert!(statements[0].contains("ON DUPLICATE KEY UPDATE commit_index=VALUES(commit_index)"));
    assert!(statements[0].contains("'T1'"));

    ledger.stop().await;
}

#[tokio::test]
async fn corrupt_payload_stalls_the_agent() {
    let dir = TempDir::new().expect("tempdir");
    let ledger = start_leader(&dir.path().join("ledger.json")).await;
    let mut poisoned = update_segment(3, "T-bad", 100);
    poisoned.checksum ^= 0xdead_beef;
    ledger
        .client()
        .append_segment(&poisoned)
        .await
        .expect("append");

    let sql = Arc::new(RecordingExecutor::default());
    let mut agent = agent_for(&ledger, sql.clone());

    for _ in 0..2 {
        let err = agent.poll_once().await.expect_err("stall");
        assert!(matches!(
            err,
            fenceline::agent::AgentError::ChecksumMismatch { .. }
        ));
        assert_eq!(agent.from_index(), 1);
    }
    assert!(sql.statements().is_empty());
    let metrics = agent.metrics().render();
    assert!(metrics.contains("agent_apply_errors_total 2\n"));
    assert!(metrics.contains("agent_applied_index 0\n"));

    ledger.stop().await;
}
