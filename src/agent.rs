//! The apply agent: tails the commit log and applies each segment to
//! its collocated replica exactly once. Epoch fencing keeps a stale
//! owner's tail from overwriting state ratified under a newer owner.
//! A poison segment stalls the agent rather than being skipped, since
//! a stalled replica is preferable to a divergent one.

use crate::api::{payload_checksum, ApiError, LedgerClient, Segment, WriteOp};
use crate::config::AgentConfig;
use crate::metrics::AgentMetrics;
use crate::sql::{self, SqlEndpoint, SqlError, SqlExecutor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("ledger error: {0}")]
    Ledger(#[from] ApiError),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error("checksum mismatch for txn {txn_id}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        txn_id: String,
        stored: u32,
        computed: u32,
    },
    #[error("unsupported payload type {payload_type} for txn {txn_id}")]
    UnsupportedPayload {
        txn_id: String,
        payload_type: String,
    },
    #[error("undecodable payload for txn {txn_id}: {source}")]
    BadPayload {
        txn_id: String,
        source: serde_json::Error,
    },
}

/// Highest segment applied for one range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    pub epoch: u64,
    pub commit_index: u64,
}

pub struct ApplyAgent {
    ledger: LedgerClient,
    sql: Arc<dyn SqlExecutor>,
    endpoint: SqlEndpoint,
    metrics: AgentMetrics,
    poll_interval: Duration,
    from: u64,
    watermarks: HashMap<String, Watermark>,
}

impl ApplyAgent {
    pub fn new(config: &AgentConfig, sql: Arc<dyn SqlExecutor>) -> Result<Self, AgentError> {
        let ledger = LedgerClient::new(
            &config.ledger_addr,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self {
            ledger,
            sql,
            endpoint: SqlEndpoint {
                host: config.sql_host.clone(),
                port: config.sql_port,
                user: config.sql.user.clone(),
                password: config.sql.password.clone(),
                database: config.sql.database.clone(),
            },
            metrics: AgentMetrics::new(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            from: config.start_commit_index.max(1),
            watermarks: HashMap::new(),
        })
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.metrics.clone()
    }

    pub fn from_index(&self) -> u64 {
        self.from
    }

    pub fn watermark(&self, range_id: &str) -> Option<Watermark> {
        self.watermarks.get(range_id).copied()
    }

    /// Restores the applied-set watermark for a range, e.g. recovered
    /// from the replica's metadata table before the loop starts.
    pub fn seed_watermark(&mut self, range_id: &str, epoch: u64, commit_index: u64) {
        self.watermarks.insert(
            range_id.to_string(),
            Watermark {
                epoch,
                commit_index,
            },
        );
        self.from = self.from.max(commit_index + 1);
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(from = self.from, "apply agent started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.poll_once().await {
                warn!(error = %err, from = self.from, "apply pass failed; retrying");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("apply agent stopped");
    }

    pub async fn poll_once(&mut self) -> Result<usize, AgentError> {
        let segments = self.ledger.subscribe(self.from).await?;
        self.process_batch(segments).await
    }

    /// Applies segments in commit order. A stale epoch is skipped
    /// without advancing `from` on its own; an apply failure abandons
    /// the rest of the batch so the next pass retries the same index.
    pub async fn process_batch(&mut self, segments: Vec<Segment>) -> Result<usize, AgentError> {
        let mut applied = 0;
        for seg in segments {
            let fence = self
                .watermarks
                .get(&seg.range_id)
                .map(|mark| mark.epoch)
                .unwrap_or(0);
            if seg.epoch < fence {
                self.metrics.record_stale_skip();
                debug!(
                    range_id = %seg.range_id,
                    commit_index = seg.commit_index,
                    epoch = seg.epoch,
                    fence,
                    "stale segment skipped"
                );
                continue;
            }
            if let Err(err) = self.apply_segment(&seg).await {
                self.metrics.record_apply_error();
                warn!(
                    range_id = %seg.range_id,
                    commit_index = seg.commit_index,
                    txn_id = %seg.txn_id,
                    error = %err,
                    "apply failed; holding position"
                );
                return Err(err);
            }
            let mark = self.watermarks.entry(seg.range_id.clone()).or_default();
            mark.epoch = mark.epoch.max(seg.epoch);
            mark.commit_index = seg.commit_index;
            self.from = seg.commit_index + 1;
            self.metrics.record_applied(seg.commit_index, seg.epoch);
            applied += 1;
        }
        Ok(applied)
    }

    /// One transaction: the data write in its idempotent form plus the
    /// applied-set upsert keyed `(range_id, txn_id)`.
    async fn apply_segment(&self, seg: &Segment) -> Result<(), AgentError> {
        let computed = payload_checksum(&seg.payload_bytes);
        if computed != seg.checksum {
            return Err(AgentError::ChecksumMismatch {
                txn_id: seg.txn_id.clone(),
                stored: seg.checksum,
                computed,
            });
        }
        if seg.payload_type != "json" {
            return Err(AgentError::UnsupportedPayload {
                txn_id: seg.txn_id.clone(),
                payload_type: seg.payload_type.clone(),
            });
        }
        let op: WriteOp =
            serde_json::from_slice(&seg.payload_bytes).map_err(|source| AgentError::BadPayload {
                txn_id: seg.txn_id.clone(),
                source,
            })?;
        let write = sql::write_statement(&op, true)?;
        let bookkeeping = sql::applied_segment_upsert(seg);
        self.sql
            .execute(&self.endpoint, &sql::transaction(&[write, bookkeeping]))
            .await?;
        Ok(())
    }
}
