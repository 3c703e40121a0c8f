//! The ledger service: lease issue/renew, totally ordered segment
//! appends, and the subscribe/status read surface. One instance is the
//! configured leader; the rest are followers that only accept
//! replication-tagged traffic for mutations.

use crate::api::{
    unix_millis, AcquireLeaseRequest, AppendSegmentResponse, Lease, RenewLeaseRequest, Segment,
    StatusResponse, REPLICATE_HEADER,
};
use crate::config::LedgerConfig;
use crate::metrics::LedgerMetrics;
use crate::quorum::{QuorumError, QuorumReplicator};
use crate::store::{DurableStore, StoreError};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not leader; leader is {0}")]
    NotLeader(String),
    #[error("lease not found for range {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    #[error("storage fault: {0}")]
    Storage(#[from] StoreError),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotLeader(_) => StatusCode::CONFLICT,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            LedgerError::Quorum(_) => StatusCode::BAD_GATEWAY,
            LedgerError::Storage(StoreError::LeaseNotFound(_)) => StatusCode::NOT_FOUND,
            LedgerError::Storage(StoreError::StaleLease { .. }) => StatusCode::PRECONDITION_FAILED,
            LedgerError::Storage(_) | LedgerError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct LedgerService {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    self_addr: String,
    store: DurableStore,
    quorum: QuorumReplicator,
    // Serializes epoch minting, index assignment, and quorum staging so
    // a failed round never consumes an index or an epoch.
    commit_gate: Mutex<()>,
    metrics: LedgerMetrics,
}

impl LedgerService {
    pub fn new(config: &LedgerConfig, store: DurableStore) -> Result<Self, LedgerError> {
        let quorum = QuorumReplicator::new(
            &config.leader_addr(),
            &config.peers,
            std::time::Duration::from_millis(config.replication_timeout_ms),
        )?;
        let metrics = LedgerMetrics::new();
        metrics.set_commit_index(store.get_commit_index());
        Ok(Self {
            inner: Arc::new(LedgerInner {
                self_addr: config.listen.clone(),
                store,
                quorum,
                commit_gate: Mutex::new(()),
                metrics,
            }),
        })
    }

    pub fn metrics(&self) -> LedgerMetrics {
        self.inner.metrics.clone()
    }

    pub fn app(&self) -> Router {
        Router::new()
            .route("/lease/acquire", post(acquire_lease))
            .route("/lease/renew", post(renew_lease))
            .route("/lease/get", get(get_lease))
            .route("/segment/append", post(append_segment))
            .route("/segment/subscribe", get(subscribe))
            .route("/status", get(status))
            .route("/metrics", get(metrics_text))
            .with_state(self.clone())
    }

    async fn acquire(&self, req: AcquireLeaseRequest) -> Result<Lease, LedgerError> {
        self.ensure_leader()?;
        if req.range_id.is_empty() || req.owner_id.is_empty() {
            return Err(LedgerError::BadRequest(
                "range_id and owner_id are required".to_string(),
            ));
        }
        let _gate = self.inner.commit_gate.lock().await;
        let stored_epoch = match self.inner.store.get_lease(&req.range_id) {
            Ok(lease) => lease.epoch,
            Err(StoreError::LeaseNotFound(_)) => 0,
            Err(err) => return Err(err.into()),
        };
        let lease = Lease {
            range_id: req.range_id,
            owner_id: req.owner_id,
            epoch: mint_epoch(stored_epoch, wall_clock_ns()),
            expiry_ms: unix_millis() + req.ttl_ms,
        };
        self.replicate_lease(&lease).await?;
        self.put_lease_blocking(lease.clone()).await?;
        self.inner.metrics.record_acquire();
        info!(
            range_id = %lease.range_id,
            owner_id = %lease.owner_id,
            epoch = lease.epoch,
            "lease acquired"
        );
        Ok(lease)
    }

    async fn renew(&self, req: RenewLeaseRequest) -> Result<Lease, LedgerError> {
        self.ensure_leader()?;
        let _gate = self.inner.commit_gate.lock().await;
        let stored = self
            .inner
            .store
            .get_lease(&req.range_id)
            .map_err(not_found)?;
        if stored.epoch != req.epoch {
            return Err(LedgerError::FailedPrecondition(format!(
                "epoch mismatch for range {}: supplied {}, stored {}",
                req.range_id, req.epoch, stored.epoch
            )));
        }
        if stored.owner_id != req.owner_id {
            return Err(LedgerError::FailedPrecondition(format!(
                "owner mismatch for range {}: supplied {}, stored {}",
                req.range_id, req.owner_id, stored.owner_id
            )));
        }
        // A renew only ever advances the expiry.
        let lease = Lease {
            expiry_ms: stored.expiry_ms.max(unix_millis() + req.ttl_ms),
            ..stored
        };
        self.replicate_lease(&lease).await?;
        self.put_lease_blocking(lease.clone()).await?;
        self.inner.metrics.record_renew();
        Ok(lease)
    }

    /// Follower ingest of a replicated lease record.
    async fn ingest_lease(&self, lease: Lease) -> Result<Lease, LedgerError> {
        if lease.range_id.is_empty() {
            return Err(LedgerError::BadRequest("range_id is required".to_string()));
        }
        self.put_lease_blocking(lease.clone()).await?;
        Ok(lease)
    }

    async fn append(&self, mut seg: Segment) -> Result<u64, LedgerError> {
        self.ensure_leader()?;
        if seg.range_id.is_empty() || seg.txn_id.is_empty() {
            return Err(LedgerError::BadRequest(
                "range_id and txn_id are required".to_string(),
            ));
        }
        let _gate = self.inner.commit_gate.lock().await;
        seg.commit_index = self.inner.store.get_commit_index() + 1;
        self.replicate_segment(&seg).await?;
        let index = seg.commit_index;
        let store = self.inner.store.clone();
        let committed = tokio::task::spawn_blocking(move || store.commit_segment(seg)).await?;
        if let Err(err) = committed {
            self.note_store_fault(&err);
            return Err(err.into());
        }
        self.inner.metrics.set_commit_index(index);
        self.inner.metrics.record_append();
        Ok(index)
    }

    /// Follower ingest of a replicated segment; the leader's index is
    /// taken verbatim.
    async fn ingest_segment(&self, seg: Segment) -> Result<u64, LedgerError> {
        if seg.commit_index == 0 {
            return Err(LedgerError::BadRequest(
                "replicated segment is missing its commit index".to_string(),
            ));
        }
        let index = seg.commit_index;
        let store = self.inner.store.clone();
        let accepted = tokio::task::spawn_blocking(move || store.accept_replicated(seg)).await?;
        if let Err(err) = accepted {
            self.note_store_fault(&err);
            return Err(err.into());
        }
        self.inner
            .metrics
            .set_commit_index(self.inner.store.get_commit_index());
        Ok(index)
    }

    fn ensure_leader(&self) -> Result<(), LedgerError> {
        if self.inner.quorum.is_leader(&self.inner.self_addr) {
            Ok(())
        } else {
            Err(LedgerError::NotLeader(
                self.inner.quorum.leader_addr().to_string(),
            ))
        }
    }

    async fn replicate_lease(&self, lease: &Lease) -> Result<(), LedgerError> {
        self.inner.quorum.replicate_lease(lease).await.map_err(|err| {
            self.inner.metrics.record_quorum_failure();
            warn!(range_id = %lease.range_id, error = %err, "lease replication failed");
            err.into()
        })
    }

    async fn replicate_segment(&self, seg: &Segment) -> Result<(), LedgerError> {
        self.inner.quorum.replicate_segment(seg).await.map_err(|err| {
            self.inner.metrics.record_quorum_failure();
            warn!(
                range_id = %seg.range_id,
                commit_index = seg.commit_index,
                error = %err,
                "segment replication failed"
            );
            err.into()
        })
    }

    async fn put_lease_blocking(&self, lease: Lease) -> Result<(), LedgerError> {
        let store = self.inner.store.clone();
        let result = tokio::task::spawn_blocking(move || store.put_lease(lease)).await?;
        if let Err(err) = &result {
            self.note_store_fault(err);
        }
        result.map_err(Into::into)
    }

    fn note_store_fault(&self, err: &StoreError) {
        if matches!(err, StoreError::Io(_) | StoreError::Serde(_)) {
            self.inner.metrics.record_store_fault();
        }
    }
}

fn not_found(err: StoreError) -> LedgerError {
    match err {
        StoreError::LeaseNotFound(range_id) => LedgerError::NotFound(range_id),
        other => LedgerError::Storage(other),
    }
}

fn mint_epoch(stored: u64, wall_ns: u64) -> u64 {
    stored.max(wall_ns).saturating_add(1)
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(u128::from(u64::MAX)) as u64
}

fn is_replication(headers: &HeaderMap) -> bool {
    headers
        .get(REPLICATE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct GetLeaseParams {
    #[serde(default)]
    range_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    from_commit_index: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn acquire_lease(
    State(service): State<LedgerService>,
    Json(req): Json<AcquireLeaseRequest>,
) -> Result<Json<Lease>, LedgerError> {
    Ok(Json(service.acquire(req).await?))
}

// The client path and the replication path carry different body types:
// a renew request with a TTL, or a full lease record with its absolute
// expiry. The marker header picks the parse.
async fn renew_lease(
    State(service): State<LedgerService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Lease>, LedgerError> {
    if is_replication(&headers) {
        let lease: Lease = serde_json::from_slice(&body)
            .map_err(|err| LedgerError::BadRequest(err.to_string()))?;
        return Ok(Json(service.ingest_lease(lease).await?));
    }
    let req: RenewLeaseRequest =
        serde_json::from_slice(&body).map_err(|err| LedgerError::BadRequest(err.to_string()))?;
    Ok(Json(service.renew(req).await?))
}

async fn get_lease(
    State(service): State<LedgerService>,
    Query(params): Query<GetLeaseParams>,
) -> Result<Json<Lease>, LedgerError> {
    let range_id = params
        .range_id
        .filter(|range_id| !range_id.is_empty())
        .ok_or_else(|| LedgerError::BadRequest("range_id is required".to_string()))?;
    let lease = service
        .inner
        .store
        .get_lease(&range_id)
        .map_err(not_found)?;
    Ok(Json(lease))
}

async fn append_segment(
    State(service): State<LedgerService>,
    headers: HeaderMap,
    Json(seg): Json<Segment>,
) -> Result<Json<AppendSegmentResponse>, LedgerError> {
    let commit_index = if is_replication(&headers) {
        service.ingest_segment(seg).await?
    } else {
        service.append(seg).await?
    };
    Ok(Json(AppendSegmentResponse { commit_index }))
}

async fn subscribe(
    State(service): State<LedgerService>,
    Query(params): Query<SubscribeParams>,
) -> Json<Vec<Segment>> {
    let from = params.from_commit_index.unwrap_or(1);
    Json(service.inner.store.list_segments_from(from, params.limit))
}

async fn metrics_text(State(service): State<LedgerService>) -> String {
    service.inner.metrics.render()
}

async fn status(State(service): State<LedgerService>) -> Json<StatusResponse> {
    Json(StatusResponse {
        leader: service.inner.quorum.leader_addr().to_string(),
        commit_index: service.inner.store.get_commit_index(),
        peers: service.inner.quorum.followers().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn minted_epochs_are_strictly_monotone() {
        assert_eq!(mint_epoch(0, 100), 101);
        // A clock that went backwards still advances past the store.
        assert_eq!(mint_epoch(500, 100), 501);
        assert!(mint_epoch(u64::MAX, 1) == u64::MAX);
    }

    #[test]
    fn replication_marker_is_case_insensitive_on_value() {
        let mut headers = HeaderMap::new();
        assert!(!is_replication(&headers));
        headers.insert(REPLICATE_HEADER, HeaderValue::from_static("True"));
        assert!(is_replication(&headers));
        headers.insert(REPLICATE_HEADER, HeaderValue::from_static("0"));
        assert!(!is_replication(&headers));
    }
}
