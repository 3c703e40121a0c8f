//! The write router: binds each client write to the range's current
//! lease, executes it against the owner backend, then records it in
//! the ledger. Holds no persistent state of its own.

use crate::api::{
    payload_checksum, AcquireLeaseRequest, ApiError, Lease, LedgerClient, Segment, WriteOp,
};
use crate::config::{RouterConfig, SqlCredentials};
use crate::metrics::RouterMetrics;
use crate::sql::{self, NodeMode, SqlEndpoint, SqlError, SqlExecutor};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("lease not found for range {0}")]
    LeaseMissing(String),
    #[error("owner {0} has no mapped backend")]
    OwnerUnknown(String),
    #[error("backend error: {0}")]
    Upstream(#[from] SqlError),
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(ApiError),
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = match &self {
            RouterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RouterError::LeaseMissing(_) => StatusCode::NOT_FOUND,
            RouterError::OwnerUnknown(_) => StatusCode::BAD_GATEWAY,
            RouterError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::LedgerUnavailable(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteAck {
    pub status: String,
}

#[derive(Clone)]
pub struct WriteRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    range_id: String,
    owner_map: HashMap<String, String>,
    lease_ttl_ms: i64,
    sql_credentials: SqlCredentials,
    admin_credentials: SqlCredentials,
    ledger: LedgerClient,
    sql: Arc<dyn SqlExecutor>,
    metrics: RouterMetrics,
}

impl WriteRouter {
    pub fn new(config: &RouterConfig, sql: Arc<dyn SqlExecutor>) -> Result<Self, RouterError> {
        let ledger = LedgerClient::new(
            &config.ledger_addr,
            Duration::from_millis(config.request_timeout_ms),
        )
        .map_err(RouterError::LedgerUnavailable)?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                range_id: config.range_id.clone(),
                owner_map: config.owner_map(),
                lease_ttl_ms: config.lease_ttl_ms,
                sql_credentials: config.sql.clone(),
                admin_credentials: config.admin_sql.clone(),
                ledger,
                sql,
                metrics: RouterMetrics::new(),
            }),
        })
    }

    pub fn metrics(&self) -> RouterMetrics {
        self.inner.metrics.clone()
    }

    pub fn app(&self) -> Router {
        Router::new()
            .route("/write", post(handle_write))
            .route("/admin/lease", post(handle_admin_lease))
            .route("/metrics", get(handle_metrics))
            .with_state(self.clone())
    }

    /// The write path: lease, then owner, then execute, then append.
    /// Lease expiry is advisory here; epoch fencing downstream is what
    /// keeps a stale owner's tail out of the replicas.
    pub async fn write(&self, op: WriteOp) -> Result<WriteAck, RouterError> {
        if !valid_table(op.table()) {
            return Err(RouterError::BadRequest(format!(
                "invalid table name {:?}",
                op.table()
            )));
        }
        let lease = self
            .inner
            .ledger
            .get_lease(&self.inner.range_id)
            .await
            .map_err(|err| classify_lease_error(&self.inner.range_id, err))?;
        let host = self
            .inner
            .owner_map
            .get(&lease.owner_id)
            .ok_or_else(|| RouterError::OwnerUnknown(lease.owner_id.clone()))?;

        let statement = sql::write_statement(&op, false).map_err(bad_payload)?;
        let endpoint = self.endpoint(host, &self.inner.sql_credentials);
        self.inner
            .sql
            .execute(&endpoint, &sql::transaction(&[statement]))
            .await?;

        let payload = serde_json::to_vec(&op)
            .map_err(|err| RouterError::BadRequest(err.to_string()))?;
        let seg = Segment {
            range_id: self.inner.range_id.clone(),
            epoch: lease.epoch,
            txn_id: Uuid::new_v4().simple().to_string(),
            commit_index: 0,
            payload_type: "json".to_string(),
            checksum: payload_checksum(&payload),
            payload_bytes: payload,
        };
        let appended = self
            .inner
            .ledger
            .append_segment(&seg)
            .await
            .map_err(RouterError::LedgerUnavailable)?;
        self.inner.metrics.record_write();
        info!(
            range_id = %self.inner.range_id,
            txn_id = %seg.txn_id,
            commit_index = appended.commit_index,
            "write recorded"
        );
        Ok(WriteAck {
            status: "ok".to_string(),
        })
    }

    /// Acquires the lease for the named owner, then pushes the mode
    /// flags to every mapped backend.
    pub async fn admin_lease(&self, owner: &str) -> Result<Lease, RouterError> {
        let lease = self
            .inner
            .ledger
            .acquire_lease(&AcquireLeaseRequest {
                range_id: self.inner.range_id.clone(),
                owner_id: owner.to_string(),
                ttl_ms: self.inner.lease_ttl_ms,
            })
            .await
            .map_err(RouterError::LedgerUnavailable)?;

        let mut nodes: Vec<(&String, &String)> = self.inner.owner_map.iter().collect();
        nodes.sort();
        for (node, host) in nodes {
            let mode = if node == owner {
                NodeMode::Owner
            } else {
                NodeMode::Replica
            };
            let endpoint = self.endpoint(host, &self.inner.admin_credentials);
            self.inner
                .sql
                .execute(&endpoint, &sql::mode_statement(node, mode))
                .await?;
        }
        self.inner.metrics.record_lease_admin();
        info!(owner_id = %owner, epoch = lease.epoch, "ownership switched");
        Ok(lease)
    }

    fn endpoint(&self, host_port: &str, credentials: &SqlCredentials) -> SqlEndpoint {
        let (host, port) = sql::split_host_port(host_port);
        SqlEndpoint {
            host,
            port,
            user: credentials.user.clone(),
            password: credentials.password.clone(),
            database: credentials.database.clone(),
        }
    }
}

fn classify_lease_error(range_id: &str, err: ApiError) -> RouterError {
    if err.is_not_found() {
        RouterError::LeaseMissing(range_id.to_string())
    } else {
        RouterError::LedgerUnavailable(err)
    }
}

fn bad_payload(err: SqlError) -> RouterError {
    match err {
        SqlError::BadValue(_) | SqlError::EmptyWrite(_) => RouterError::BadRequest(err.to_string()),
        other => RouterError::Upstream(other),
    }
}

fn valid_table(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[derive(Debug, Deserialize)]
struct AdminLeaseParams {
    #[serde(default)]
    owner: Option<String>,
}

async fn handle_write(
    State(router): State<WriteRouter>,
    Json(op): Json<WriteOp>,
) -> Result<Json<WriteAck>, RouterError> {
    match router.write(op).await {
        Ok(ack) => Ok(Json(ack)),
        Err(err) => {
            router.inner.metrics.record_write_error();
            warn!(error = %err, "write rejected");
            Err(err)
        }
    }
}

async fn handle_admin_lease(
    State(router): State<WriteRouter>,
    Query(params): Query<AdminLeaseParams>,
) -> Result<Json<Lease>, RouterError> {
    let owner = params
        .owner
        .filter(|owner| !owner.is_empty())
        .ok_or_else(|| RouterError::BadRequest("owner is required".to_string()))?;
    Ok(Json(router.admin_lease(&owner).await?))
}

async fn handle_metrics(State(router): State<WriteRouter>) -> String {
    router.inner.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn table_names_are_restricted() {
        assert!(valid_table("accounts"));
        assert!(valid_table("audit_log2"));
        assert!(!valid_table(""));
        assert!(!valid_table("accounts; DROP TABLE users"));
        assert!(!valid_table("demo.accounts"));
    }

    #[test]
    fn missing_lease_maps_to_lease_missing() {
        let err = classify_lease_error(
            "R",
            ApiError::Status {
                status: StatusCode::NOT_FOUND,
                body: "lease not found".to_string(),
            },
        );
        assert!(matches!(err, RouterError::LeaseMissing(range) if range == "R"));

        let err = classify_lease_error(
            "R",
            ApiError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: "quorum unreachable".to_string(),
            },
        );
        assert!(matches!(err, RouterError::LedgerUnavailable(_)));
    }

    #[test]
    fn payload_errors_are_client_errors() {
        assert!(matches!(
            bad_payload(SqlError::BadValue("tags".to_string())),
            RouterError::BadRequest(_)
        ));
        assert!(matches!(
            bad_payload(SqlError::Exec("boom".to_string())),
            RouterError::Upstream(_)
        ));
    }
}
