//! Wire types shared by the ledger, router, and agent, plus the HTTP
//! client used to reach a ledger node.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Marker header distinguishing leader-to-follower fan-out from client
/// traffic. Its presence on a mutating request bypasses leader gating,
/// suppresses re-replication, and carries pre-assigned state verbatim.
pub const REPLICATE_HEADER: &str = "X-Replicate";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("ledger transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("ledger returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(err) => err.status(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

/// The time-bounded right to be the single owner of a range, fenced by
/// a strictly monotone epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub range_id: String,
    pub owner_id: String,
    pub epoch: u64,
    pub expiry_ms: i64,
}

/// One immutable commit record. `commit_index` is assigned by the
/// leader; clients submit it as zero. The payload is opaque to the
/// ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub range_id: String,
    pub epoch: u64,
    pub txn_id: String,
    #[serde(default)]
    pub commit_index: u64,
    pub payload_type: String,
    pub payload_bytes: Vec<u8>,
    #[serde(default)]
    pub checksum: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLeaseRequest {
    pub range_id: String,
    pub owner_id: String,
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewLeaseRequest {
    pub range_id: String,
    pub owner_id: String,
    pub epoch: u64,
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendSegmentResponse {
    pub commit_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub leader: String,
    pub commit_index: u64,
    pub peers: Vec<String>,
}

/// Structured write accepted by the router and carried opaquely through
/// the ledger as the segment payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WriteOp {
    Insert {
        table: String,
        id: i64,
        data: serde_json::Map<String, serde_json::Value>,
    },
    Update {
        table: String,
        id: i64,
        data: serde_json::Map<String, serde_json::Value>,
    },
    Delete {
        table: String,
        id: i64,
    },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            WriteOp::Insert { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id, .. } => {
                *id
            }
        }
    }
}

/// First four bytes of the blake3 digest, little-endian. The router
/// stamps it on every segment; the agent refuses to apply a segment
/// whose payload no longer matches.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = blake3::hash(payload);
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(i64::MAX as u128) as i64
}

#[derive(Clone)]
pub struct LedgerClient {
    base_url: String,
    client: reqwest::Client,
}

impl LedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn acquire_lease(&self, req: &AcquireLeaseRequest) -> ApiResult<Lease> {
        self.post_json("/lease/acquire", req).await
    }

    pub async fn renew_lease(&self, req: &RenewLeaseRequest) -> ApiResult<Lease> {
        self.post_json("/lease/renew", req).await
    }

    pub async fn get_lease(&self, range_id: &str) -> ApiResult<Lease> {
        let resp = self
            .client
            .get(format!("{}/lease/get", self.base_url))
            .query(&[("range_id", range_id)])
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn append_segment(&self, seg: &Segment) -> ApiResult<AppendSegmentResponse> {
        self.post_json("/segment/append", seg).await
    }

    pub async fn subscribe(&self, from: u64) -> ApiResult<Vec<Segment>> {
        let resp = self
            .client
            .get(format!("{}/segment/subscribe", self.base_url))
            .query(&[("from_commit_index", from)])
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn status(&self) -> ApiResult<StatusResponse> {
        let resp = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post_json<In, Out>(&self, path: &str, body: &In) -> ApiResult<Out>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<Out: DeserializeOwned>(resp: reqwest::Response) -> ApiResult<Out> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_stable_and_order_sensitive() {
        let a = payload_checksum(b"{\"op\":\"insert\"}");
        let b = payload_checksum(b"{\"op\":\"insert\"}");
        let c = payload_checksum(b"{\"op\":\"update\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn write_op_uses_flat_tagged_encoding() {
        let op = WriteOp::Insert {
            table: "accounts".to_string(),
            id: 7,
            data: json!({"balance": 100})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "insert");
        assert_eq!(value["table"], "accounts");
        assert_eq!(value["id"], 7);
        assert_eq!(value["data"]["balance"], 100);

        let back: WriteOp = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn segment_accepts_bodies_without_assigned_fields() {
        let seg: Segment = serde_json::from_value(json!({
            "range_id": "R",
            "epoch": 3,
            "txn_id": "t1",
            "payload_type": "json",
            "payload_bytes": [1, 2, 3],
        }))
        .unwrap();
        assert_eq!(seg.commit_index, 0);
        assert_eq!(seg.checksum, 0);
    }
}
