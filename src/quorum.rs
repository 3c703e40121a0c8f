//! Leader-side replication fan-out. Every lease write and segment
//! append is pushed to the follower set in parallel and counts acks
//! until a strict majority of the full replica set (leader included)
//! has confirmed.

use crate::api::{Lease, Segment, REPLICATE_HEADER};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("replication client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("quorum unreachable: {acks} of {needed} acks")]
    Unreachable { acks: usize, needed: usize },
}

/// Majority of a replica set with `followers` peers plus the leader.
pub fn majority(followers: usize) -> usize {
    (followers + 1) / 2 + 1
}

#[derive(Clone)]
pub struct QuorumReplicator {
    leader_addr: String,
    followers: Vec<String>,
    client: reqwest::Client,
}

impl QuorumReplicator {
    pub fn new(
        leader_addr: &str,
        peers: &[String],
        timeout: Duration,
    ) -> Result<Self, QuorumError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let followers = peers
            .iter()
            .filter(|peer| peer.as_str() != leader_addr)
            .cloned()
            .collect();
        Ok(Self {
            leader_addr: leader_addr.to_string(),
            followers,
            client,
        })
    }

    pub fn is_leader(&self, self_addr: &str) -> bool {
        self_addr == self.leader_addr
    }

    pub fn leader_addr(&self) -> &str {
        &self.leader_addr
    }

    pub fn followers(&self) -> &[String] {
        &self.followers
    }

    /// Lease fan-out carries the full record with its absolute expiry,
    /// so followers never re-derive it from a TTL.
    pub async fn replicate_lease(&self, lease: &Lease) -> Result<(), QuorumError> {
        let payload = serde_json::to_value(lease).unwrap_or_default();
        self.replicate("/lease/renew", payload).await
    }

    /// Segment fan-out carries the leader-assigned commit index.
    pub async fn replicate_segment(&self, seg: &Segment) -> Result<(), QuorumError> {
        let payload = serde_json::to_value(seg).unwrap_or_default();
        self.replicate("/segment/append", payload).await
    }

    async fn replicate(
        &self,
        path: &'static str,
        payload: serde_json::Value,
    ) -> Result<(), QuorumError> {
        if self.followers.is_empty() {
            return Ok(());
        }
        let needed = majority(self.followers.len());
        // The leader's own persistence counts as the first ack.
        let mut acks = 1usize;
        let mut tasks = JoinSet::new();
        for peer in &self.followers {
            let client = self.client.clone();
            let url = format!("http://{peer}{path}");
            let body = payload.clone();
            tasks.spawn(async move {
                let sent = client
                    .post(&url)
                    .header(REPLICATE_HEADER, "true")
                    .json(&body)
                    .send()
                    .await;
                match sent {
                    Ok(resp) if resp.status().is_success() => Ok(()),
                    Ok(resp) => Err(format!("{url}: http {}", resp.status())),
                    Err(err) => Err(format!("{url}: {err}")),
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {
                    acks += 1;
                    if acks >= needed {
                        return Ok(());
                    }
                }
                Ok(Err(reason)) => warn!(%reason, "replication ack missing"),
                Err(err) => warn!(error = %err, "replication task failed"),
            }
        }
        Err(QuorumError::Unreachable { acks, needed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_counts_the_leader() {
        assert_eq!(majority(0), 1);
        assert_eq!(majority(1), 2);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 3);
        assert_eq!(majority(4), 3);
    }

    #[test]
    fn leader_is_excluded_from_fan_out() {
        let peers = vec![
            "127.0.0.1:7000".to_string(),
            "127.0.0.1:7002".to_string(),
            "127.0.0.1:7004".to_string(),
        ];
        let quorum =
            QuorumReplicator::new("127.0.0.1:7000", &peers, Duration::from_millis(100))
                .expect("build");
        assert_eq!(quorum.followers().len(), 2);
        assert!(quorum.is_leader("127.0.0.1:7000"));
        assert!(!quorum.is_leader("127.0.0.1:7002"));
    }

    #[tokio::test]
    async fn empty_follower_set_commits_immediately() {
        let quorum = QuorumReplicator::new("127.0.0.1:7000", &[], Duration::from_millis(100))
            .expect("build");
        let lease = Lease {
            range_id: "R".to_string(),
            owner_id: "n1".to_string(),
            epoch: 1,
            expiry_ms: 1,
        };
        quorum.replicate_lease(&lease).await.expect("solo quorum");
    }

    #[tokio::test]
    async fn unreachable_followers_fail_the_round() {
        // Port 1 is reserved and nothing listens on it.
        let peers = vec!["127.0.0.1:1".to_string()];
        let quorum = QuorumReplicator::new("127.0.0.1:7000", &peers, Duration::from_millis(200))
            .expect("build");
        let lease = Lease {
            range_id: "R".to_string(),
            owner_id: "n1".to_string(),
            epoch: 1,
            expiry_ms: 1,
        };
        let err = quorum.replicate_lease(&lease).await.expect_err("no quorum");
        assert!(matches!(
            err,
            QuorumError::Unreachable { acks: 1, needed: 2 }
        ));
    }
}
