use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn line(out: &mut String, name: &str, value: u64) {
    out.push_str(name);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push('\n');
}

fn metrics_app(render: Arc<dyn Fn() -> String + Send + Sync>) -> Router {
    Router::new().route("/metrics", get(move || {
        let render = render.clone();
        async move { render() }
    }))
}

#[derive(Clone, Default)]
pub struct LedgerMetrics {
    inner: Arc<LedgerCounters>,
}

#[derive(Default)]
struct LedgerCounters {
    commit_index: AtomicU64,
    segments_appended: AtomicU64,
    leases_acquired: AtomicU64,
    leases_renewed: AtomicU64,
    quorum_failures: AtomicU64,
    store_faults: AtomicU64,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_commit_index(&self, value: u64) {
        self.inner.commit_index.store(value, Ordering::Relaxed);
    }

    pub fn record_append(&self) {
        self.inner.segments_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire(&self) {
        self.inner.leases_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_renew(&self) {
        self.inner.leases_renewed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quorum_failure(&self) {
        self.inner.quorum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_fault(&self) {
        self.inner.store_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        line(
            &mut out,
            "ledger_commit_index",
            self.inner.commit_index.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "ledger_segments_appended_total",
            self.inner.segments_appended.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "ledger_leases_acquired_total",
            self.inner.leases_acquired.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "ledger_leases_renewed_total",
            self.inner.leases_renewed.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "ledger_quorum_failures_total",
            self.inner.quorum_failures.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "ledger_store_faults_total",
            self.inner.store_faults.load(Ordering::Relaxed),
        );
        out
    }

    pub fn app(&self) -> Router {
        let metrics = self.clone();
        metrics_app(Arc::new(move || metrics.render()))
    }
}

#[derive(Clone, Default)]
pub struct RouterMetrics {
    inner: Arc<RouterCounters>,
}

#[derive(Default)]
struct RouterCounters {
    writes: AtomicU64,
    write_errors: AtomicU64,
    lease_admin: AtomicU64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self) {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.inner.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_admin(&self) {
        self.inner.lease_admin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        line(
            &mut out,
            "router_write_total",
            self.inner.writes.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "router_write_errors_total",
            self.inner.write_errors.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "router_lease_admin_total",
            self.inner.lease_admin.load(Ordering::Relaxed),
        );
        out
    }

    pub fn app(&self) -> Router {
        let metrics = self.clone();
        metrics_app(Arc::new(move || metrics.render()))
    }
}

#[derive(Clone, Default)]
pub struct AgentMetrics {
    inner: Arc<AgentCounters>,
}

#[derive(Default)]
struct AgentCounters {
    applied_index: AtomicU64,
    last_epoch: AtomicU64,
    applied: AtomicU64,
    stale_skipped: AtomicU64,
    apply_errors: AtomicU64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self, commit_index: u64, epoch: u64) {
        self.inner.applied_index.store(commit_index, Ordering::Relaxed);
        self.inner.last_epoch.fetch_max(epoch, Ordering::Relaxed);
        self.inner.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_skip(&self) {
        self.inner.stale_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_apply_error(&self) {
        self.inner.apply_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        line(
            &mut out,
            "agent_applied_index",
            self.inner.applied_index.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "agent_last_epoch",
            self.inner.last_epoch.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "agent_applied_total",
            self.inner.applied.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "agent_stale_skipped_total",
            self.inner.stale_skipped.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "agent_apply_errors_total",
            self.inner.apply_errors.load(Ordering::Relaxed),
        );
        out
    }

    pub fn app(&self) -> Router {
        let metrics = self.clone();
        metrics_app(Arc::new(move || metrics.render()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_render_reflects_counters() {
        let metrics = LedgerMetrics::new();
        metrics.set_commit_index(42);
        metrics.record_append();
        metrics.record_append();
        metrics.record_quorum_failure();
        let text = metrics.render();
        assert!(text.contains("ledger_commit_index 42\n"));
        assert!(text.contains("ledger_segments_appended_total 2\n"));
        assert!(text.contains("ledger_quorum_failures_total 1\n"));
    }

    #[test]
    fn agent_epoch_watermark_never_regresses() {
        let metrics = AgentMetrics::new();
        metrics.record_applied(5, 10);
        metrics.record_applied(6, 9);
        let text = metrics.render();
        assert!(text.contains("agent_applied_index 6\n"));
        assert!(text.contains("agent_last_epoch 10\n"));
        assert!(text.contains("agent_applied_total 2\n"));
    }
}
