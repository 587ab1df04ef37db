use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use canopy_core::engine::{CheckResult, DecisionSource};
use canopy_storage::SweepReport;

#[derive(Debug, Default)]
pub struct Metrics {
    request_total: AtomicU64,
    request_success: AtomicU64,
    request_error: AtomicU64,
    checks_allowed: AtomicU64,
    checks_denied: AtomicU64,
    decisions_owner: AtomicU64,
    decisions_user_row: AtomicU64,
    decisions_public_row: AtomicU64,
    decisions_ancestor_walk: AtomicU64,
    decisions_no_grant: AtomicU64,
    memo_hits: AtomicU64,
    sweep_runs: AtomicU64,
    sweep_failures: AtomicU64,
    sweep_rows_removed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.request_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.request_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.request_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_total(&self) -> u64 {
        self.request_total.load(Ordering::Relaxed)
    }

    pub fn request_success(&self) -> u64 {
        self.request_success.load(Ordering::Relaxed)
    }

    pub fn request_error(&self) -> u64 {
        self.request_error.load(Ordering::Relaxed)
    }

    pub fn record_check(&self, result: &CheckResult) {
        if result.allowed {
            self.checks_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checks_denied.fetch_add(1, Ordering::Relaxed);
        }
        if result.from_memo {
            self.memo_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.decision_counter(result.source)
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn checks_allowed(&self) -> u64 {
        self.checks_allowed.load(Ordering::Relaxed)
    }

    pub fn checks_denied(&self) -> u64 {
        self.checks_denied.load(Ordering::Relaxed)
    }

    pub fn decisions(&self, source: DecisionSource) -> u64 {
        self.decision_counter(source).load(Ordering::Relaxed)
    }

    pub fn memo_hits(&self) -> u64 {
        self.memo_hits.load(Ordering::Relaxed)
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweep_runs.fetch_add(1, Ordering::Relaxed);
        self.sweep_rows_removed
            .fetch_add(report.removed() as u64, Ordering::Relaxed);
    }

    pub fn record_sweep_failure(&self) {
        self.sweep_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_runs(&self) -> u64 {
        self.sweep_runs.load(Ordering::Relaxed)
    }

    pub fn sweep_failures(&self) -> u64 {
        self.sweep_failures.load(Ordering::Relaxed)
    }

    pub fn sweep_rows_removed(&self) -> u64 {
        self.sweep_rows_removed.load(Ordering::Relaxed)
    }

    fn decision_counter(&self, source: DecisionSource) -> &AtomicU64 {
        match source {
            DecisionSource::Owner => &self.decisions_owner,
            DecisionSource::UserRow => &self.decisions_user_row,
            DecisionSource::PublicRow => &self.decisions_public_row,
            DecisionSource::AncestorWalk => &self.decisions_ancestor_walk,
            DecisionSource::NoGrant => &self.decisions_no_grant,
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();
        counter(
            &mut output,
            "canopy_requests_total",
            "Total number of requests.",
            self.request_total(),
        );
        counter(
            &mut output,
            "canopy_requests_success_total",
            "Total successful requests.",
            self.request_success(),
        );
        counter(
            &mut output,
            "canopy_requests_error_total",
            "Total failed requests.",
            self.request_error(),
        );
        counter(
            &mut output,
            "canopy_checks_allowed_total",
            "Permission checks that allowed access.",
            self.checks_allowed(),
        );
        counter(
            &mut output,
            "canopy_checks_denied_total",
            "Permission checks that denied access.",
            self.checks_denied(),
        );

        output.push_str(
            "# HELP canopy_check_decisions_total Permission checks by the step that decided them.\n",
        );
        output.push_str("# TYPE canopy_check_decisions_total counter\n");
        for source in [
            DecisionSource::Owner,
            DecisionSource::UserRow,
            DecisionSource::PublicRow,
            DecisionSource::AncestorWalk,
            DecisionSource::NoGrant,
        ] {
            let _ = writeln!(
                output,
                "canopy_check_decisions_total{{source=\"{source}\"}} {}",
                self.decisions(source)
            );
        }

        counter(
            &mut output,
            "canopy_check_memo_hits_total",
            "Checks answered from the request memo.",
            self.memo_hits(),
        );
        counter(
            &mut output,
            "canopy_sweep_runs_total",
            "Completed cache sweeps.",
            self.sweep_runs(),
        );
        counter(
            &mut output,
            "canopy_sweep_failures_total",
            "Cache sweeps that failed.",
            self.sweep_failures(),
        );
        counter(
            &mut output,
            "canopy_sweep_rows_removed_total",
            "Orphaned cache rows removed by the sweep.",
            self.sweep_rows_removed(),
        );
        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

pub async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}
