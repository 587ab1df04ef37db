use crate::traits::{OrphanReason, PermissionCacheStore, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows that looked orphaned when the sweep started.
    pub candidates: usize,
    pub missing_creative: usize,
    pub missing_user: usize,
    pub missing_share: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.missing_creative + self.missing_user + self.missing_share
    }

    fn record(&mut self, reason: OrphanReason) {
        match reason {
            OrphanReason::MissingCreative => self.missing_creative += 1,
            OrphanReason::MissingUser => self.missing_user += 1,
            OrphanReason::MissingShare => self.missing_share += 1,
        }
    }
}

/// Deletes cache rows whose creative, user or source share no longer exists.
///
/// Each delete re-checks the orphan condition, so rows repaired between the
/// scan and the delete survive. Public rows are judged like any other row;
/// a null user is never a reason on its own.
pub async fn run_sweep_cycle<S: PermissionCacheStore>(
    store: &S,
) -> Result<SweepReport, StorageError> {
    let candidates = store.orphan_candidates().await?;
    let mut report = SweepReport {
        candidates: candidates.len(),
        ..SweepReport::default()
    };

    for key in &candidates {
        if let Some(reason) = store.delete_cache_row_if_orphaned(key).await? {
            report.record(reason);
        }
    }

    if report.removed() > 0 {
        tracing::info!(
            removed = report.removed(),
            missing_creative = report.missing_creative,
            missing_user = report.missing_user,
            missing_share = report.missing_share,
            "permission cache sweep removed orphaned rows"
        );
    }

    Ok(report)
}
