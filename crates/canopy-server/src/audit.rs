use canopy_core::model::audience_label;
use canopy_core::{Creative, CreativeId, Permission, Share, TenantId, UserId};
use canopy_storage::SweepReport;

pub fn audit_share_granted(tenant_id: &TenantId, share: &Share) {
    tracing::info!(
        target: "audit",
        event = "share_granted",
        tenant_id = %tenant_id,
        share_id = %share.id,
        creative_id = %share.creative_id,
        audience = %audience_label(share.user_id.as_ref()),
        permission = share.permission.as_str(),
        shared_by = %share.shared_by_id,
        "share granted"
    );
}

pub fn audit_share_changed(tenant_id: &TenantId, share: &Share, actor: &UserId) {
    tracing::info!(
        target: "audit",
        event = "share_changed",
        tenant_id = %tenant_id,
        share_id = %share.id,
        creative_id = %share.creative_id,
        permission = share.permission.as_str(),
        actor = %actor,
        "share changed"
    );
}

pub fn audit_share_revoked(tenant_id: &TenantId, share: &Share, actor: &UserId) {
    tracing::info!(
        target: "audit",
        event = "share_revoked",
        tenant_id = %tenant_id,
        share_id = %share.id,
        creative_id = %share.creative_id,
        audience = %audience_label(share.user_id.as_ref()),
        actor = %actor,
        "share revoked"
    );
}

pub fn audit_creative_moved(tenant_id: &TenantId, creative: &Creative, actor: &UserId) {
    tracing::info!(
        target: "audit",
        event = "creative_moved",
        tenant_id = %tenant_id,
        creative_id = %creative.id,
        parent_id = creative.parent_id.map(|p| p.to_string()).unwrap_or_default(),
        actor = %actor,
        "creative moved"
    );
}

pub fn audit_creative_deleted(
    tenant_id: &TenantId,
    creative_id: &CreativeId,
    deleted_count: usize,
    actor: &UserId,
) {
    tracing::info!(
        target: "audit",
        event = "creative_deleted",
        tenant_id = %tenant_id,
        creative_id = %creative_id,
        deleted_count = deleted_count,
        actor = %actor,
        "creative deleted"
    );
}

pub fn audit_user_deleted(tenant_id: &TenantId, user_id: &UserId) {
    tracing::info!(
        target: "audit",
        event = "user_deleted",
        tenant_id = %tenant_id,
        user_id = %user_id,
        "user deleted"
    );
}

pub fn audit_access_denied(
    tenant_id: &TenantId,
    actor: Option<&UserId>,
    creative_id: &CreativeId,
    required: Permission,
    operation: &str,
) {
    tracing::warn!(
        target: "audit",
        event = "access_denied",
        tenant_id = %tenant_id,
        actor = %audience_label(actor),
        creative_id = %creative_id,
        required = required.as_str(),
        operation = operation,
        "access denied"
    );
}

pub fn audit_sweep(tenant_id: &TenantId, report: &SweepReport) {
    tracing::info!(
        target: "audit",
        event = "cache_sweep",
        tenant_id = %tenant_id,
        removed = report.removed(),
        missing_creative = report.missing_creative,
        missing_user = report.missing_user,
        missing_share = report.missing_share,
        "permission cache swept"
    );
}
