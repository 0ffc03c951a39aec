//! Permission engine.
//!
//! Resolution itself runs in `authz.resolve_user_permissions`, which owns
//! the precedence rules (direct beats inherited, then role priority, then
//! earliest grant) and the glob-to-LIKE pattern filter. This layer adds
//! wildcard matching for held permissions and the audit trail for checks.

use authz_core::error::AuthzError;
use uuid::Uuid;

use crate::models::{AuditCategory, AuditResult, ClientContext, PermissionCheck, ResolvedPermission};
use crate::services::audit::AuditService;
use crate::services::database::Database;

/// True when a held permission string covers a required one. A held segment
/// of `*` matches any required segment, so `repos:*` grants every repos
/// action and `*:*` grants everything.
pub fn permission_matches(held: &str, required: &str) -> bool {
    if held == required || held == "*" {
        return true;
    }

    let mut held_parts = held.splitn(2, ':');
    let mut required_parts = required.splitn(2, ':');

    let (h_res, h_act) = (held_parts.next(), held_parts.next());
    let (r_res, r_act) = (required_parts.next(), required_parts.next());

    match (h_res, h_act, r_res, r_act) {
        (Some(hr), Some(ha), Some(rr), Some(ra)) => {
            (hr == "*" || hr == rr) && (ha == "*" || ha == ra)
        }
        _ => false,
    }
}

/// Permission resolution service.
#[derive(Clone)]
pub struct PermissionService {
    db: Database,
    audit: AuditService,
}

impl PermissionService {
    pub fn new(db: Database, audit: AuditService) -> Self {
        Self { db, audit }
    }

    /// Resolve the effective permission set with provenance.
    pub async fn resolve(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        include_inherited: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<ResolvedPermission>, AuthzError> {
        self.db
            .resolve_user_permissions(user_id, org_id, include_inherited, pattern)
            .await
    }

    /// Single permission check. A missing permission is a `false` answer,
    /// never an error. Writes one PERMISSION_CHECK audit event when `audit`
    /// is set; audit failures are swallowed.
    pub async fn check(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permission: &str,
        audit: bool,
        ctx: &ClientContext,
    ) -> Result<bool, AuthzError> {
        let allowed = self.db.check_user_permission(user_id, org_id, permission).await?;

        if audit {
            self.audit
                .log_best_effort(
                    "PERMISSION_CHECK",
                    AuditCategory::Authorization,
                    Some(user_id),
                    Some(org_id),
                    None,
                    Some(permission),
                    if allowed {
                        AuditResult::Success
                    } else {
                        AuditResult::Failure
                    },
                    serde_json::json!({ "permission": permission, "allowed": allowed }),
                    ctx,
                )
                .await;
        }

        Ok(allowed)
    }

    /// Bulk check: the resolved set is computed once, and exactly one
    /// PERMISSION_CHECK audit event covers the whole batch.
    pub async fn check_bulk(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permissions: &[String],
        audit: bool,
        ctx: &ClientContext,
    ) -> Result<Vec<PermissionCheck>, AuthzError> {
        let checks = self
            .db
            .check_user_permissions_bulk(user_id, org_id, permissions)
            .await?;

        if audit {
            let all_allowed = checks.iter().all(|c| c.has_permission);
            self.audit
                .log_best_effort(
                    "PERMISSION_CHECK",
                    AuditCategory::Authorization,
                    Some(user_id),
                    Some(org_id),
                    None,
                    None,
                    if all_allowed {
                        AuditResult::Success
                    } else {
                        AuditResult::Failure
                    },
                    serde_json::json!({
                        "permissions": permissions,
                        "results": checks
                            .iter()
                            .map(|c| serde_json::json!({
                                "permission": c.permission,
                                "has_permission": c.has_permission,
                            }))
                            .collect::<Vec<_>>(),
                    }),
                    ctx,
                )
                .await;
        }

        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_matches_exact() {
        assert!(permission_matches("repos:read", "repos:read"));
        assert!(!permission_matches("repos:read", "repos:write"));
        assert!(!permission_matches("repos:read", "billing:read"));
    }

    #[test]
    fn test_permission_matches_wildcards() {
        assert!(permission_matches("repos:*", "repos:read"));
        assert!(permission_matches("repos:*", "repos:delete"));
        assert!(!permission_matches("repos:*", "billing:read"));
        assert!(permission_matches("*:read", "repos:read"));
        assert!(!permission_matches("*:read", "repos:write"));
        assert!(permission_matches("*:*", "anything:at_all"));
        assert!(permission_matches("*", "anything:at_all"));
    }

    #[test]
    fn test_permission_matches_requires_both_segments() {
        assert!(!permission_matches("repos", "repos:read"));
        assert!(!permission_matches("repos:read", "repos"));
    }
}
