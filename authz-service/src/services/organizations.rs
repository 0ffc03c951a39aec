//! Organization resolver.
//!
//! Maintains the tree with Admin as the forced root: creation under a
//! parent, atomic subtree moves, soft deletion, and the listing/access
//! queries used by the coordinator.

use authz_core::error::AuthzError;
use uuid::Uuid;

use crate::models::{
    AuditCategory, AuditResult, ClientContext, CreateOrganizationRequest, CreatedOrganization,
    HierarchyNode, Organization, UserOrganization,
};
use crate::services::audit::AuditService;
use crate::services::database::Database;

/// Organization service.
#[derive(Clone)]
pub struct OrganizationService {
    db: Database,
    audit: AuditService,
}

impl OrganizationService {
    pub fn new(db: Database, audit: AuditService) -> Self {
        Self { db, audit }
    }

    /// Create an organization. The path is deterministic from the parent
    /// path and the sanitized name; conflicts are reported, never renamed.
    pub async fn create(
        &self,
        req: &CreateOrganizationRequest,
        created_by: Option<Uuid>,
        ctx: &ClientContext,
    ) -> Result<CreatedOrganization, AuthzError> {
        let created = self.db.create_organization(req, created_by).await?;

        self.audit
            .log_best_effort(
                "ORGANIZATION_CREATED",
                AuditCategory::Administration,
                created_by,
                Some(created.id),
                Some(&created.path),
                Some("create"),
                AuditResult::Success,
                serde_json::json!({ "name": created.name, "path": created.path }),
                ctx,
            )
            .await;

        Ok(created)
    }

    /// Move a subtree under a new parent. The stored operation
    /// short-circuits a same-parent move; the pre-read here captures the old
    /// path for the audit record and keeps that no-op free of audit noise.
    pub async fn move_organization(
        &self,
        org_id: Uuid,
        new_parent_id: Uuid,
        moved_by: Option<Uuid>,
        ctx: &ClientContext,
    ) -> Result<bool, AuthzError> {
        let before = self
            .db
            .find_organization_by_id(org_id)
            .await?
            .ok_or(AuthzError::OrganizationNotFound)?;
        let is_noop = before.parent_id == Some(new_parent_id);

        let moved = self
            .db
            .move_organization(org_id, new_parent_id, moved_by)
            .await?;

        if moved && !is_noop {
            self.audit
                .log_best_effort(
                    "ORGANIZATION_MOVED",
                    AuditCategory::Administration,
                    moved_by,
                    Some(org_id),
                    Some(&before.path),
                    Some("move"),
                    AuditResult::Success,
                    serde_json::json!({
                        "old_path": before.path,
                        "new_parent_id": new_parent_id,
                    }),
                    ctx,
                )
                .await;
        }

        Ok(moved)
    }

    /// Soft-delete an organization subtree.
    pub async fn deactivate(
        &self,
        org_id: Uuid,
        updated_by: Option<Uuid>,
        ctx: &ClientContext,
    ) -> Result<bool, AuthzError> {
        let deactivated = self.db.deactivate_organization(org_id, updated_by).await?;

        if deactivated {
            self.audit
                .log_best_effort(
                    "ORGANIZATION_DEACTIVATED",
                    AuditCategory::Administration,
                    updated_by,
                    Some(org_id),
                    None,
                    Some("deactivate"),
                    AuditResult::Success,
                    serde_json::json!({}),
                    ctx,
                )
                .await;
        }

        Ok(deactivated)
    }

    pub async fn find_by_id(&self, org_id: Uuid) -> Result<Option<Organization>, AuthzError> {
        self.db.find_organization_by_id(org_id).await
    }

    /// Subtree listing in stable path order.
    pub async fn hierarchy(
        &self,
        user_id: Option<Uuid>,
        root_id: Option<Uuid>,
        max_depth: Option<i32>,
        include_inactive: bool,
    ) -> Result<Vec<HierarchyNode>, AuthzError> {
        self.db
            .get_organization_hierarchy(user_id, root_id, max_depth, include_inactive)
            .await
    }

    /// Direct memberships plus organizations reachable through inheritable
    /// ancestor roles, de-duplicated.
    pub async fn list_user_organizations(
        &self,
        user_id: Uuid,
        include_inherited: bool,
    ) -> Result<Vec<UserOrganization>, AuthzError> {
        self.db
            .get_user_organizations(user_id, include_inherited)
            .await
    }

    pub async fn user_has_access(&self, user_id: Uuid, org_id: Uuid) -> Result<bool, AuthzError> {
        self.db.user_has_organization_access(user_id, org_id).await
    }
}

/// Pick the organization a login lands in: the primary membership when one
/// exists, otherwise the first direct membership by name.
pub fn pick_login_organization(organizations: &[UserOrganization]) -> Option<&UserOrganization> {
    let direct: Vec<&UserOrganization> = organizations
        .iter()
        .filter(|o| o.access_source == "direct")
        .collect();

    direct
        .iter()
        .find(|o| o.is_primary)
        .copied()
        .or_else(|| direct.iter().min_by(|a, b| a.name.cmp(&b.name)).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(name: &str, is_primary: bool, source: &str) -> UserOrganization {
        UserOrganization {
            organization_id: Uuid::new_v4(),
            name: name.to_string(),
            display_name: None,
            path: format!("admin.{}", name),
            is_primary,
            membership_status: Some("active".to_string()),
            joined_at: None,
            access_source: source.to_string(),
        }
    }

    #[test]
    fn test_pick_prefers_primary() {
        let orgs = vec![
            org("zeta", false, "direct"),
            org("acme", true, "direct"),
            org("beta", false, "direct"),
        ];
        assert_eq!(pick_login_organization(&orgs).unwrap().name, "acme");
    }

    #[test]
    fn test_pick_falls_back_to_first_by_name() {
        let orgs = vec![
            org("zeta", false, "direct"),
            org("beta", false, "direct"),
        ];
        assert_eq!(pick_login_organization(&orgs).unwrap().name, "beta");
    }

    #[test]
    fn test_pick_ignores_inherited_access() {
        let orgs = vec![
            org("aaa", false, "inherited"),
            org("zzz", false, "direct"),
        ];
        assert_eq!(pick_login_organization(&orgs).unwrap().name, "zzz");
    }

    #[test]
    fn test_pick_empty_is_none() {
        assert!(pick_login_organization(&[]).is_none());
    }
}
