//! PostgreSQL database service.
//!
//! Thin wrapper over the stored operations in the `authz` schema. Invariants
//! are enforced at the storage boundary; this layer maps AZ-prefixed
//! SQLSTATEs onto the error taxonomy.

use authz_core::error::AuthzError;
use chrono::{DateTime, Datelike, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::models::{
    AuditEvent, AuditEventFilter, CreateOrganizationRequest, CreateRoleRequest,
    CreatedOrganization, HierarchyNode, NewUser, Organization, PermissionCheck,
    ResolvedPermission, Role, SecurityEventSummary, SuspiciousActivity, TokenBlacklistEntry, User,
    UserOrganization,
};

const ORGANIZATION_COLUMNS: &str = "id, name, display_name, description, parent_id, \
     path::text AS path, metadata, is_active, created_at, updated_at, created_by, updated_by";

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Map a database error onto the taxonomy. Stored operations raise
/// AZ-prefixed SQLSTATEs for typed failures; constraint violations come back
/// with the standard 23xxx class.
fn map_db_err(e: sqlx::Error) -> AuthzError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("AZ001") => return AuthzError::UserNotFoundInRbac,
            Some("AZ002") => return AuthzError::OrganizationNotFoundInRbac,
            Some("AZ003") => {
                return AuthzError::OrganizationPathInvalid(db.message().to_string())
            }
            Some("AZ004") => {
                return AuthzError::OrganizationPathInvalid(db.message().to_string())
            }
            Some("AZ005") => return AuthzError::OrganizationNotFoundInRbac,
            Some("AZ006") | Some("AZ007") | Some("AZ008") => {
                return AuthzError::ConstraintViolation(db.message().to_string())
            }
            Some("AZ009") => return AuthzError::RoleNotFound,
            Some("AZ010") => {
                return AuthzError::OrganizationPathInvalid(db.message().to_string())
            }
            Some(code) if code.starts_with("23") => {
                return AuthzError::ConstraintViolation(db.message().to_string())
            }
            _ => {}
        }
    }

    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AuthzError::ConnectionFailed(anyhow::anyhow!(e))
        }
        other => AuthzError::QueryFailed(anyhow::anyhow!(other)),
    }
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), AuthzError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AuthzError::ConnectionFailed(anyhow::anyhow!(e))
            })?;
        Ok(())
    }

    // ==================== Organization Operations ====================

    /// Seed the Admin root organization. Idempotent.
    pub async fn ensure_admin_organization(&self) -> Result<Uuid, AuthzError> {
        sqlx::query_scalar("SELECT authz.ensure_admin_organization()")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Create an organization under its parent (Admin when unspecified).
    /// Tree writes run under repeatable read so a concurrent subtree rewrite
    /// cannot interleave.
    pub async fn create_organization(
        &self,
        req: &CreateOrganizationRequest,
        created_by: Option<Uuid>,
    ) -> Result<CreatedOrganization, AuthzError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        let created = sqlx::query_as::<_, CreatedOrganization>(
            "SELECT id, name, path, created_at \
             FROM authz.create_organization($1, $2, $3, $4, $5, $6)",
        )
        .bind(&req.name)
        .bind(&req.display_name)
        .bind(&req.description)
        .bind(req.parent_id)
        .bind(created_by)
        .bind(&req.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit()
            .await
            .map_err(|e| AuthzError::TransactionFailed(anyhow::anyhow!(e)))?;
        Ok(created)
    }

    /// Atomically move a subtree under a new parent. Returns true on success
    /// (including the no-op case of moving to the current parent).
    pub async fn move_organization(
        &self,
        org_id: Uuid,
        new_parent_id: Uuid,
        moved_by: Option<Uuid>,
    ) -> Result<bool, AuthzError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        let moved: bool = sqlx::query_scalar("SELECT authz.move_organization($1, $2, $3)")
            .bind(org_id)
            .bind(new_parent_id)
            .bind(moved_by)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;

        tx.commit()
            .await
            .map_err(|e| AuthzError::TransactionFailed(anyhow::anyhow!(e)))?;
        Ok(moved)
    }

    /// Soft-delete an organization subtree.
    pub async fn deactivate_organization(
        &self,
        org_id: Uuid,
        updated_by: Option<Uuid>,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.deactivate_organization($1, $2)")
            .bind(org_id)
            .bind(updated_by)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Find an organization by id. Inactive rows are invisible.
    pub async fn find_organization_by_id(
        &self,
        org_id: Uuid,
    ) -> Result<Option<Organization>, AuthzError> {
        sqlx::query_as::<_, Organization>(&format!(
            "SELECT {} FROM authz.organizations WHERE id = $1 AND is_active",
            ORGANIZATION_COLUMNS
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)
    }

    /// Organization subtree in stable path order.
    pub async fn get_organization_hierarchy(
        &self,
        user_id: Option<Uuid>,
        root_id: Option<Uuid>,
        max_depth: Option<i32>,
        include_inactive: bool,
    ) -> Result<Vec<HierarchyNode>, AuthzError> {
        sqlx::query_as::<_, HierarchyNode>(
            "SELECT id, name, display_name, path, level, parent_id, has_access, \
                    member_count, role_count, is_direct_member \
             FROM authz.get_organization_hierarchy($1, $2, $3, $4)",
        )
        .bind(user_id)
        .bind(root_id)
        .bind(max_depth)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    /// True iff the user has a direct membership or an inheritable role on
    /// an ancestor.
    pub async fn user_has_organization_access(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.user_has_organization_access($1, $2)")
            .bind(user_id)
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Direct memberships plus, optionally, organizations reachable via
    /// inheritable ancestor roles.
    pub async fn get_user_organizations(
        &self,
        user_id: Uuid,
        include_inherited: bool,
    ) -> Result<Vec<UserOrganization>, AuthzError> {
        sqlx::query_as::<_, UserOrganization>(
            "SELECT organization_id, name, display_name, path, is_primary, \
                    membership_status, joined_at, access_source \
             FROM authz.get_user_organizations($1, $2)",
        )
        .bind(user_id)
        .bind(include_inherited)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    // ==================== User Operations ====================

    /// Find user by internal ID.
    pub async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, AuthzError> {
        sqlx::query_as::<_, User>("SELECT * FROM authz.users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Find user by the identity provider's stable id.
    pub async fn find_user_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<User>, AuthzError> {
        sqlx::query_as::<_, User>("SELECT * FROM authz.users WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Insert a new user provisioned from an IdP profile.
    pub async fn insert_user(&self, user: &NewUser) -> Result<User, AuthzError> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO authz.users (external_id, email, first_name, last_name, profile_picture_url, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&user.external_id)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.profile_picture_url)
        .bind(&user.source)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    // ==================== Membership Operations ====================

    pub async fn add_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        is_primary: bool,
        membership_type: Option<&str>,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.add_membership($1, $2, $3, $4)")
            .bind(user_id)
            .bind(org_id)
            .bind(is_primary)
            .bind(membership_type)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn set_primary_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.set_primary_membership($1, $2)")
            .bind(user_id)
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn set_membership_status(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        status: &str,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT COALESCE(authz.set_membership_status($1, $2, $3), FALSE)")
            .bind(user_id)
            .bind(org_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    // ==================== Permission Resolution ====================

    /// Effective permissions for (user, organization) with provenance.
    pub async fn resolve_user_permissions(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        include_inherited: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<ResolvedPermission>, AuthzError> {
        sqlx::query_as::<_, ResolvedPermission>(
            "SELECT permission, role_id, role_name, is_inheritable, source, \
                    priority, granted_at, expires_at, conditions \
             FROM authz.resolve_user_permissions($1, $2, $3, $4) \
             ORDER BY permission",
        )
        .bind(user_id)
        .bind(org_id)
        .bind(include_inherited)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    /// Boolean check; always agrees with `resolve_user_permissions`.
    pub async fn check_user_permission(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.check_user_permission($1, $2, $3)")
            .bind(user_id)
            .bind(org_id)
            .bind(permission)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Resolve once, answer one row per requested permission.
    pub async fn check_user_permissions_bulk(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permissions: &[String],
    ) -> Result<Vec<PermissionCheck>, AuthzError> {
        sqlx::query_as::<_, PermissionCheck>(
            "SELECT permission, has_permission \
             FROM authz.check_user_permissions_bulk($1, $2, $3)",
        )
        .bind(user_id)
        .bind(org_id)
        .bind(permissions)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    // ==================== Role Operations ====================

    pub async fn create_role(&self, req: &CreateRoleRequest) -> Result<Uuid, AuthzError> {
        sqlx::query_scalar(
            "SELECT authz.create_role($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(req.organization_id)
        .bind(&req.name)
        .bind(&req.display_name)
        .bind(&req.description)
        .bind(req.is_assignable)
        .bind(req.is_inheritable)
        .bind(req.priority)
        .bind(&req.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    pub async fn deactivate_role(&self, role_id: Uuid) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT COALESCE(authz.deactivate_role($1), FALSE)")
            .bind(role_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn list_roles(&self, org_id: Uuid) -> Result<Vec<Role>, AuthzError> {
        sqlx::query_as::<_, Role>(
            "SELECT * FROM authz.roles WHERE organization_id = $1 AND is_active ORDER BY name",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    pub async fn add_permission_to_role(
        &self,
        role_id: Uuid,
        permission: &str,
        granted_by: Option<Uuid>,
        conditions: &serde_json::Value,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.add_permission_to_role($1, $2, $3, $4)")
            .bind(role_id)
            .bind(permission)
            .bind(granted_by)
            .bind(conditions)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn remove_permission_from_role(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT COALESCE(authz.remove_permission_from_role($1, $2), FALSE)")
            .bind(role_id)
            .bind(permission)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    // ==================== User-Role Assignments ====================

    #[allow(clippy::too_many_arguments)]
    pub async fn assign_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        org_id: Uuid,
        granted_by: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
        conditions: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> Result<Uuid, AuthzError> {
        sqlx::query_scalar("SELECT authz.assign_user_role($1, $2, $3, $4, $5, $6, $7)")
            .bind(user_id)
            .bind(role_id)
            .bind(org_id)
            .bind(granted_by)
            .bind(expires_at)
            .bind(conditions)
            .bind(metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn revoke_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        org_id: Uuid,
        revoked_by: Option<Uuid>,
        reason: Option<&str>,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT COALESCE(authz.revoke_user_role($1, $2, $3, $4, $5), FALSE)")
            .bind(user_id)
            .bind(role_id)
            .bind(org_id)
            .bind(revoked_by)
            .bind(reason)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Deactivate assignments whose expiry has passed; returns the count.
    pub async fn expire_user_roles(&self) -> Result<i32, AuthzError> {
        sqlx::query_scalar("SELECT authz.expire_user_roles()")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    // ==================== Token Blacklist ====================

    #[allow(clippy::too_many_arguments)]
    pub async fn blacklist_token(
        &self,
        jti: &str,
        user_id: Option<Uuid>,
        org_id: Option<Uuid>,
        revoked_by: Option<Uuid>,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AuthzError> {
        sqlx::query_scalar(
            "SELECT authz.blacklist_token($1, $2, $3, $4, $5, $6, '{}'::jsonb)",
        )
        .bind(jti)
        .bind(user_id)
        .bind(org_id)
        .bind(revoked_by)
        .bind(reason)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    pub async fn is_token_blacklisted(&self, jti: &str) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.is_token_blacklisted($1)")
            .bind(jti)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn is_user_emergency_revoked(&self, user_id: Uuid) -> Result<bool, AuthzError> {
        sqlx::query_scalar("SELECT authz.is_user_emergency_revoked($1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn find_blacklist_entry(
        &self,
        jti: &str,
    ) -> Result<Option<TokenBlacklistEntry>, AuthzError> {
        sqlx::query_as::<_, TokenBlacklistEntry>(
            "SELECT * FROM authz.token_blacklist WHERE jti = $1 AND expires_at > now()",
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)
    }

    /// Blanket revocation for a user; returns active blacklist entries for
    /// that user, marker included.
    pub async fn emergency_revoke_user_tokens(
        &self,
        user_id: Uuid,
        revoked_by: Option<Uuid>,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i32, AuthzError> {
        sqlx::query_scalar("SELECT authz.emergency_revoke_user_tokens($1, $2, $3, $4)")
            .bind(user_id)
            .bind(revoked_by)
            .bind(reason)
            .bind(expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn cleanup_expired_tokens(&self) -> Result<i32, AuthzError> {
        sqlx::query_scalar("SELECT authz.cleanup_expired_tokens()")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    // ==================== Audit ====================

    #[allow(clippy::too_many_arguments)]
    pub async fn log_audit_event(
        &self,
        event_type: &str,
        event_category: &str,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        action: Option<&str>,
        result: &str,
        details: &serde_json::Value,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        session_id: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Uuid, AuthzError> {
        sqlx::query_scalar(
            "SELECT authz.log_audit_event($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(event_type)
        .bind(event_category)
        .bind(user_id)
        .bind(organization_id)
        .bind(resource_type)
        .bind(resource_id)
        .bind(action)
        .bind(result)
        .bind(details)
        .bind(ip_address)
        .bind(user_agent)
        .bind(session_id)
        .bind(request_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    /// Time-ranged, filtered audit query, newest first.
    pub async fn get_audit_events(
        &self,
        filter: &AuditEventFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AuthzError> {
        sqlx::query_as::<_, AuditEvent>(
            "SELECT id, event_type, event_category, user_id, organization_id, \
                    resource_type, resource_id, action, result, details, \
                    ip_address, user_agent, session_id, request_id, occurred_at \
             FROM authz.audit_events \
             WHERE ($1::text IS NULL OR event_category = $1) \
               AND ($2::text IS NULL OR event_type = $2) \
               AND ($3::uuid IS NULL OR user_id = $3) \
               AND ($4::uuid IS NULL OR organization_id = $4) \
               AND ($5::text IS NULL OR result = $5) \
               AND ($6::timestamptz IS NULL OR occurred_at >= $6) \
               AND ($7::timestamptz IS NULL OR occurred_at < $7) \
             ORDER BY occurred_at DESC \
             LIMIT $8 OFFSET $9",
        )
        .bind(filter.event_category.map(|c| c.as_str()))
        .bind(&filter.event_type)
        .bind(filter.user_id)
        .bind(filter.organization_id)
        .bind(filter.result.map(|r| r.as_str()))
        .bind(filter.from)
        .bind(filter.until)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    pub async fn get_security_events_summary(
        &self,
        window_minutes: i32,
    ) -> Result<Vec<SecurityEventSummary>, AuthzError> {
        sqlx::query_as::<_, SecurityEventSummary>(
            "SELECT event_category, event_type, result, event_count \
             FROM authz.get_security_events_summary($1)",
        )
        .bind(window_minutes)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    pub async fn detect_suspicious_activity(
        &self,
        window_minutes: i32,
        failure_threshold: i32,
    ) -> Result<Vec<SuspiciousActivity>, AuthzError> {
        sqlx::query_as::<_, SuspiciousActivity>(
            "SELECT pattern, user_id, ip_address, event_count, organization_count, \
                    first_seen, last_seen \
             FROM authz.detect_suspicious_activity($1, $2)",
        )
        .bind(window_minutes)
        .bind(failure_threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    // ==================== Maintenance ====================

    /// Rebuild the direct-grant projection without blocking readers.
    /// CONCURRENTLY cannot run inside a transaction, so this is a direct
    /// statement rather than a stored operation.
    pub async fn refresh_permission_projection(&self) -> Result<(), AuthzError> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY authz.direct_permission_grants")
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    /// Provision audit partitions for the current and next month.
    pub async fn ensure_audit_partitions(&self) -> Result<(), AuthzError> {
        let first_of_month = Utc::now()
            .date_naive()
            .with_day(1)
            .unwrap_or_else(|| Utc::now().date_naive());
        let next_month = if first_of_month.month() == 12 {
            first_of_month
                .with_year(first_of_month.year() + 1)
                .and_then(|d| d.with_month(1))
        } else {
            first_of_month.with_month(first_of_month.month() + 1)
        }
        .unwrap_or(first_of_month);

        for month in [first_of_month, next_month] {
            sqlx::query("SELECT authz.ensure_audit_partition($1)")
                .bind(month)
                .execute(&self.pool)
                .await
                .map_err(map_db_err)?;
        }
        Ok(())
    }
}
