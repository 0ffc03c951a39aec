//! Data models for the authorization server.
//!
//! PostgreSQL-backed models following the `authz` schema:
//! - Organization tree with materialized ltree paths
//! - Organization-scoped roles and `resource:action` permissions
//! - Soft-revocable, expirable user-role assignments
//! - Token blacklist with blanket emergency markers
//! - Immutable, monthly-partitioned audit events

pub mod audit_event;
pub mod blacklist;
pub mod membership;
pub mod organization;
pub mod permission;
pub mod role;
pub mod user;

// Re-export main types for convenience
pub use audit_event::{
    AuditCategory, AuditEvent, AuditEventFilter, AuditResult, ClientContext, SecurityEventSummary,
    SuspiciousActivity,
};
pub use blacklist::{emergency_jti, BlacklistStatus, TokenBlacklistEntry, EMERGENCY_JTI_PREFIX};
pub use membership::OrganizationMembership;
pub use organization::{
    path_segment, CreateOrganizationRequest, CreatedOrganization, HierarchyNode, Organization,
    UserOrganization, ADMIN_ORG_ID, ADMIN_ORG_PATH,
};
pub use permission::{Permission, PermissionCheck, ResolvedPermission};
pub use role::{CreateRoleRequest, Role, RoleRef, UserRole};
pub use user::{NewUser, User};
