//! Role model - organization-scoped roles with permission mappings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Role entity. Inheritable roles propagate to descendant organizations.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub is_assignable: bool,
    pub is_inheritable: bool,
    pub priority: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a role.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoleRequest {
    pub organization_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_assignable: bool,
    #[serde(default)]
    pub is_inheritable: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Compact role reference embedded in token payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub id: Uuid,
    pub name: String,
    pub is_inheritable: bool,
}

/// User-role assignment. Revocation is soft (`is_active = false` plus
/// revocation metadata); expiry is enforced by the maintenance sweep and by
/// every resolution query.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRole {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub organization_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub conditions: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl UserRole {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}
