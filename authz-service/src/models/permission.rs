//! Permission model - `resource:action` strings and resolved grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Catalog entry. Invariant: `permission == resource + ':' + action`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub id: Uuid,
    pub permission: String,
    pub resource: String,
    pub action: String,
    pub category: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

/// One row of `authz.resolve_user_permissions`: an effective permission with
/// provenance. `source` is `direct` or `inherited`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResolvedPermission {
    pub permission: String,
    pub role_id: Uuid,
    pub role_name: String,
    pub is_inheritable: bool,
    pub source: String,
    pub priority: i32,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: serde_json::Value,
}

impl ResolvedPermission {
    pub fn is_inherited(&self) -> bool {
        self.source == "inherited"
    }
}

/// One row of `authz.check_user_permissions_bulk`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PermissionCheck {
    pub permission: String,
    pub has_permission: bool,
}
