//! Organization model - hierarchical tree rooted at the Admin organization.

use authz_core::error::AuthzError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Fixed id of the Admin root organization.
pub const ADMIN_ORG_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0001);

/// Path of the Admin root organization.
pub const ADMIN_ORG_PATH: &str = "admin";

/// Organization entity. `path` is the materialized dot-delimited hierarchy
/// (ltree in PostgreSQL, selected as text).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub metadata: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
}

impl Organization {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Number of segments in the materialized path.
    pub fn depth(&self) -> usize {
        self.path.split('.').count()
    }
}

/// Compute the path segment for an organization name: lowercased, with every
/// non-alphanumeric run replaced by underscores. Mirrors
/// `authz.sanitize_path_segment`.
pub fn path_segment(name: &str) -> Result<String, AuthzError> {
    let segment: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if !segment.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Err(AuthzError::OrganizationPathInvalid(format!(
            "name {:?} yields an empty path segment",
            name
        )));
    }
    Ok(segment)
}

/// Request to create an organization. A missing parent means the Admin root.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Row returned by `authz.create_organization`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreatedOrganization {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// Row of `authz.get_organization_hierarchy`, ordered by path.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HierarchyNode {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub path: String,
    pub level: i32,
    pub parent_id: Option<Uuid>,
    pub has_access: bool,
    pub member_count: i64,
    pub role_count: i64,
    pub is_direct_member: bool,
}

/// Row of `authz.get_user_organizations`: a direct membership or an
/// organization reachable through an inheritable ancestor role.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserOrganization {
    pub organization_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub path: String,
    pub is_primary: bool,
    pub membership_status: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub access_source: String,
}
