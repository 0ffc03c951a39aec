//! Organization membership model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Membership of a user in an organization. At most one row per user carries
/// `is_primary`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrganizationMembership {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub is_primary: bool,
    pub status: String,
    pub joined_at: DateTime<Utc>,
    pub membership_type: Option<String>,
}

impl OrganizationMembership {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}
