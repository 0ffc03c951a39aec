//! Token blacklist model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Prefix of the blanket per-user revocation marker.
pub const EMERGENCY_JTI_PREFIX: &str = "EMERGENCY_";

/// The jti of the blanket revocation marker for a user.
pub fn emergency_jti(user_id: Uuid) -> String {
    format!("{}{}", EMERGENCY_JTI_PREFIX, user_id)
}

/// A revoked token. An entry is active iff `expires_at > now`; expired rows
/// are swept by maintenance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenBlacklistEntry {
    pub jti: String,
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub revoked_at: DateTime<Utc>,
    pub revoked_by: Option<Uuid>,
    pub reason: String,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl TokenBlacklistEntry {
    pub fn is_active(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// Answer to a blacklist lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistStatus {
    pub is_blacklisted: bool,
    pub reason: Option<String>,
    pub blacklisted_at: Option<DateTime<Utc>>,
}

impl BlacklistStatus {
    pub fn clear() -> Self {
        Self {
            is_blacklisted: false,
            reason: None,
            blacklisted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emergency_jti_format() {
        let user_id = Uuid::nil();
        assert_eq!(
            emergency_jti(user_id),
            "EMERGENCY_00000000-0000-0000-0000-000000000000"
        );
    }
}
