//! User model - internal principals mapped from IdP identities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// User entity. `external_id` uniquely maps one IdP identity to one internal
/// user for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_picture_url: Option<String>,
    pub status: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Fields required to provision a new user from an IdP profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub external_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_picture_url: Option<String>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            external_id: "idp|123".to_string(),
            email: "a@b.c".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            profile_picture_url: None,
            status: "active".to_string(),
            source: "oidc".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_full_name() {
        assert_eq!(sample_user().full_name(), "Ada Lovelace");
    }

    #[test]
    fn test_full_name_falls_back_to_email() {
        let mut user = sample_user();
        user.first_name = String::new();
        user.last_name = String::new();
        assert_eq!(user.full_name(), "a@b.c");
    }
}
