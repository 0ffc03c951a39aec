//! Audit event model - immutable, time-partitioned records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Authentication,
    Authorization,
    Administration,
    Security,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "AUTHENTICATION",
            AuditCategory::Authorization => "AUTHORIZATION",
            AuditCategory::Administration => "ADMINISTRATION",
            AuditCategory::Security => "SECURITY",
            AuditCategory::System => "SYSTEM",
        }
    }
}

/// Outcome recorded with every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
        }
    }
}

/// Client context attached to audit events and token metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

/// An immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: String,
    pub event_category: String,
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: Option<String>,
    pub result: String,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Filters for audit queries; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditEventFilter {
    pub event_category: Option<AuditCategory>,
    pub event_type: Option<String>,
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub result: Option<AuditResult>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Row of `authz.get_security_events_summary`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SecurityEventSummary {
    pub event_category: String,
    pub event_type: String,
    pub result: String,
    pub event_count: i64,
}

/// Row of `authz.detect_suspicious_activity`. `pattern` is either
/// `BRUTE_FORCE_ATTEMPT` or `UNUSUAL_ACCESS_PATTERN`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SuspiciousActivity {
    pub pattern: String,
    pub user_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub event_count: i64,
    pub organization_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_strings_match_schema_check() {
        for cat in [
            AuditCategory::Authentication,
            AuditCategory::Authorization,
            AuditCategory::Administration,
            AuditCategory::Security,
            AuditCategory::System,
        ] {
            assert!(cat.as_str().chars().all(|c| c.is_ascii_uppercase()));
        }
    }
}
