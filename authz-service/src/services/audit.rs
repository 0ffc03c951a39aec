//! Audit pipeline service.
//!
//! Append-only writes into the monthly-partitioned audit table, plus the
//! query, summary, and anomaly-detection read paths. An audit write failing
//! must never fail the operation that produced it; callers use
//! `log_best_effort` everywhere except the audit read APIs themselves.

use authz_core::error::AuthzError;
use uuid::Uuid;

use crate::models::{
    AuditCategory, AuditEvent, AuditEventFilter, AuditResult, ClientContext,
    SecurityEventSummary, SuspiciousActivity,
};
use crate::services::database::Database;

/// Audit service.
#[derive(Clone)]
pub struct AuditService {
    db: Database,
}

impl AuditService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event and return its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_event(
        &self,
        event_type: &str,
        category: AuditCategory,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        resource_id: Option<&str>,
        action: Option<&str>,
        result: AuditResult,
        details: serde_json::Value,
        ctx: &ClientContext,
    ) -> Result<Uuid, AuthzError> {
        self.db
            .log_audit_event(
                event_type,
                category.as_str(),
                user_id,
                organization_id,
                None,
                resource_id,
                action,
                result.as_str(),
                &details,
                ctx.ip_address.as_deref(),
                ctx.user_agent.as_deref(),
                ctx.session_id.as_deref(),
                ctx.request_id.as_deref(),
            )
            .await
    }

    /// Append one event, swallowing failures. The only asymmetric error
    /// path in the system: a lost audit record is logged and the caller
    /// continues.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_best_effort(
        &self,
        event_type: &str,
        category: AuditCategory,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        resource_id: Option<&str>,
        action: Option<&str>,
        result: AuditResult,
        details: serde_json::Value,
        ctx: &ClientContext,
    ) {
        if let Err(e) = self
            .log_event(
                event_type,
                category,
                user_id,
                organization_id,
                resource_id,
                action,
                result,
                details,
                ctx,
            )
            .await
        {
            tracing::error!(
                error = %e,
                event_type = event_type,
                "failed to write audit event"
            );
        }
    }

    /// Time-ranged, filtered query, newest first.
    pub async fn query(
        &self,
        filter: &AuditEventFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AuthzError> {
        self.db.get_audit_events(filter, limit, offset).await
    }

    /// Counts per (category, type, result) over the recent window.
    pub async fn security_summary(
        &self,
        window_minutes: i32,
    ) -> Result<Vec<SecurityEventSummary>, AuthzError> {
        self.db.get_security_events_summary(window_minutes).await
    }

    /// Run the anomaly detectors over the recent window.
    pub async fn detect_suspicious_activity(
        &self,
        window_minutes: i32,
        failure_threshold: i32,
    ) -> Result<Vec<SuspiciousActivity>, AuthzError> {
        self.db
            .detect_suspicious_activity(window_minutes, failure_threshold)
            .await
    }
}
