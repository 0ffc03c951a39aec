//! Blacklist semantics and audit anomaly detection over real storage.

mod common;

use authz_service::models::{emergency_jti, AuditCategory, AuditResult, ClientContext};
use authz_service::services::AuditService;
use chrono::{Duration, Utc};

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_blacklist_round_trip_and_expiry_semantics() {
    let test = common::setup().await;
    let jti = format!("jti-{}", common::tag());

    assert!(!test.db.is_token_blacklisted(&jti).await.unwrap());

    test.db
        .blacklist_token(&jti, None, None, None, "logout", Some(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    assert!(test.db.is_token_blacklisted(&jti).await.unwrap());

    // A row whose expiry has passed is not an active revocation.
    let stale = format!("stale-{}", common::tag());
    test.db
        .blacklist_token(
            &stale,
            None,
            None,
            None,
            "logout",
            Some(Utc::now() - Duration::minutes(1)),
        )
        .await
        .unwrap();
    assert!(!test.db.is_token_blacklisted(&stale).await.unwrap());

    // The sweep removes it.
    let removed = test.db.cleanup_expired_tokens().await.unwrap();
    assert!(removed >= 1);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_revocation_is_idempotent_with_latest_reason() {
    let test = common::setup().await;
    let jti = format!("jti-{}", common::tag());

    test.db
        .blacklist_token(&jti, None, None, None, "logout", Some(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    test.db
        .blacklist_token(
            &jti,
            None,
            None,
            None,
            "security_incident",
            Some(Utc::now() + Duration::minutes(30)),
        )
        .await
        .unwrap();

    let entry = test.db.find_blacklist_entry(&jti).await.unwrap().unwrap();
    assert_eq!(entry.reason, "security_incident");
    // The later of the two expiries is kept.
    assert!(entry.expires_at > Utc::now() + Duration::minutes(45));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_emergency_revocation_marks_user() {
    let test = common::setup().await;
    let user = common::create_user(&test.db, "emergency").await;

    assert!(!test.db.is_user_emergency_revoked(user.id).await.unwrap());

    let count = test
        .db
        .emergency_revoke_user_tokens(user.id, None, "credential leak", None)
        .await
        .unwrap();
    assert!(count >= 1);
    assert!(test.db.is_user_emergency_revoked(user.id).await.unwrap());

    let marker = test
        .db
        .find_blacklist_entry(&emergency_jti(user.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.reason, "credential leak");
    assert_eq!(marker.user_id, Some(user.id));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_audit_events_are_immutable() {
    let test = common::setup().await;
    let audit = AuditService::new(test.db.clone());

    let event_id = audit
        .log_event(
            "LOGIN",
            AuditCategory::Authentication,
            None,
            None,
            None,
            None,
            AuditResult::Success,
            serde_json::json!({}),
            &ClientContext::default(),
        )
        .await
        .unwrap();

    // Updates and deletes are rejected by the storage layer.
    let update = sqlx::query("UPDATE authz.audit_events SET result = 'failure' WHERE id = $1")
        .bind(event_id)
        .execute(test.db.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM authz.audit_events WHERE id = $1")
        .bind(event_id)
        .execute(test.db.pool())
        .await;
    assert!(delete.is_err());
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_brute_force_detection() {
    let test = common::setup().await;
    let audit = AuditService::new(test.db.clone());
    let user = common::create_user(&test.db, "bruteforce").await;
    let ip = "1.2.3.4";

    // Six failed authentication events inside the window.
    for _ in 0..6 {
        audit
            .log_event(
                "LOGIN",
                AuditCategory::Authentication,
                Some(user.id),
                None,
                None,
                None,
                AuditResult::Failure,
                serde_json::json!({ "stage": "idp_exchange" }),
                &ClientContext {
                    ip_address: Some(ip.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let findings = audit.detect_suspicious_activity(5, 5).await.unwrap();
    let brute = findings
        .iter()
        .find(|f| {
            f.pattern == "BRUTE_FORCE_ATTEMPT"
                && f.user_id == Some(user.id)
                && f.ip_address.as_deref() == Some(ip)
        })
        .expect("expected a brute-force finding");
    assert!(brute.event_count >= 6);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_unusual_access_pattern_detection() {
    let test = common::setup().await;
    let audit = AuditService::new(test.db.clone());
    let user = common::create_user(&test.db, "spray").await;
    let ip = "5.6.7.8";

    // Permission checks across four organizations from one (user, ip).
    for _ in 0..4 {
        let org = common::create_org(&test.db, &format!("spray{}", common::tag()), None).await;
        audit
            .log_event(
                "PERMISSION_CHECK",
                AuditCategory::Authorization,
                Some(user.id),
                Some(org.id),
                None,
                None,
                AuditResult::Success,
                serde_json::json!({}),
                &ClientContext {
                    ip_address: Some(ip.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let findings = audit.detect_suspicious_activity(5, 100).await.unwrap();
    assert!(findings.iter().any(|f| {
        f.pattern == "UNUSUAL_ACCESS_PATTERN"
            && f.user_id == Some(user.id)
            && f.organization_count > 3
    }));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_security_summary_counts_by_category() {
    let test = common::setup().await;
    let audit = AuditService::new(test.db.clone());

    audit
        .log_event(
            "LOGIN",
            AuditCategory::Authentication,
            None,
            None,
            None,
            None,
            AuditResult::Failure,
            serde_json::json!({}),
            &ClientContext::default(),
        )
        .await
        .unwrap();

    let summary = audit.security_summary(5).await.unwrap();
    assert!(summary
        .iter()
        .any(|row| row.event_category == "AUTHENTICATION" && row.event_count >= 1));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_projection_refresh_is_nonblocking_noop_when_unchanged() {
    let test = common::setup().await;
    // CONCURRENTLY refresh must succeed repeatedly without holding locks
    // that would block this second call.
    test.db.refresh_permission_projection().await.unwrap();
    test.db.refresh_permission_projection().await.unwrap();
}
