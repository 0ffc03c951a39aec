//! Error taxonomy for the authorization server.
//!
//! Every error carries three facets: a numeric code, developer-oriented text
//! (the `Display` impl), and a UI-safe message. The code *family* is the
//! stable contract; individual codes may be extended.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Stable error families. Persistence, fabric, and external failures all map
/// to a generic UI message; validation failures stay specific and actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFamily {
    Authentication,
    Authorization,
    Validation,
    Persistence,
    Fabric,
    External,
}

#[derive(Debug, Error)]
pub enum AuthzError {
    // ---- Authentication (40xx) ----
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("identity provider exchange failed: {0}")]
    IdpExchangeFailed(anyhow::Error),

    #[error("identity provider returned no usable profile")]
    IdpProfileMissing,

    #[error("authorization code invalid")]
    AuthorizationCodeInvalid,

    #[error("user not found")]
    UserNotFound,

    // ---- Authorization (41xx) ----
    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("token has been revoked")]
    TokenBlacklisted,

    #[error("organization access denied")]
    OrganizationAccessDenied,

    #[error("role not found")]
    RoleNotFound,

    #[error("missing permission: {0}")]
    MissingPermission(String),

    #[error("organization not found")]
    OrganizationNotFound,

    #[error("token blacklist operation failed: {0}")]
    TokenBlacklistFailed(anyhow::Error),

    // ---- Validation (42xx) ----
    #[error("user is not provisioned for authorization")]
    UserNotFoundInRbac,

    #[error("organization is not provisioned for authorization")]
    OrganizationNotFoundInRbac,

    #[error("user has no organization membership")]
    NoOrganizationMembership,

    #[error("organization path invalid: {0}")]
    OrganizationPathInvalid(String),

    #[error("user provisioning failed: {0}")]
    UserProvisioningFailed(anyhow::Error),

    #[error("external id invalid: {0}")]
    ExternalIdInvalid(String),

    #[error("resolved permission set too large: {count} exceeds the configured maximum of {max}")]
    PermissionsCapacityExceeded { count: usize, max: usize },

    // ---- Persistence (50xx) ----
    #[error("database connection failed: {0}")]
    ConnectionFailed(anyhow::Error),

    #[error("query failed: {0}")]
    QueryFailed(anyhow::Error),

    #[error("transaction failed: {0}")]
    TransactionFailed(anyhow::Error),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("{operation} failed: {detail}")]
    CustomQueryError { operation: String, detail: String },

    // ---- Fabric (51xx) ----
    #[error("publish failed: {0}")]
    PublishFailed(anyhow::Error),

    #[error("consume failed: {0}")]
    ConsumeFailed(anyhow::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("serialization failed: {0}")]
    SerializationFailed(anyhow::Error),

    #[error("service unavailable")]
    ServiceUnavailable,

    // ---- External (52xx) ----
    #[error("identity provider api error: {0}")]
    IdpApiError(anyhow::Error),

    #[error("token signing failed: {0}")]
    SigningFailed(anyhow::Error),

    #[error("token signature invalid")]
    SignatureInvalid,

    #[error("external call timed out")]
    ExternalTimeout,

    #[error("configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AuthzError {
    /// Numeric code. The thousands/hundreds digits identify the family.
    pub fn code(&self) -> u16 {
        match self {
            AuthzError::InvalidToken(_) => 4001,
            AuthzError::TokenExpired => 4002,
            AuthzError::IdpExchangeFailed(_) => 4003,
            AuthzError::IdpProfileMissing => 4004,
            AuthzError::AuthorizationCodeInvalid => 4005,
            AuthzError::UserNotFound => 4006,

            AuthzError::InsufficientPermissions => 4100,
            AuthzError::TokenBlacklisted => 4101,
            AuthzError::OrganizationAccessDenied => 4102,
            AuthzError::RoleNotFound => 4103,
            AuthzError::MissingPermission(_) => 4104,
            AuthzError::OrganizationNotFound => 4105,
            AuthzError::TokenBlacklistFailed(_) => 4106,

            AuthzError::UserNotFoundInRbac => 4201,
            AuthzError::OrganizationNotFoundInRbac => 4202,
            AuthzError::NoOrganizationMembership => 4203,
            AuthzError::OrganizationPathInvalid(_) => 4204,
            AuthzError::UserProvisioningFailed(_) => 4205,
            AuthzError::ExternalIdInvalid(_) => 4206,
            AuthzError::PermissionsCapacityExceeded { .. } => 4207,

            AuthzError::ConnectionFailed(_) => 5001,
            AuthzError::QueryFailed(_) => 5002,
            AuthzError::TransactionFailed(_) => 5003,
            AuthzError::ConstraintViolation(_) => 5004,
            AuthzError::CustomQueryError { .. } => 5005,

            AuthzError::PublishFailed(_) => 5101,
            AuthzError::ConsumeFailed(_) => 5102,
            AuthzError::Timeout => 5103,
            AuthzError::SerializationFailed(_) => 5104,
            AuthzError::ServiceUnavailable => 5105,

            AuthzError::IdpApiError(_) => 5201,
            AuthzError::SigningFailed(_) => 5202,
            AuthzError::SignatureInvalid => 5203,
            AuthzError::ExternalTimeout => 5204,
            AuthzError::ConfigError(_) => 5290,
        }
    }

    pub fn family(&self) -> ErrorFamily {
        match self.code() {
            4000..=4099 => ErrorFamily::Authentication,
            4100..=4199 => ErrorFamily::Authorization,
            4200..=4299 => ErrorFamily::Validation,
            5000..=5099 => ErrorFamily::Persistence,
            5100..=5199 => ErrorFamily::Fabric,
            _ => ErrorFamily::External,
        }
    }

    /// UI-safe message. Never names a missing permission and never exposes
    /// internals of persistence or external failures.
    pub fn ui_message(&self) -> String {
        match self {
            AuthzError::InvalidToken(_) | AuthzError::SignatureInvalid => {
                "Your session is invalid. Please sign in again.".to_string()
            }
            AuthzError::TokenExpired => "Your session has expired. Please sign in again.".to_string(),
            AuthzError::TokenBlacklisted => {
                "Your session has been revoked. Please sign in again.".to_string()
            }
            AuthzError::IdpExchangeFailed(_)
            | AuthzError::IdpProfileMissing
            | AuthzError::AuthorizationCodeInvalid => {
                "Sign-in could not be completed. Please try again.".to_string()
            }
            AuthzError::InsufficientPermissions
            | AuthzError::MissingPermission(_)
            | AuthzError::OrganizationAccessDenied => {
                "You do not have permission to perform this action.".to_string()
            }
            AuthzError::UserNotFound | AuthzError::UserNotFoundInRbac => {
                "Your account could not be found.".to_string()
            }
            AuthzError::RoleNotFound => "The requested role does not exist.".to_string(),
            AuthzError::OrganizationNotFound | AuthzError::OrganizationNotFoundInRbac => {
                "The requested organization does not exist.".to_string()
            }
            AuthzError::NoOrganizationMembership => {
                "Your account does not belong to any organization. Contact an administrator."
                    .to_string()
            }
            AuthzError::OrganizationPathInvalid(detail) => {
                format!("The organization name is not valid: {}", detail)
            }
            AuthzError::ExternalIdInvalid(_) => {
                "The identity received from the sign-in provider is not valid.".to_string()
            }
            AuthzError::UserProvisioningFailed(_) => {
                "Your account could not be set up. Please try again.".to_string()
            }
            AuthzError::PermissionsCapacityExceeded { .. } => {
                "Your account has too many permissions to issue a session. Contact an administrator."
                    .to_string()
            }
            // Persistence, fabric, and external failures are deliberately generic.
            _ => "A system error occurred. Please try again later.".to_string(),
        }
    }

    /// Reconstruct a family-accurate error from a wire `(code, message)` pair.
    /// Used when a typed failure crosses the message fabric.
    pub fn from_wire(code: u16, message: String) -> Self {
        match code {
            4001 => AuthzError::InvalidToken(message),
            4002 => AuthzError::TokenExpired,
            4004 => AuthzError::IdpProfileMissing,
            4005 => AuthzError::AuthorizationCodeInvalid,
            4006 => AuthzError::UserNotFound,
            4100 => AuthzError::InsufficientPermissions,
            4101 => AuthzError::TokenBlacklisted,
            4102 => AuthzError::OrganizationAccessDenied,
            4103 => AuthzError::RoleNotFound,
            4104 => AuthzError::MissingPermission(message),
            4105 => AuthzError::OrganizationNotFound,
            4201 => AuthzError::UserNotFoundInRbac,
            4202 => AuthzError::OrganizationNotFoundInRbac,
            4203 => AuthzError::NoOrganizationMembership,
            4204 => AuthzError::OrganizationPathInvalid(message),
            4206 => AuthzError::ExternalIdInvalid(message),
            5004 => AuthzError::ConstraintViolation(message),
            5103 => AuthzError::Timeout,
            5105 => AuthzError::ServiceUnavailable,
            5203 => AuthzError::SignatureInvalid,
            code if (5000..=5099).contains(&code) => {
                AuthzError::QueryFailed(anyhow::anyhow!(message))
            }
            code if (5100..=5199).contains(&code) => {
                AuthzError::ConsumeFailed(anyhow::anyhow!(message))
            }
            _ => AuthzError::CustomQueryError {
                operation: "fabric".to_string(),
                detail: message,
            },
        }
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(err: serde_json::Error) -> Self {
        AuthzError::SerializationFailed(anyhow::Error::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthzError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthzError::TokenExpired,
            ErrorKind::InvalidSignature => AuthzError::SignatureInvalid,
            _ => AuthzError::InvalidToken(err.to_string()),
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            code: u16,
            family: ErrorFamily,
            error: String,
        }

        let status = match &self {
            AuthzError::Timeout | AuthzError::ExternalTimeout => StatusCode::GATEWAY_TIMEOUT,
            AuthzError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => match self.family() {
                ErrorFamily::Authentication => StatusCode::UNAUTHORIZED,
                ErrorFamily::Authorization => StatusCode::FORBIDDEN,
                ErrorFamily::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorFamily::Persistence | ErrorFamily::External => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                ErrorFamily::Fabric => StatusCode::BAD_GATEWAY,
            },
        };

        tracing::error!(code = self.code(), error = %self, "request failed");

        (
            status,
            Json(ErrorResponse {
                code: self.code(),
                family: self.family(),
                error: self.ui_message(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_families() {
        assert_eq!(AuthzError::TokenExpired.family(), ErrorFamily::Authentication);
        assert_eq!(
            AuthzError::TokenBlacklisted.family(),
            ErrorFamily::Authorization
        );
        assert_eq!(
            AuthzError::NoOrganizationMembership.family(),
            ErrorFamily::Validation
        );
        assert_eq!(
            AuthzError::QueryFailed(anyhow::anyhow!("x")).family(),
            ErrorFamily::Persistence
        );
        assert_eq!(AuthzError::Timeout.family(), ErrorFamily::Fabric);
        assert_eq!(AuthzError::SignatureInvalid.family(), ErrorFamily::External);
    }

    #[test]
    fn test_ui_message_never_names_permission() {
        let err = AuthzError::MissingPermission("billing:delete".to_string());
        assert!(!err.ui_message().contains("billing:delete"));
        // The developer text does carry it.
        assert!(err.to_string().contains("billing:delete"));
    }

    #[test]
    fn test_generic_ui_message_for_persistence() {
        let err = AuthzError::QueryFailed(anyhow::anyhow!("relation does not exist"));
        assert_eq!(
            err.ui_message(),
            "A system error occurred. Please try again later."
        );
        assert!(!err.ui_message().contains("relation"));
    }

    #[test]
    fn test_wire_round_trip_preserves_family() {
        let original = AuthzError::NoOrganizationMembership;
        let rebuilt = AuthzError::from_wire(original.code(), original.to_string());
        assert_eq!(rebuilt.code(), original.code());
        assert_eq!(rebuilt.family(), ErrorFamily::Validation);
    }

    #[test]
    fn test_jwt_error_mapping() {
        let expired = jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::ExpiredSignature,
        );
        assert!(matches!(AuthzError::from(expired), AuthzError::TokenExpired));

        let bad_sig = jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidSignature,
        );
        assert!(matches!(
            AuthzError::from(bad_sig),
            AuthzError::SignatureInvalid
        ));
    }
}
