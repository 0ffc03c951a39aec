//! Service layer for the authorization server.

pub mod audit;
pub mod coordinator;
pub mod database;
pub mod idp;
pub mod maintenance;
pub mod organizations;
pub mod permissions;
pub mod tokens;

pub use audit::AuditService;
pub use coordinator::{AuthCoordinator, AuthResult, CheckPermissionsResult, UserContext};
pub use database::Database;
pub use idp::{IdentityProvider, IdpExchange, IdpProfile, MockIdentityProvider, OidcProvider};
pub use maintenance::MaintenanceRunner;
pub use organizations::{pick_login_organization, OrganizationService};
pub use permissions::{permission_matches, PermissionService};
pub use tokens::{
    MintRequest, MintedToken, TokenClaims, TokenMetadata, TokenOrganization, TokenService,
    TokenUser,
};
