/// API version v1alpha1 for Portico gateway CRDs

pub mod http_route;
pub mod oidc_auth;

pub use http_route::HTTPRoute;
pub use oidc_auth::OIDCAuth;

/// API group for Portico gateway resources
pub const API_GROUP: &str = "gateway.portico.dev";
/// API version for Portico gateway resources
pub const API_VERSION: &str = "v1alpha1";
