use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// OIDCAuth configures OIDC bearer-token authentication for routes
/// that reference it through an ExtensionRef filter
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.portico.dev",
    version = "v1alpha1",
    kind = "OIDCAuth",
    plural = "oidcauths",
    namespaced,
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct OIDCAuthSpec {
    /// Issuer base URL; discovery is fetched from
    /// {issuer}/.well-known/openid-configuration
    #[serde(default)]
    pub issuer: String,

    /// Expected audience (aud claim) of accepted tokens
    #[serde(default)]
    pub audience: String,

    /// Login page to redirect unauthenticated requests to
    #[serde(default)]
    pub login_url: String,
}
