use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// HTTPRoute defines hostname- and path-based routing of HTTP traffic
/// to backend services, with an optional chain of request filters
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.portico.dev",
    version = "v1alpha1",
    kind = "HTTPRoute",
    plural = "httproutes",
    namespaced,
    derive = "Default",
    status = "HTTPRouteStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteSpec {
    /// Hostnames to match against the HTTP Host header (lower-case,
    /// without port). Empty means the route matches no host.
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Routing rules, evaluated in order for scoring
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

/// A match-and-action entry within a route
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    /// Match conditions; an empty list matches every request
    #[serde(default)]
    pub matches: Vec<RouteMatch>,

    /// Filters to run before proxying, in declared order
    #[serde(default)]
    pub filters: Vec<RouteFilter>,

    /// Destination service(s); at least one is required at serve time
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

/// Match conditions for a rule. All present predicates must hold.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    /// HTTP path predicate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
}

/// Path predicate for a match
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathMatch {
    /// How the value is compared against the request path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<PathMatchType>,

    /// Path value to compare (defaults to "/")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Path comparison type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PathMatchType {
    /// Request path must equal the value
    Exact,
    /// Request path must begin with the value
    PathPrefix,
}

impl Default for PathMatchType {
    fn default() -> Self {
        PathMatchType::PathPrefix
    }
}

/// A filter reference within a rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteFilter {
    /// Filter type; only ExtensionRef is defined in this version
    pub r#type: FilterType,

    /// Reference to the object configuring the filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_ref: Option<LocalObjectReference>,
}

/// Filter dispatch type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FilterType {
    /// The filter is configured by a referenced extension object
    ExtensionRef,
}

impl Default for FilterType {
    fn default() -> Self {
        FilterType::ExtensionRef
    }
}

/// Reference to an extension object in the route's namespace
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// API group of the referent
    #[serde(default)]
    pub group: String,

    /// Kind of the referent (e.g. OIDCAuth, ExternalProcessor)
    pub kind: String,

    /// Name of the referent
    pub name: String,
}

/// Destination service for a rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// Name of the backend service
    pub name: String,

    /// Namespace of the backend service (defaults to the route's namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Port on the backend service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Status of an HTTPRoute
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteStatus {
    /// Whether this route has been accepted into the route table
    #[serde(default)]
    pub ready: bool,
}
