//! Request filters: the pre-proxy handler chain

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use portico_api::v1alpha1::http_route::{FilterType, RouteFilter};
use tracing::error;

use crate::error::{GatewayError, Result};
use crate::filter_external::ExternalProcessorFilter;
use crate::filter_oidc::OidcAuthFilter;
use crate::listener::ConnInfo;
use crate::proxy::bad_gateway;

/// A pre-proxy request handler.
///
/// Filters run in the rule's declared order. Returning a response
/// short-circuits the pipeline: no further filter runs and the request
/// is not proxied. Returning `None` passes the (possibly mutated)
/// request on. Filters never see the request body.
#[async_trait]
pub trait Filter: Send + Sync + std::fmt::Debug {
    async fn handle(
        &self,
        req: &mut http::request::Parts,
        conn: &ConnInfo,
    ) -> Option<Response<Full<Bytes>>>;
}

/// Stand-in for a filter whose construction failed. It preserves the
/// rule's declared filter count and unconditionally fails the request.
#[derive(Debug)]
pub(crate) struct ErrorFilter {
    reason: String,
}

impl ErrorFilter {
    pub(crate) fn new(reason: String) -> Self {
        Self { reason }
    }
}

#[async_trait]
impl Filter for ErrorFilter {
    async fn handle(
        &self,
        _req: &mut http::request::Parts,
        _conn: &ConnInfo,
    ) -> Option<Response<Full<Bytes>>> {
        error!("filter error: {}", self.reason);
        Some(bad_gateway())
    }
}

/// Build a filter from its configuration reference, dispatching on the
/// referenced kind
pub(crate) async fn build_filter(
    client: Option<&kube::Client>,
    namespace: &str,
    conf: &RouteFilter,
) -> Result<Arc<dyn Filter>> {
    match conf.r#type {
        FilterType::ExtensionRef => {
            let extension_ref = conf.extension_ref.as_ref().ok_or_else(|| {
                GatewayError::FilterConfig("extensionRef not set in filter".to_string())
            })?;
            match extension_ref.kind.as_str() {
                "OIDCAuth" => {
                    let filter =
                        OidcAuthFilter::build(client, namespace, &extension_ref.name).await?;
                    Ok(Arc::new(filter))
                }
                "ExternalProcessor" => {
                    let filter = ExternalProcessorFilter::build()?;
                    Ok(Arc::new(filter))
                }
                kind => Err(GatewayError::FilterConfig(format!(
                    "unhandled extensionRef kind {kind:?}"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_api::v1alpha1::http_route::LocalObjectReference;

    fn extension_ref(kind: &str, name: &str) -> RouteFilter {
        RouteFilter {
            r#type: FilterType::ExtensionRef,
            extension_ref: Some(LocalObjectReference {
                group: "gateway.portico.dev".to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_build_filter_unknown_kind() {
        let err = build_filter(None, "default", &extension_ref("Bogus", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::FilterConfig(_)));
    }

    #[tokio::test]
    async fn test_build_filter_missing_ref() {
        let conf = RouteFilter {
            r#type: FilterType::ExtensionRef,
            extension_ref: None,
        };
        assert!(build_filter(None, "default", &conf).await.is_err());
    }

    #[tokio::test]
    async fn test_build_external_processor() {
        let filter = build_filter(None, "default", &extension_ref("ExternalProcessor", "sso"))
            .await;
        assert!(filter.is_ok());
    }

    #[tokio::test]
    async fn test_error_filter_short_circuits() {
        let filter = ErrorFilter::new("broken".to_string());
        let (mut parts, _) = hyper::Request::new(()).into_parts();
        let response = filter.handle(&mut parts, &ConnInfo::default()).await.unwrap();
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
    }
}
