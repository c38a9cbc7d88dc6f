//! Instance facade wiring the route table, filters, proxy, and listeners

use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http_body_util::Full;
use hyper::{Request, Response};
use kube::ResourceExt;
use portico_api::HTTPRoute;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::identity::{IdentitySource, ServerIdTemplate};
use crate::listener::{ConnInfo, HttpListener, ServerTimeouts};
use crate::metrics::MetricsCollector;
use crate::proxy::{self, bad_gateway, UpstreamIdentity};
use crate::routes::{Route, RouteId, RouteTable};
use crate::tls::{HttpsListener, TlsEntry};

/// One gateway instance: the route table plus the optional identity
/// binding, shared by all listeners
pub struct Instance {
    routes: RouteTable,
    identity: Option<Arc<dyn IdentitySource>>,
    server_id: Option<ServerIdTemplate>,
    timeouts: ServerTimeouts,
    metrics: MetricsCollector,
}

impl Instance {
    /// Create an instance. A server-id pattern binds upstream dials to
    /// mTLS and therefore requires an identity source.
    pub fn new(
        identity: Option<Arc<dyn IdentitySource>>,
        server_id_pattern: Option<&str>,
    ) -> Result<Self> {
        if server_id_pattern.is_some() && identity.is_none() {
            return Err(GatewayError::Identity(
                "an authorized-server-id pattern requires an identity source".to_string(),
            ));
        }
        Ok(Self {
            routes: RouteTable::new(),
            identity,
            server_id: server_id_pattern.map(ServerIdTemplate::new),
            timeouts: ServerTimeouts::default(),
            metrics: MetricsCollector::new()?,
        })
    }

    pub(crate) fn identity(&self) -> Option<&Arc<dyn IdentitySource>> {
        self.identity.as_ref()
    }

    pub(crate) fn timeouts(&self) -> &ServerTimeouts {
        &self.timeouts
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Build an immutable route from the object and swap it into the
    /// table, replacing any prior route with the same id.
    ///
    /// The client resolves extension references while building the
    /// rule filters; without one, filters that need a referenced
    /// object become error sinks.
    pub async fn update_route(&self, client: Option<&kube::Client>, obj: &HTTPRoute) -> Result<()> {
        let route = Route::build(client, object_id(obj), &obj.spec).await;
        self.routes.update(Arc::new(route)).await;
        Ok(())
    }

    /// Remove the route with the object's id from the table
    pub async fn delete_route(&self, obj: &HTTPRoute) -> Result<()> {
        self.routes.delete(&object_id(obj)).await;
        Ok(())
    }

    /// Dispatch one request: route lookup, filter chain, proxy.
    /// Failures surface to the client as 502.
    pub async fn handle<B>(&self, req: Request<B>, conn: &ConnInfo) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let method = req.method().to_string();
        let timer = self.metrics.start_request(&method);

        let host = req
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();
        let path = req.uri().path().to_string();

        let response = match self.routes.lookup(&host, &path).await {
            Some(found) => {
                let upstream = match (&self.identity, &self.server_id) {
                    (Some(source), Some(server_id)) => Some(UpstreamIdentity {
                        source: source.as_ref(),
                        server_id,
                    }),
                    _ => None,
                };
                let rule = &found.route.rules[found.rule_index];
                proxy::serve(&found.route, rule, req, conn, upstream, &self.timeouts).await
            }
            None => {
                info!("no matching route for host {:?}", host);
                bad_gateway()
            }
        };

        self.metrics.observe_response(response.status().as_u16(), timer);
        response
    }

    /// Create the HTTP listener for this instance
    pub fn add_http_listener(self: &Arc<Self>) -> HttpListener {
        HttpListener::new(self.clone())
    }

    /// Create the HTTPS listener, wrapping the HTTP listener's
    /// dispatch behind TLS with the given certificate entries
    pub fn add_https_listener(
        self: &Arc<Self>,
        http: &HttpListener,
        entries: &[TlsEntry],
    ) -> Result<HttpsListener> {
        HttpsListener::new(self.clone(), http, entries)
    }
}

fn object_id(obj: &HTTPRoute) -> RouteId {
    RouteId {
        namespace: obj.namespace().unwrap_or_default(),
        name: obj.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_api::v1alpha1::http_route::{
        BackendRef, HTTPRouteSpec, PathMatch, PathMatchType, RouteMatch, RouteRule,
    };

    fn route_object(name: &str, hosts: &[&str], prefix: &str) -> HTTPRoute {
        let mut obj = HTTPRoute::new(
            name,
            HTTPRouteSpec {
                hostnames: hosts.iter().map(|h| h.to_string()).collect(),
                rules: vec![RouteRule {
                    matches: vec![RouteMatch {
                        path: Some(PathMatch {
                            r#type: Some(PathMatchType::PathPrefix),
                            value: Some(prefix.to_string()),
                        }),
                    }],
                    backend_refs: vec![BackendRef {
                        name: "svc".to_string(),
                        namespace: None,
                        // Left unset: requests that reach the proxy
                        // stage fail with 502 instead of dialing out.
                        port: None,
                    }],
                    ..Default::default()
                }],
            },
        );
        obj.metadata.namespace = Some("prod".to_string());
        obj
    }

    fn request(host: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_lookup_miss_is_bad_gateway() {
        let instance = Instance::new(None, None).unwrap();
        let response = instance
            .handle(request("a.example.com", "/x"), &ConnInfo::default())
            .await;
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_update_then_delete_route() {
        let instance = Instance::new(None, None).unwrap();
        let obj = route_object("route-a", &["a.example.com"], "/");

        instance.update_route(None, &obj).await.unwrap();
        assert!(instance.routes.lookup("a.example.com", "/x").await.is_some());

        // Dispatch reaches the proxy stage; the backend ref without a
        // port surfaces as 502.
        let response = instance
            .handle(request("a.example.com", "/x"), &ConnInfo::default())
            .await;
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);

        instance.delete_route(&obj).await.unwrap();
        assert!(instance.routes.lookup("a.example.com", "/x").await.is_none());
    }

    #[tokio::test]
    async fn test_pattern_without_identity_is_rejected() {
        let result = Instance::new(None, Some("spiffe://cluster.local/ns/{{namespace}}/sa/{{name}}"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_metrics_record_dispatch() {
        let instance = Instance::new(None, None).unwrap();
        instance
            .handle(request("a.example.com", "/"), &ConnInfo::default())
            .await;
        let exported = instance.metrics().export().unwrap();
        assert!(exported.contains("http_requests_total{method=\"GET\"} 1"));
    }
}
