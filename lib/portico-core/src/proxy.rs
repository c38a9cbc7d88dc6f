//! Reverse proxy: backend resolution, request rewriting, upstream dial

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::uri::Uri;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::Connect;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};

use crate::identity::{mtls_client_config, IdentitySource, ServerIdTemplate};
use crate::listener::{ConnInfo, ServerTimeouts};
use crate::routes::Route;
use crate::rule::Rule;

/// Identity binding for upstream connections: the workload identity
/// source plus the authorized-server-ID pattern
pub(crate) struct UpstreamIdentity<'a> {
    pub source: &'a dyn IdentitySource,
    pub server_id: &'a ServerIdTemplate,
}

/// Serve a request that matched (route, rule): run the filter chain,
/// then proxy to the rule's first backend
pub(crate) async fn serve<B>(
    route: &Route,
    rule: &Rule,
    req: Request<B>,
    conn: &ConnInfo,
    upstream: Option<UpstreamIdentity<'_>>,
    timeouts: &ServerTimeouts,
) -> Response<Full<Bytes>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    if rule.backend_refs.is_empty() {
        info!("no backendRefs in rule");
        return bad_gateway();
    }

    let (mut parts, body) = req.into_parts();

    for filter in &rule.filters {
        if let Some(response) = filter.handle(&mut parts, conn).await {
            return response;
        }
    }

    // TODO: load balancing across backendRefs; for now the first wins
    let backend_ref = &rule.backend_refs[0];
    let service_name = backend_ref.name.as_str();
    let service_namespace = backend_ref.namespace.as_deref().unwrap_or(&route.namespace);
    let backend_host = format!("{service_name}.{service_namespace}");

    let backend_port = match backend_ref.port {
        Some(port) if port != 0 => port,
        _ => {
            info!("cannot infer backendRef port");
            return bad_gateway();
        }
    };

    // So backends know the original scheme
    let forwarded_proto = if conn.tls { "https" } else { "http" };
    // Identity-bound upstreams are dialed with mTLS
    let target_scheme = if upstream.is_some() { "https" } else { "http" };

    let body = match tokio::time::timeout(timeouts.read, collect_body(body)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            warn!("error reading request body: {}", err);
            return bad_gateway();
        }
        Err(_) => {
            warn!("timed out reading request body");
            return bad_gateway();
        }
    };

    let uri = match upstream_uri(target_scheme, &backend_host, backend_port, &parts.uri) {
        Ok(uri) => uri,
        Err(err) => {
            warn!("error building upstream url for {:?}: {}", backend_host, err);
            return bad_gateway();
        }
    };

    let mut upstream_request = match Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Full::new(body))
    {
        Ok(request) => request,
        Err(err) => {
            warn!("error building upstream request: {}", err);
            return bad_gateway();
        }
    };

    let headers = upstream_request.headers_mut();
    for (name, value) in &parts.headers {
        if is_hop_by_hop_header(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static(forwarded_proto));
    // The inbound Host is preserved; without one, hyper would derive it
    // from the rewritten URI anyway.
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&format!("{backend_host}:{backend_port}")) {
            headers.insert(HOST, value);
        }
    }

    let result = match upstream {
        Some(identity) => {
            let server_id = identity.server_id.resolve(service_namespace, service_name);
            debug!(
                "creating mtls transport for {:?} requiring {:?}",
                backend_host, server_id
            );
            let tls_config = match mtls_client_config(identity.source, &server_id) {
                Ok(config) => config,
                Err(err) => {
                    warn!("error building mtls client config: {}", err);
                    return bad_gateway();
                }
            };
            let connector = hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_only()
                .enable_http1()
                .build();
            let client = Client::builder(TokioExecutor::new()).build(connector);
            forward(client, upstream_request).await
        }
        None => {
            let client = Client::builder(TokioExecutor::new()).build_http();
            forward(client, upstream_request).await
        }
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            warn!("error forwarding to {:?}: {}", backend_host, err);
            bad_gateway()
        }
    }
}

async fn forward<C>(
    client: Client<C, Full<Bytes>>,
    request: Request<Full<Bytes>>,
) -> std::result::Result<Response<Full<Bytes>>, Box<dyn std::error::Error + Send + Sync>>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let response = client.request(request).await?;
    let (mut parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    let drop_headers: Vec<_> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in drop_headers {
        parts.headers.remove(name);
    }

    Ok(Response::from_parts(parts, Full::new(body)))
}

async fn collect_body<B>(body: B) -> std::result::Result<Bytes, B::Error>
where
    B: hyper::body::Body,
{
    Ok(body.collect().await?.to_bytes())
}

fn upstream_uri(
    scheme: &str,
    host: &str,
    port: u16,
    original: &Uri,
) -> std::result::Result<Uri, http::Error> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme(scheme)
        .authority(format!("{host}:{port}"))
        .path_and_query(upstream_path(path_and_query))
        .build()
}

/// Path rewriting hook. Prefix replacement is not implemented;
/// requests keep their inbound path and query.
fn upstream_path(path_and_query: &str) -> String {
    path_and_query.to_string()
}

/// Check if a header is hop-by-hop (never forwarded in either direction)
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

pub(crate) fn bad_gateway() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Full::new(Bytes::from("Bad Gateway\n")))
        .unwrap()
}
