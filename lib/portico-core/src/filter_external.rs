//! External processor filter
//!
//! Sends the request headers over a bidirectional gRPC stream to an
//! external processing service and applies its verdict: an immediate
//! response short-circuits the pipeline, a header mutation is applied
//! to the request before it continues.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderName, HeaderValue};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use envoy_types::pb::envoy::config::core::v3::{
    HeaderMap as ProtoHeaderMap, HeaderValue as ProtoHeaderValue,
};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_client::ExternalProcessorClient, processing_request, processing_response,
    HttpHeaders, ProcessingRequest,
};

use crate::error::{GatewayError, Result};
use crate::filter::Filter;
use crate::listener::ConnInfo;
use crate::proxy::bad_gateway;

// TODO: read the endpoint from the referenced ExternalProcessor object
// instead of a fixed target.
const PROCESSOR_TARGET: &str = "http://sso-gateway-filter.sso-system:80";

pub struct ExternalProcessorFilter {
    client: ExternalProcessorClient<Channel>,
}

impl std::fmt::Debug for ExternalProcessorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalProcessorFilter").finish()
    }
}

impl ExternalProcessorFilter {
    pub(crate) fn build() -> Result<Self> {
        Self::connect(PROCESSOR_TARGET)
    }

    /// Create a filter talking to the given gRPC target. The channel
    /// connects lazily, so an unreachable processor surfaces per
    /// request rather than at build time.
    pub fn connect(target: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(target.to_string()).map_err(|err| {
            GatewayError::FilterConfig(format!("invalid grpc target {target:?}: {err}"))
        })?;
        let channel = endpoint.connect_lazy();
        Ok(Self {
            client: ExternalProcessorClient::new(channel),
        })
    }
}

#[async_trait]
impl Filter for ExternalProcessorFilter {
    async fn handle(
        &self,
        req: &mut http::request::Parts,
        conn: &ConnInfo,
    ) -> Option<Response<Full<Bytes>>> {
        let mut client = self.client.clone();

        let headers_request = ProcessingRequest {
            request: Some(processing_request::Request::RequestHeaders(
                build_request_headers(req, conn),
            )),
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel(1);
        if tx.send(headers_request).await.is_err() {
            warn!("error queueing headers for external processor");
            return Some(bad_gateway());
        }

        let mut responses = match client.process(ReceiverStream::new(rx)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                warn!("error starting external processor stream: {}", status);
                return Some(bad_gateway());
            }
        };

        let message = match responses.message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!("external processor closed stream without a response");
                drop(tx);
                return Some(bad_gateway());
            }
            Err(status) => {
                warn!("error reading external processor response: {}", status);
                drop(tx);
                return Some(bad_gateway());
            }
        };
        // Close our send side; one message each way is the whole exchange.
        drop(tx);

        match message.response {
            Some(processing_response::Response::ImmediateResponse(immediate)) => {
                let mut builder = Response::builder();
                for option in immediate
                    .headers
                    .map(|mutation| mutation.set_headers)
                    .unwrap_or_default()
                {
                    if let Some(header) = option.header {
                        builder = builder.header(header.key.clone(), proto_header_value(&header));
                    }
                }

                let code = immediate.status.map(|status| status.code).unwrap_or(0);
                let status = match code {
                    0 => StatusCode::OK,
                    code => StatusCode::from_u16(code as u16).unwrap_or(StatusCode::OK),
                };

                match builder.status(status).body(Full::new(Bytes::new())) {
                    Ok(response) => Some(response),
                    Err(err) => {
                        warn!("invalid immediate response from external processor: {}", err);
                        Some(bad_gateway())
                    }
                }
            }
            Some(processing_response::Response::RequestHeaders(headers_response)) => {
                let mutation = headers_response
                    .response
                    .and_then(|common| common.header_mutation);
                if let Some(mutation) = mutation {
                    for option in mutation.set_headers {
                        let Some(header) = option.header else { continue };
                        let value = proto_header_value(&header);
                        debug!("setting header {} = {}", header.key, value);
                        match (
                            HeaderName::try_from(header.key.as_str()),
                            HeaderValue::try_from(value.as_str()),
                        ) {
                            (Ok(name), Ok(value)) => {
                                req.headers.append(name, value);
                            }
                            _ => warn!("ignoring invalid header mutation {:?}", header.key),
                        }
                    }
                }
                None
            }
            None => None,
            Some(_other) => {
                warn!("unhandled external processor response type");
                None
            }
        }
    }
}

fn proto_header_value(header: &ProtoHeaderValue) -> String {
    if header.raw_value.is_empty() {
        header.value.clone()
    } else {
        String::from_utf8_lossy(&header.raw_value).to_string()
    }
}

/// Assemble the RequestHeaders message: lower-cased request headers
/// plus the :method/:path/:scheme/:host pseudo-headers and, for mTLS
/// peers, the x-forwarded-client-cert header
fn build_request_headers(req: &http::request::Parts, conn: &ConnInfo) -> HttpHeaders {
    let mut headers = Vec::new();

    for (name, value) in &req.headers {
        // Replaced below with the freshly computed value.
        if name.as_str() == "x-forwarded-client-cert" {
            continue;
        }
        headers.push(ProtoHeaderValue {
            key: name.as_str().to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).to_string(),
            ..Default::default()
        });
    }

    let host = req
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default();
    let scheme = if conn.tls { "https" } else { "http" };

    headers.push(proto_header(":method", req.method.as_str()));
    headers.push(proto_header(":path", req.uri.path()));
    headers.push(proto_header(":scheme", scheme));
    headers.push(proto_header(":host", &host));

    if let Some(xfcc) = xfcc_header(&conn.peer_certificates) {
        headers.push(proto_header("x-forwarded-client-cert", &xfcc));
    }

    HttpHeaders {
        headers: Some(ProtoHeaderMap { headers }),
        end_of_stream: false,
        ..Default::default()
    }
}

fn proto_header(key: &str, value: &str) -> ProtoHeaderValue {
    ProtoHeaderValue {
        key: key.to_string(),
        value: value.to_string(),
        ..Default::default()
    }
}

/// `Cert=<url-escaped PEM>;Subject=<quoted subject DN>` per peer
/// certificate, comma-joined
fn xfcc_header(peer_certificates: &[CertificateDer<'static>]) -> Option<String> {
    if peer_certificates.is_empty() {
        return None;
    }
    let values: Vec<String> = peer_certificates.iter().map(xfcc_element).collect();
    Some(values.join(","))
}

fn xfcc_element(der: &CertificateDer<'static>) -> String {
    let pem = pem_encode(der);
    let escaped: String = url::form_urlencoded::byte_serialize(pem.as_bytes()).collect();
    let subject = cert_subject(der).unwrap_or_default();
    format!("Cert={escaped};Subject={subject:?}")
}

fn cert_subject(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    Some(cert.subject().to_string())
}

fn pem_encode(der: &CertificateDer<'_>) -> String {
    let encoded = STANDARD.encode(der.as_ref());
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}
