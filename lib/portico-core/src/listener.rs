//! HTTP listener: accept loop, server timeouts, request dispatch

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::pki_types::CertificateDer;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::instance::Instance;
use crate::proxy::bad_gateway;

/// Facts about the inbound connection a request arrived on
#[derive(Clone, Debug, Default)]
pub struct ConnInfo {
    /// Whether the connection is TLS-terminated by the gateway
    pub tls: bool,
    /// Client certificates presented during the TLS handshake
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Hard timeouts enforced by the HTTP server.
///
/// `read_header` maps to hyper's native header read timeout, which
/// also bounds the keep-alive wait for a next request. `read` bounds
/// inbound body collection and `write` bounds production of the
/// response.
#[derive(Clone, Debug)]
pub struct ServerTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
    pub read_header: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(1),
            write: Duration::from_secs(1),
            idle: Duration::from_secs(30),
            read_header: Duration::from_secs(2),
        }
    }
}

/// Plain-HTTP listener bound to one instance
pub struct HttpListener {
    instance: Arc<Instance>,
    timeouts: ServerTimeouts,
}

impl HttpListener {
    pub(crate) fn new(instance: Arc<Instance>) -> Self {
        let timeouts = instance.timeouts().clone();
        Self { instance, timeouts }
    }

    pub(crate) fn timeouts(&self) -> &ServerTimeouts {
        &self.timeouts
    }

    /// Bind the address and serve connections until process exit
    pub async fn start(&self, listen: &str) -> Result<()> {
        let listener = TcpListener::bind(listen).await?;
        info!("listening for http on {}", listen);

        let instance = self.instance.clone();
        let timeouts = self.timeouts.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("error accepting connection: {}", err);
                        continue;
                    }
                };
                let instance = instance.clone();
                let timeouts = timeouts.clone();
                tokio::spawn(async move {
                    serve_connection(
                        TokioIo::new(stream),
                        instance,
                        timeouts,
                        ConnInfo::default(),
                        peer_addr,
                    )
                    .await;
                });
            }
        });
        Ok(())
    }
}

/// Serve one accepted connection. Shared between the HTTP and HTTPS
/// listeners; the latter passes the TLS-derived [`ConnInfo`].
pub(crate) async fn serve_connection<IO>(
    io: IO,
    instance: Arc<Instance>,
    timeouts: ServerTimeouts,
    conn: ConnInfo,
    peer_addr: SocketAddr,
) where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let write_timeout = timeouts.write;
    let service = service_fn(move |req| {
        let instance = instance.clone();
        let conn = conn.clone();
        async move {
            let response = match tokio::time::timeout(write_timeout, instance.handle(req, &conn))
                .await
            {
                Ok(response) => response,
                Err(_) => {
                    warn!("request handling exceeded the write timeout");
                    bad_gateway()
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(err) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read_header)
        .serve_connection(io, service)
        .await
    {
        debug!("error serving connection from {}: {}", peer_addr, err);
    }
}
