//! Portico gateway instance binary
//!
//! Starts the HTTP listener (and, when TLS entries are configured, the
//! HTTPS listener) and then runs the HTTPRoute reconciler that keeps
//! the in-memory route table in sync with the cluster.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use portico_core::{DiskIdentitySource, IdentitySource, Instance, TlsEntry};
use tracing::info;
use tracing_subscriber::fmt::init as tracing_init;

mod controller;

#[derive(Parser, Debug)]
#[command(name = "portico-gateway", about = "Declaratively configured HTTP/HTTPS gateway")]
struct Args {
    /// Authorized server ID pattern for backend mTLS; {{namespace}}
    /// and {{name}} are resolved against the selected backend
    #[arg(long)]
    server_id: Option<String>,

    /// Directory holding tls.crt, tls.key, and ca.crt backing the
    /// gateway's workload identity
    #[arg(long)]
    identity_dir: Option<PathBuf>,

    /// TLS certificate entry as host:directory; repeatable. The
    /// directory holds tls.crt and tls.key.
    #[arg(long = "tls")]
    tls: Vec<TlsEntry>,

    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_listen: String,

    /// HTTPS listen address
    #[arg(long, default_value = "0.0.0.0:8443")]
    https_listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let args = Args::parse();

    info!("starting portico-gateway...");

    let identity = args
        .identity_dir
        .as_ref()
        .map(|dir| Arc::new(DiskIdentitySource::new(dir)) as Arc<dyn IdentitySource>);

    let instance = Arc::new(Instance::new(identity, args.server_id.as_deref())?);

    let http = instance.add_http_listener();
    http.start(&args.http_listen).await?;

    if !args.tls.is_empty() {
        info!("tls configuration: {:?}", args.tls);
        let https = instance.add_https_listener(&http, &args.tls)?;
        https.start(&args.https_listen).await?;
    }

    let client = Client::try_default().await?;
    controller::run(client, instance).await
}
