//! Core of the Portico HTTP/HTTPS gateway
//!
//! This library provides:
//! - A concurrently-readable, atomically-updatable route table driven
//!   by declarative route objects
//! - A request filter pipeline (OIDC authentication, external gRPC
//!   processing) with a short-circuit protocol
//! - A reverse proxy with optional identity-bound mTLS toward backends
//! - HTTP and HTTPS listeners with SNI-driven certificate selection

pub mod error;
pub mod filter;
pub mod filter_external;
pub mod filter_oidc;
pub mod identity;
pub mod instance;
pub mod listener;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod rule;
pub mod tls;

pub use error::{GatewayError, Result};
pub use filter::Filter;
pub use filter_external::ExternalProcessorFilter;
pub use filter_oidc::OidcAuthFilter;
pub use identity::{DiskIdentitySource, IdentitySource, ServerIdTemplate, Svid};
pub use instance::Instance;
pub use listener::{ConnInfo, HttpListener, ServerTimeouts};
pub use metrics::MetricsCollector;
pub use routes::{Route, RouteId};
pub use tls::{HttpsListener, TlsEntry};
