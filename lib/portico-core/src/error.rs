use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("filter configuration error: {0}")]
    FilterConfig(String),

    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
