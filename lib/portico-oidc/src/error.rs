use thiserror::Error;

pub type Result<T> = std::result::Result<T, OidcError>;

/// Infrastructure failures while talking to an OIDC provider.
///
/// Semantic token rejection is not an error; it is signalled as
/// `Ok(None)` by the verification entry points.
#[derive(Error, Debug)]
pub enum OidcError {
    #[error("invalid issuer url: {0}")]
    IssuerUrl(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http response status {0}")]
    Status(u16),

    #[error("parsing provider response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key set: {0}")]
    KeySet(String),

    #[error("verification failed against {} provider(s)", .0.len())]
    Providers(Vec<OidcError>),
}
