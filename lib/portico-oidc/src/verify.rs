//! Token verification across a set of providers

use tracing::debug;

use crate::error::{OidcError, Result};
use crate::provider::Provider;
use crate::token::{AuthInfo, Token};

/// Verify a raw token against each provider in order.
///
/// An optional `Bearer ` prefix is stripped. The first provider that
/// accepts the token wins. Per-provider infrastructure errors are
/// collected and surfaced only if no provider accepted the token;
/// semantic rejection by every provider is `Ok(None)`.
pub async fn verify_token(raw: &str, providers: &[Provider]) -> Result<Option<AuthInfo>> {
    let raw = raw.strip_prefix("Bearer ").unwrap_or(raw);

    let token = match Token::parse(raw) {
        Some(token) => token,
        None => return Ok(None),
    };

    let mut errors = Vec::new();
    for provider in providers {
        match provider.verify_token(&token).await {
            Ok(Some(auth)) => return Ok(Some(auth)),
            Ok(None) => {}
            Err(err) => {
                debug!("provider verification error: {}", err);
                errors.push(err);
            }
        }
    }

    if errors.is_empty() {
        Ok(None)
    } else {
        Err(OidcError::Providers(errors))
    }
}
