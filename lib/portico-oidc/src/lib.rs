//! OIDC provider discovery and JWT verification
//!
//! This library provides:
//! - Per-issuer providers that fetch and cache OIDC discovery metadata
//!   and the provider's JWKS
//! - RS256 JWT verification with iss/aud/exp/iat claim enforcement
//!
//! Verification has two failure channels: a token that is merely invalid
//! (wrong issuer, expired, bad signature) yields `Ok(None)`, while an
//! infrastructure failure talking to the provider yields `Err`. Callers
//! rely on the distinction to choose between a login redirect and a
//! bad-gateway response.

pub mod error;
pub mod provider;
pub mod token;
pub mod verify;

pub use error::OidcError;
pub use provider::Provider;
pub use token::{AuthInfo, JwtHeader, JwtPayload, Token};
pub use verify::verify_token;
