//! Per-issuer OIDC provider: discovery, JWKS, and token verification

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::error::{OidcError, Result};
use crate::token::{AuthInfo, Token};

/// A verifier for tokens issued by one (issuer, audience) pair.
///
/// Discovery metadata and the JWKS are fetched lazily on first use and
/// cached for the provider's lifetime. A failed fetch leaves the cache
/// unpopulated so a later request retries.
pub struct Provider {
    base_url: Url,
    audience: String,
    http: reqwest::Client,
    metadata: OnceCell<ProviderMetadata>,
    keys: OnceCell<KeySet>,
}

/// The subset of OIDC discovery metadata the gateway needs
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ProviderMetadata {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub jwks_uri: String,
}

/// Verification keys published by the provider, indexed by key id
pub(crate) struct KeySet {
    pub keys: HashMap<String, DecodingKey>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<JsonWebKey>,
}

#[derive(Debug, Deserialize)]
struct JsonWebKey {
    #[serde(default)]
    kty: String,
    #[serde(default)]
    kid: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

impl Provider {
    /// Create a provider for the given issuer and expected audience
    pub fn new(issuer: &str, audience: &str) -> Result<Self> {
        let base_url =
            Url::parse(issuer).map_err(|err| OidcError::IssuerUrl(format!("{issuer:?}: {err}")))?;
        Ok(Self {
            base_url,
            audience: audience.to_string(),
            http: reqwest::Client::new(),
            metadata: OnceCell::new(),
            keys: OnceCell::new(),
        })
    }

    /// Verify a parsed token against this provider.
    ///
    /// `Ok(None)` means the token is not acceptable to this provider
    /// (not issued by it, wrong audience, expired, bad signature);
    /// `Err` means the provider itself could not be consulted.
    pub async fn verify_token(&self, token: &Token) -> Result<Option<AuthInfo>> {
        if token.header.kid.is_empty() || token.header.typ != "JWT" {
            debug!("key id not set / not a jwt");
            return Ok(None);
        }

        let metadata = self
            .metadata
            .get_or_try_init(|| self.fetch_metadata())
            .await?;

        if token.payload.iss != metadata.issuer {
            // Not issued by this provider
            debug!("issuer does not match");
            return Ok(None);
        }

        if token.payload.aud != self.audience {
            // Issued by this provider, but not intended for us
            debug!("audience does not match");
            return Ok(None);
        }

        let now = unix_now();
        if now > token.payload.exp {
            debug!("token has expired");
            return Ok(None);
        }
        if now < token.payload.iat {
            debug!("token issued-at time not yet reached");
            return Ok(None);
        }

        let keys = self
            .keys
            .get_or_try_init(|| self.fetch_key_set(metadata))
            .await?;

        let key = match keys.keys.get(&token.header.kid) {
            Some(key) => key,
            None => {
                debug!("no key with key id {:?}", token.header.kid);
                return Ok(None);
            }
        };

        match token.header.alg.as_str() {
            "RS256" => {
                if !verify_rs256(&token.raw, key) {
                    debug!("token signature was not valid");
                    return Ok(None);
                }
            }
            // Not every algorithm is supported, in particular not "none"
            alg => {
                debug!("token algorithm {:?} not supported", alg);
                return Ok(None);
            }
        }

        Ok(Some(AuthInfo {
            issuer: token.payload.iss.clone(),
            subject: token.payload.sub.clone(),
        }))
    }

    async fn fetch_metadata(&self) -> Result<ProviderMetadata> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| OidcError::IssuerUrl("issuer url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(".well-known")
            .push("openid-configuration");

        let body = self.get_url(url).await?;
        let metadata: ProviderMetadata = serde_json::from_slice(&body)?;
        Ok(metadata)
    }

    async fn fetch_key_set(&self, metadata: &ProviderMetadata) -> Result<KeySet> {
        if metadata.jwks_uri.is_empty() {
            return Err(OidcError::KeySet("jwks_uri is not valid".to_string()));
        }
        let url = Url::parse(&metadata.jwks_uri)
            .map_err(|err| OidcError::KeySet(format!("jwks_uri is not valid: {err}")))?;

        let body = self.get_url(url).await?;
        let document: JwksDocument = serde_json::from_slice(&body)?;
        parse_key_set(document)
    }

    async fn get_url(&self, url: Url) -> Result<bytes::Bytes> {
        let response = self.http.get(url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(OidcError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

fn parse_key_set(document: JwksDocument) -> Result<KeySet> {
    let mut keys = HashMap::new();
    for key in &document.keys {
        if key.kid.is_empty() {
            return Err(OidcError::KeySet("missing key id parameter".to_string()));
        }
        keys.insert(key.kid.clone(), parse_key(key)?);
    }
    Ok(KeySet { keys })
}

fn parse_key(key: &JsonWebKey) -> Result<DecodingKey> {
    match key.kty.as_str() {
        "RSA" => parse_rsa_key(key),
        kty => Err(OidcError::KeySet(format!("key type {kty:?} not handled"))),
    }
}

fn parse_rsa_key(key: &JsonWebKey) -> Result<DecodingKey> {
    decode_big_int(&key.n)?;
    let e = decode_big_int(&key.e)?;
    if e.len() > 8 {
        return Err(OidcError::KeySet(
            "invalid e value - does not fit in 64 bits".to_string(),
        ));
    }
    DecodingKey::from_rsa_components(&key.n, &key.e)
        .map_err(|err| OidcError::KeySet(format!("invalid rsa components: {err}")))
}

fn decode_big_int(value: &str) -> Result<Vec<u8>> {
    if value.is_empty() {
        return Err(OidcError::KeySet("required parameter not set".to_string()));
    }
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| OidcError::KeySet("parameter is not valid base64".to_string()))
}

/// Verify an RS256 signature over the literal `header.payload` bytes
fn verify_rs256(raw: &str, key: &DecodingKey) -> bool {
    let components: Vec<&str> = raw.split('.').collect();
    if components.len() != 3 {
        return false;
    }
    let message = format!("{}.{}", components[0], components[1]);
    jsonwebtoken::crypto::verify(components[2], message.as_bytes(), key, Algorithm::RS256)
        .unwrap_or(false)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
