//! OIDC authentication filter
//!
//! Requests carrying a valid `auth-token` cookie pass through; requests
//! without one (or with a rejected token) are redirected to the login
//! page. Only infrastructure failures, in the filter or in the
//! verifier, produce a bad-gateway response.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{COOKIE, HOST, LOCATION};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use kube::Api;
use portico_api::v1alpha1::oidc_auth::OIDCAuthSpec;
use portico_api::OIDCAuth;
use portico_oidc::{verify_token, Provider};
use tracing::{error, info};
use url::Url;

use crate::error::{GatewayError, Result};
use crate::filter::Filter;
use crate::listener::ConnInfo;
use crate::proxy::bad_gateway;

pub struct OidcAuthFilter {
    login_url: String,
    providers: Vec<Provider>,
}

impl std::fmt::Debug for OidcAuthFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcAuthFilter")
            .field("login_url", &self.login_url)
            .finish()
    }
}

impl OidcAuthFilter {
    /// Create the filter directly from an OIDCAuth spec
    pub fn new(spec: &OIDCAuthSpec) -> Result<Self> {
        let provider = Provider::new(&spec.issuer, &spec.audience)
            .map_err(|err| GatewayError::FilterConfig(format!("building provider: {err}")))?;
        Ok(Self {
            login_url: spec.login_url.clone(),
            providers: vec![provider],
        })
    }

    /// Resolve the referenced OIDCAuth object and build the filter
    pub(crate) async fn build(
        client: Option<&kube::Client>,
        namespace: &str,
        name: &str,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(GatewayError::FilterConfig("name not set".to_string()));
        }
        let client = client.ok_or_else(|| {
            GatewayError::FilterConfig("no api client to resolve oidcauth reference".to_string())
        })?;

        let api: Api<OIDCAuth> = Api::namespaced(client.clone(), namespace);
        let obj = api.get(name).await.map_err(|err| {
            GatewayError::FilterConfig(format!("getting oidcauth object {namespace}/{name}: {err}"))
        })?;

        Self::new(&obj.spec)
    }

    /// 303 redirect to the login page, carrying the fully-qualified
    /// request URL (scheme forced to https) as the `redirect` parameter
    fn login_redirect(
        &self,
        req: &http::request::Parts,
    ) -> std::result::Result<Response<Full<Bytes>>, url::ParseError> {
        let mut login_url = Url::parse(&self.login_url)?;

        let host = req
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| req.uri.host())
            .unwrap_or_default();
        let path_and_query = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let redirect = format!("https://{host}{path_and_query}");

        login_url
            .query_pairs_mut()
            .append_pair("redirect", &redirect);

        Ok(Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(LOCATION, login_url.as_str())
            .body(Full::new(Bytes::new()))
            .unwrap())
    }
}

#[async_trait]
impl Filter for OidcAuthFilter {
    async fn handle(
        &self,
        req: &mut http::request::Parts,
        _conn: &ConnInfo,
    ) -> Option<Response<Full<Bytes>>> {
        let mut jwt = match auth_cookie(&req.headers) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                error!("error reading auth cookie: {}", err);
                return Some(bad_gateway());
            }
        };

        if !jwt.is_empty() {
            match verify_token(&jwt, &self.providers).await {
                Ok(Some(_auth)) => {}
                Ok(None) => {
                    info!("rejecting invalid sso token");
                    jwt.clear();
                }
                Err(err) => {
                    // An internal error, not a bad token
                    error!("error verifying token: {}", err);
                    return Some(bad_gateway());
                }
            }
        }

        if jwt.is_empty() {
            return Some(self.login_redirect(req).unwrap_or_else(|err| {
                error!("error parsing login url {:?}: {}", self.login_url, err);
                bad_gateway()
            }));
        }

        None
    }
}

/// Find the `auth-token` cookie. An unreadable Cookie header is an
/// error (surfaced as 502 by the caller), a missing cookie is not.
fn auth_cookie(
    headers: &http::HeaderMap,
) -> std::result::Result<Option<String>, http::header::ToStrError> {
    for value in headers.get_all(COOKIE) {
        let value = value.to_str()?;
        for pair in value.split(';') {
            if let Some((name, cookie_value)) = pair.trim().split_once('=') {
                if name == "auth-token" {
                    return Ok(Some(cookie_value.to_string()));
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use hyper::Request;

    fn filter() -> OidcAuthFilter {
        OidcAuthFilter::new(&OIDCAuthSpec {
            issuer: "https://issuer.example.com".to_string(),
            audience: "portico".to_string(),
            login_url: "https://login.example.com/start".to_string(),
        })
        .unwrap()
    }

    fn request_parts(uri: &str, host: &str) -> http::request::Parts {
        let (parts, _) = Request::builder()
            .uri(uri)
            .header(HOST, host)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_auth_cookie_found() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("session=abc; auth-token=tok123; theme=dark"),
        );
        assert_eq!(auth_cookie(&headers).unwrap().as_deref(), Some("tok123"));
    }

    #[test]
    fn test_auth_cookie_absent() {
        let mut headers = http::HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session=abc"));
        assert_eq!(auth_cookie(&headers).unwrap(), None);
        assert_eq!(auth_cookie(&http::HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_auth_cookie_unreadable_is_an_error() {
        let mut headers = http::HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_bytes(b"auth-token=\xff").unwrap());
        assert!(auth_cookie(&headers).is_err());
    }

    #[tokio::test]
    async fn test_no_cookie_redirects_to_login() {
        let filter = filter();
        let mut parts = request_parts("/docs/page?q=1", "a.example.com");

        let response = filter.handle(&mut parts, &ConnInfo::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let location = response.headers()[LOCATION].to_str().unwrap();
        let location = Url::parse(location).unwrap();
        assert_eq!(location.host_str(), Some("login.example.com"));
        let redirect = location
            .query_pairs()
            .find(|(key, _)| key == "redirect")
            .map(|(_, value)| value.to_string())
            .unwrap();
        assert_eq!(redirect, "https://a.example.com/docs/page?q=1");
    }

    #[tokio::test]
    async fn test_invalid_token_redirects_to_login() {
        let filter = filter();
        let mut parts = request_parts("/docs", "a.example.com");
        parts
            .headers
            .insert(COOKIE, HeaderValue::from_static("auth-token=not-a-jwt"));

        // A rejected token is treated the same as no token at all.
        let response = filter.handle(&mut parts, &ConnInfo::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn test_unreadable_cookie_is_bad_gateway() {
        let filter = filter();
        let mut parts = request_parts("/", "a.example.com");
        parts
            .headers
            .insert(COOKIE, HeaderValue::from_bytes(b"auth-token=\xff").unwrap());

        let response = filter.handle(&mut parts, &ConnInfo::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_bad_login_url_is_bad_gateway() {
        let filter = OidcAuthFilter::new(&OIDCAuthSpec {
            issuer: "https://issuer.example.com".to_string(),
            audience: "portico".to_string(),
            login_url: "not a url".to_string(),
        })
        .unwrap();
        let mut parts = request_parts("/", "a.example.com");

        let response = filter.handle(&mut parts, &ConnInfo::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
