//! JWT parsing

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A parsed but not yet verified JWT
#[derive(Clone, Debug)]
pub struct Token {
    /// The raw three-part compact serialization
    pub raw: String,
    pub header: JwtHeader,
    pub payload: JwtPayload,
}

/// JOSE header of a JWT
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JwtHeader {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kid: String,
}

/// Registered claims carried by tokens we accept
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JwtPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aud: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
}

/// Identity established by a successfully verified token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthInfo {
    pub issuer: String,
    pub subject: String,
}

impl Token {
    /// Parse a compact JWT. Returns None for anything malformed: the
    /// wrong number of components, non-base64url (or padded) encoding,
    /// or unparseable JSON. Signature verification happens later.
    pub fn parse(raw: &str) -> Option<Token> {
        let components: Vec<&str> = raw.split('.').collect();
        if components.len() != 3 {
            debug!("jwt did not have expected number of components");
            return None;
        }

        let header_bytes = match URL_SAFE_NO_PAD.decode(components[0]) {
            Ok(b) => b,
            Err(_) => {
                debug!("jwt header had invalid base64");
                return None;
            }
        };
        let payload_bytes = match URL_SAFE_NO_PAD.decode(components[1]) {
            Ok(b) => b,
            Err(_) => {
                debug!("jwt payload had invalid base64");
                return None;
            }
        };

        let header: JwtHeader = match serde_json::from_slice(&header_bytes) {
            Ok(h) => h,
            Err(err) => {
                debug!("error parsing jwt header: {}", err);
                return None;
            }
        };
        let payload: JwtPayload = match serde_json::from_slice(&payload_bytes) {
            Ok(p) => p,
            Err(err) => {
                debug!("error parsing jwt payload: {}", err);
                return None;
            }
        };

        Some(Token {
            raw: raw.to_string(),
            header,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;

    fn encode_parts(header: &str, payload: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_parse_valid() {
        let raw = encode_parts(
            r#"{"alg":"RS256","typ":"JWT","kid":"k1"}"#,
            r#"{"iss":"https://issuer.example.com","aud":"portico","sub":"alice","exp":2000000000,"iat":1000000000}"#,
        );
        let token = Token::parse(&raw).unwrap();
        assert_eq!(token.header.alg, "RS256");
        assert_eq!(token.header.kid, "k1");
        assert_eq!(token.payload.sub, "alice");
        assert_eq!(token.payload.exp, 2000000000);
    }

    #[test]
    fn test_parse_wrong_component_count() {
        assert!(Token::parse("onlyone").is_none());
        assert!(Token::parse("two.parts").is_none());
        assert!(Token::parse("a.b.c.d").is_none());
    }

    #[test]
    fn test_parse_rejects_padded_base64() {
        // Same content, but padded encoding: must be rejected.
        let header = URL_SAFE.encode(r#"{"alg":"RS256","typ":"JWT","kid":"k1"}"#);
        assert!(header.ends_with('='));
        let raw = format!("{}.{}.sig", header, URL_SAFE_NO_PAD.encode("{}"));
        assert!(Token::parse(&raw).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        let raw = format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode("not json"),
            URL_SAFE_NO_PAD.encode("{}")
        );
        assert!(Token::parse(&raw).is_none());
    }

    #[test]
    fn test_parse_missing_claims_default() {
        let raw = encode_parts(r#"{"alg":"RS256"}"#, r#"{}"#);
        let token = Token::parse(&raw).unwrap();
        assert!(token.header.kid.is_empty());
        assert_eq!(token.payload.exp, 0);
    }
}
