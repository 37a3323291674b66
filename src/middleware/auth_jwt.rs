//! JWT authentication middleware — HS256 signature verification
//!
//! The token is pulled from a configurable location (`header:Name`,
//! `query:name` or `cookie:name`). The signature is verified with the
//! shared secret; the `exp` claim is enforced only when present; the `sub`
//! claim is exposed to later middlewares as the authenticated subject.

use crate::error::{GatewayError, Result};
use crate::middleware::{Middleware, RequestContext};
use crate::util::{str_or, string_list, ConfigMap};
use async_trait::async_trait;
use http::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::sync::Arc;

pub struct JwtAuthMiddleware {
    decoding_key: DecodingKey,
    validation: Validation,
    lookup: TokenLookup,
    skip_paths: Vec<String>,
}

enum TokenLookup {
    Header(String),
    Query(String),
    Cookie(String),
}

impl TokenLookup {
    /// Parse "header:Authorization" / "query:token" / "cookie:jwt".
    fn parse(lookup: &str) -> Self {
        let (source, key) = match lookup.split_once(':') {
            Some((source, key)) => (source, key),
            None => ("header", "Authorization"),
        };
        match source.to_ascii_lowercase().as_str() {
            "query" => Self::Query(key.to_string()),
            "cookie" => Self::Cookie(key.to_string()),
            _ => Self::Header(key.to_string()),
        }
    }

    fn extract(&self, req: &http::request::Parts) -> Option<String> {
        match self {
            Self::Header(name) => {
                let value = req.headers.get(name.as_str())?.to_str().ok()?;
                let token = match value.get(..7) {
                    Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => &value[7..],
                    _ => value,
                };
                Some(token.trim().to_string()).filter(|t| !t.is_empty())
            }
            Self::Query(name) => {
                let query = req.uri.query()?;
                query.split('&').find_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    (k == name && !v.is_empty()).then(|| v.to_string())
                })
            }
            Self::Cookie(name) => {
                let header = req.headers.get("cookie")?.to_str().ok()?;
                header.split(';').find_map(|pair| {
                    let (k, v) = pair.trim().split_once('=')?;
                    (k == name && !v.is_empty()).then(|| v.to_string())
                })
            }
        }
    }
}

impl JwtAuthMiddleware {
    pub fn factory(cfg: &ConfigMap) -> Result<Arc<dyn Middleware>> {
        let secret = str_or(cfg, "secret_key", "");
        if secret.is_empty() {
            return Err(GatewayError::Middleware(
                "auth_jwt.secret_key required".to_string(),
            ));
        }
        let lookup = TokenLookup::parse(&str_or(cfg, "token_lookup", "header:Authorization"));
        Ok(Arc::new(Self::new(
            &secret,
            lookup,
            string_list(cfg, "skip_paths"),
        )))
    }

    fn new(secret: &str, lookup: TokenLookup, skip_paths: Vec<String>) -> Self {
        // Signature only; exp is checked manually so that a token without
        // an exp claim stays valid.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = Default::default();

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            lookup,
            skip_paths,
        }
    }

    fn verify(&self, token: &str) -> std::result::Result<serde_json::Map<String, Value>, JwtDeny> {
        let data =
            jsonwebtoken::decode::<serde_json::Map<String, Value>>(
                token,
                &self.decoding_key,
                &self.validation,
            )
            .map_err(|_| JwtDeny::Invalid)?;
        if let Some(exp) = data.claims.get("exp").and_then(Value::as_f64) {
            let now = chrono::Utc::now().timestamp();
            if now > exp as i64 {
                return Err(JwtDeny::Expired);
            }
        }
        Ok(data.claims)
    }
}

#[derive(Debug, PartialEq)]
enum JwtDeny {
    Invalid,
    Expired,
}

fn unauthorized(body: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(401)
        .header("Content-Type", "application/json")
        .body(body.as_bytes().to_vec())
        .unwrap()
}

#[async_trait]
impl Middleware for JwtAuthMiddleware {
    async fn handle_request(
        &self,
        req: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>> {
        let path = req.uri.path();
        if self
            .skip_paths
            .iter()
            .any(|p| !p.is_empty() && path.starts_with(p.as_str()))
        {
            return Ok(None);
        }

        let Some(token) = self.lookup.extract(req) else {
            return Ok(Some(unauthorized(r#"{"error":"missing token"}"#)));
        };

        match self.verify(&token) {
            Ok(claims) => {
                if let Some(sub) = claims.get("sub").and_then(Value::as_str) {
                    ctx.auth_sub = Some(sub.to_string());
                }
                Ok(None)
            }
            Err(JwtDeny::Expired) => Ok(Some(unauthorized(r#"{"error":"token expired"}"#))),
            Err(JwtDeny::Invalid) => Ok(Some(unauthorized(r#"{"error":"invalid token"}"#))),
        }
    }

    fn name(&self) -> &str {
        "auth_jwt"
    }
}
