use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config_parser::AuthConfig;
use crate::error::{Error, ErrorDetails};

pub const SESSION_SECRET_ENV: &str = "PIXELFORGE_SESSION_SECRET";
pub const ADMIN_API_KEY_ENV: &str = "PIXELFORGE_ADMIN_API_KEY";

/// The authenticated user behind a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    exp: u64,
    iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Verifies HS256 session tokens carried in the session cookie or a bearer header.
/// Without a secret, sessions are disabled and every caller is anonymous.
#[derive(Clone)]
pub struct SessionAuth {
    keys: Option<Arc<SessionKeys>>,
    cookie_name: String,
    ttl: Duration,
}

impl SessionAuth {
    pub fn new(secret: Option<SecretString>, config: &AuthConfig) -> Self {
        let keys = secret.map(|secret| {
            let bytes = secret.expose_secret().as_bytes();
            Arc::new(SessionKeys {
                encoding: EncodingKey::from_secret(bytes),
                decoding: DecodingKey::from_secret(bytes),
            })
        });
        Self {
            keys,
            cookie_name: config.session_cookie.clone(),
            ttl: Duration::from_secs(config.session_ttl_secs),
        }
    }

    pub fn from_env(config: &AuthConfig) -> Self {
        let secret = std::env::var(SESSION_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        if secret.is_none() {
            tracing::warn!(
                "`{SESSION_SECRET_ENV}` is not set, so sessions are disabled and every caller is treated as anonymous"
            );
        }
        Self::new(secret, config)
    }

    pub fn is_enabled(&self) -> bool {
        self.keys.is_some()
    }

    /// Resolve the session carried by the request, if any.
    /// Missing, expired and forged tokens all resolve to `None`.
    pub fn resolve_session(&self, headers: &HeaderMap) -> Option<UserContext> {
        let keys = self.keys.as_ref()?;
        let token = session_cookie(headers, &self.cookie_name).or_else(|| bearer_token(headers))?;

        let validation = Validation::new(Algorithm::HS256);
        match jsonwebtoken::decode::<SessionClaims>(token, &keys.decoding, &validation) {
            Ok(data) if !data.claims.sub.is_empty() => Some(UserContext {
                user_id: data.claims.sub,
                email: data.claims.email,
            }),
            Ok(_) => {
                tracing::debug!("Ignoring session token with an empty subject");
                None
            }
            Err(e) => {
                tracing::debug!("Ignoring invalid session token: {e}");
                None
            }
        }
    }

    /// Mint a session token for `user_id`
    pub fn issue_token(&self, user_id: &str, email: Option<&str>) -> Result<String, Error> {
        let keys = self.keys.as_ref().ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: format!("Cannot issue session tokens without `{SESSION_SECRET_ENV}`"),
            })
        })?;
        let iat = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = SessionClaims {
            sub: user_id.to_string(),
            exp: iat + self.ttl.as_secs(),
            iat,
            email: email.map(str::to_string),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding).map_err(
            |e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("Failed to encode session token: {e}"),
                })
            },
        )
    }
}

fn session_cookie<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn hash_admin_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pixelforge-admin-");
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Guards the internal routes. Only the digest of the configured key is kept in memory.
#[derive(Clone, Default)]
pub struct AdminAuth {
    key_digest: Option<Arc<str>>,
}

impl AdminAuth {
    pub fn new(api_key: Option<SecretString>) -> Self {
        Self {
            key_digest: api_key.map(|key| Arc::from(hash_admin_key(key.expose_secret()))),
        }
    }

    pub fn from_env() -> Self {
        let api_key = std::env::var(ADMIN_API_KEY_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            tracing::info!("`{ADMIN_API_KEY_ENV}` is not set, so internal routes are disabled");
        }
        Self::new(api_key)
    }

    pub fn is_enabled(&self) -> bool {
        self.key_digest.is_some()
    }

    pub fn verify(&self, presented: &str) -> bool {
        match &self.key_digest {
            Some(digest) => hash_admin_key(presented).as_str() == digest.as_ref(),
            None => false,
        }
    }
}

pub async fn require_admin_key(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    if !auth.is_enabled() {
        return Err(Error::new(ErrorDetails::Unauthorized {
            message: "Internal routes are disabled".to_string(),
        }));
    }
    let key = bearer_token(request.headers()).ok_or_else(|| {
        Error::new(ErrorDetails::Unauthorized {
            message: "Missing authorization header".to_string(),
        })
    })?;
    if !auth.verify(key) {
        return Err(Error::new(ErrorDetails::Unauthorized {
            message: "Invalid admin API key".to_string(),
        }));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn session_auth() -> SessionAuth {
        SessionAuth::new(
            Some(SecretString::from("test-secret".to_string())),
            &AuthConfig::default(),
        )
    }

    #[test]
    fn test_cookie_session_round_trip() {
        let auth = session_auth();
        let token = auth.issue_token("user-1", Some("a@example.com")).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; pixelforge-session={token}")).unwrap(),
        );
        let user = auth.resolve_session(&headers).unwrap();
        assert_eq!(user.user_id, "user-1");
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_bearer_session() {
        let auth = session_auth();
        let token = auth.issue_token("user-2", None).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert_eq!(auth.resolve_session(&headers).unwrap().user_id, "user-2");
    }

    #[test]
    fn test_forged_token_is_anonymous() {
        let other = SessionAuth::new(
            Some(SecretString::from("another-secret".to_string())),
            &AuthConfig::default(),
        );
        let token = other.issue_token("mallory", None).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert!(session_auth().resolve_session(&headers).is_none());
    }

    #[test]
    fn test_disabled_sessions() {
        let auth = SessionAuth::new(None, &AuthConfig::default());
        assert!(!auth.is_enabled());
        assert!(auth.issue_token("user-1", None).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("pixelforge-session=abc"),
        );
        assert!(auth.resolve_session(&headers).is_none());
    }

    #[test]
    fn test_admin_key_verification() {
        let auth = AdminAuth::new(Some(SecretString::from("s3cret".to_string())));
        assert!(auth.verify("s3cret"));
        assert!(!auth.verify("s3cret "));
        assert!(!AdminAuth::default().verify("s3cret"));
    }
}
