//! Caller identity resolution.
//!
//! An identity is assembled from three independent signals: the session, a
//! client-computed device fingerprint and the forwarded client IP. Free quota is
//! tracked against the most specific of these, in the fixed order
//! fingerprint > IP > user id. Fingerprints and forwarded IPs are client-controlled,
//! so the quota can be evaded by a determined caller.

use axum::http::{HeaderMap, HeaderName};
use serde::{Deserialize, Serialize};

use crate::auth::{SessionAuth, UserContext};
use crate::config_parser::AuthConfig;
use crate::error::{Error, ErrorDetails};

pub const UNKNOWN_IP: &str = "unknown";
const MAX_FINGERPRINT_LEN: usize = 128;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrackingMethod {
    Fingerprint,
    Ip,
    User,
    None,
}

/// A storage key for the usage ledger, e.g. `fp:3f2a...` or `ip:203.0.113.7`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub tracking_method: TrackingMethod,
    pub key: String,
}

impl IdentityKey {
    fn new(tracking_method: TrackingMethod, value: &str) -> Self {
        let prefix = match tracking_method {
            TrackingMethod::Fingerprint => "fp",
            TrackingMethod::Ip => "ip",
            TrackingMethod::User => "user",
            TrackingMethod::None => "none",
        };
        Self {
            tracking_method,
            key: format!("{prefix}:{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityContext {
    pub user: Option<UserContext>,
    pub fingerprint_hash: Option<String>,
    pub ip_address: String,
}

impl IdentityContext {
    pub fn anonymous(ip_address: &str) -> Self {
        Self {
            user: None,
            fingerprint_hash: None,
            ip_address: ip_address.to_string(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.user_id.as_str())
    }

    /// The most specific usable key, or `None` when the caller can't be tracked at all
    pub fn tracking_key(&self) -> Option<IdentityKey> {
        if let Some(fingerprint) = &self.fingerprint_hash {
            return Some(IdentityKey::new(TrackingMethod::Fingerprint, fingerprint));
        }
        if self.ip_address != UNKNOWN_IP && !self.ip_address.is_empty() {
            return Some(IdentityKey::new(TrackingMethod::Ip, &self.ip_address));
        }
        self.user_id()
            .map(|user_id| IdentityKey::new(TrackingMethod::User, user_id))
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    session_auth: SessionAuth,
    fingerprint_header: HeaderName,
}

impl IdentityResolver {
    pub fn new(session_auth: SessionAuth, config: &AuthConfig) -> Result<Self, Error> {
        let fingerprint_header = HeaderName::from_bytes(config.fingerprint_header.as_bytes())
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!(
                        "Invalid fingerprint header name `{}`: {e}",
                        config.fingerprint_header
                    ),
                })
            })?;
        Ok(Self {
            session_auth,
            fingerprint_header,
        })
    }

    pub fn session_auth(&self) -> &SessionAuth {
        &self.session_auth
    }

    pub fn resolve(&self, headers: &HeaderMap) -> IdentityContext {
        IdentityContext {
            user: self.session_auth.resolve_session(headers),
            fingerprint_hash: extract_fingerprint(headers, &self.fingerprint_header),
            ip_address: extract_client_ip(headers),
        }
    }
}

/// First hop of `x-forwarded-for`, then `x-real-ip`, then `cf-connecting-ip`
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim);

    forwarded
        .into_iter()
        .chain(
            ["x-real-ip", "cf-connecting-ip"]
                .iter()
                .filter_map(|name| headers.get(*name))
                .filter_map(|v| v.to_str().ok())
                .map(str::trim),
        )
        .find(|ip| !ip.is_empty())
        .unwrap_or(UNKNOWN_IP)
        .to_string()
}

fn extract_fingerprint(headers: &HeaderMap, header_name: &HeaderName) -> Option<String> {
    let value = headers.get(header_name)?.to_str().ok()?.trim();
    let valid = !value.is_empty()
        && value.len() <= MAX_FINGERPRINT_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        tracing::debug!("Ignoring malformed fingerprint header");
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::str::FromStr;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn resolver() -> IdentityResolver {
        let config = AuthConfig::default();
        IdentityResolver::new(SessionAuth::new(None, &config), &config).unwrap()
    }

    #[test]
    fn test_ip_precedence() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(extract_client_ip(&h), "203.0.113.7");

        let h = headers(&[("x-real-ip", "198.51.100.2"), ("cf-connecting-ip", "192.0.2.9")]);
        assert_eq!(extract_client_ip(&h), "198.51.100.2");

        let h = headers(&[("cf-connecting-ip", "192.0.2.9")]);
        assert_eq!(extract_client_ip(&h), "192.0.2.9");

        assert_eq!(extract_client_ip(&HeaderMap::new()), UNKNOWN_IP);
    }

    #[test]
    fn test_fingerprint_validation() {
        let resolver = resolver();

        let ctx = resolver.resolve(&headers(&[("x-fingerprint-hash", "abc_123-XYZ")]));
        assert_eq!(ctx.fingerprint_hash.as_deref(), Some("abc_123-XYZ"));

        let ctx = resolver.resolve(&headers(&[("x-fingerprint-hash", "abc;drop table")]));
        assert_eq!(ctx.fingerprint_hash, None);

        let long = "a".repeat(MAX_FINGERPRINT_LEN + 1);
        let mut h = HeaderMap::new();
        h.insert("x-fingerprint-hash", HeaderValue::from_str(&long).unwrap());
        assert_eq!(resolver.resolve(&h).fingerprint_hash, None);
    }

    #[test]
    fn test_tracking_key_precedence() {
        let mut ctx = IdentityContext {
            user: Some(UserContext {
                user_id: "u1".to_string(),
                email: None,
            }),
            fingerprint_hash: Some("fphash".to_string()),
            ip_address: "203.0.113.7".to_string(),
        };
        let key = ctx.tracking_key().unwrap();
        assert_eq!(key.tracking_method, TrackingMethod::Fingerprint);
        assert_eq!(key.key, "fp:fphash");

        ctx.fingerprint_hash = None;
        assert_eq!(ctx.tracking_key().unwrap().key, "ip:203.0.113.7");

        ctx.ip_address = UNKNOWN_IP.to_string();
        assert_eq!(ctx.tracking_key().unwrap().key, "user:u1");

        ctx.user = None;
        assert!(ctx.tracking_key().is_none());
    }

    #[test]
    fn test_tracking_method_strings() {
        assert_eq!(TrackingMethod::Fingerprint.to_string(), "fingerprint");
        assert_eq!(TrackingMethod::from_str("ip").unwrap(), TrackingMethod::Ip);
        assert_eq!(
            serde_json::to_value(TrackingMethod::None).unwrap(),
            serde_json::json!("none")
        );
    }
}
