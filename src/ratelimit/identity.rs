//! Identity key derivation from inbound requests.

use std::net::{IpAddr, SocketAddr};

use axum::http::{HeaderMap, HeaderName};
use tracing::{debug, trace};

/// Default header carrying the caller's API key.
pub const DEFAULT_API_KEY_HEADER: &str = "API_KEY";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// What a key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// Value of the API-key header
    Token,
    /// Client address
    Ip,
}

impl IdentityKind {
    fn prefix(&self) -> &'static str {
        match self {
            IdentityKind::Token => "token",
            IdentityKind::Ip => "ip",
        }
    }
}

/// A key that uniquely identifies a rate-limited principal.
///
/// Rendered as `token:<value>` or `ip:<value>`. Two keys are equal only if
/// both kind and value match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    kind: IdentityKind,
    value: String,
}

impl IdentityKey {
    /// Key for an API token.
    pub fn token(value: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Token,
            value: value.into(),
        }
    }

    /// Key for a client address.
    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Ip,
            value: value.into(),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    /// The raw token or address, without the kind prefix.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.value)
    }
}

/// Derives identity keys from request metadata.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    header: HeaderName,
    trusted_proxies: Vec<IpAddr>,
}

impl IdentityResolver {
    /// Create a resolver reading the given API-key header.
    ///
    /// Header names are case-insensitive; an invalid name falls back to
    /// [`DEFAULT_API_KEY_HEADER`].
    pub fn new(header: &str) -> Self {
        let header = HeaderName::try_from(header).unwrap_or_else(|_| {
            HeaderName::from_static("api_key")
        });
        Self {
            header,
            trusted_proxies: Vec::new(),
        }
    }

    /// Trust forwarding headers when the peer is one of `proxies`.
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// Resolve the identity for a request.
    ///
    /// A present, non-empty API-key header wins. Otherwise the client
    /// address is used, or `ip:unknown` when none is available.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> IdentityKey {
        if let Some(token) = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            trace!(header = %self.header, "Using API key for rate limiting");
            return IdentityKey::token(token);
        }

        match peer {
            Some(peer) => IdentityKey::ip(self.client_ip(headers, peer.ip())),
            None => {
                debug!("No peer address available, using 'unknown'");
                IdentityKey::ip("unknown")
            }
        }
    }

    fn client_ip(&self, headers: &HeaderMap, peer_ip: IpAddr) -> String {
        if !self.trusted_proxies.contains(&peer_ip) {
            return peer_ip.to_string();
        }

        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(client_ip) = forwarded {
            debug!(client_ip = %client_ip, peer_ip = %peer_ip, "Extracted IP from X-Forwarded-For");
            return client_ip.to_string();
        }

        if let Some(real_ip) = headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            debug!(client_ip = %real_ip, peer_ip = %peer_ip, "Extracted IP from X-Real-IP");
            return real_ip.to_string();
        }

        peer_ip.to_string()
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_API_KEY_HEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_identity_key_display() {
        assert_eq!(IdentityKey::token("abc123").to_string(), "token:abc123");
        assert_eq!(IdentityKey::ip("10.0.0.1").to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_identity_key_kinds_are_distinct() {
        assert_ne!(IdentityKey::token("10.0.0.1"), IdentityKey::ip("10.0.0.1"));
        assert_eq!(IdentityKey::token("abc"), IdentityKey::token("abc"));
    }

    #[test]
    fn test_resolve_uses_api_key_header() {
        let resolver = IdentityResolver::default();
        let mut headers = HeaderMap::new();
        headers.insert("api_key", HeaderValue::from_static("test_api_key"));

        let key = resolver.resolve(&headers, peer("127.0.0.1:8080"));
        assert_eq!(key, IdentityKey::token("test_api_key"));
        assert_eq!(key.kind(), IdentityKind::Token);
    }

    #[test]
    fn test_resolve_falls_back_to_peer_ip() {
        let resolver = IdentityResolver::default();
        let key = resolver.resolve(&HeaderMap::new(), peer("127.0.0.1:8080"));
        assert_eq!(key.to_string(), "ip:127.0.0.1");
    }

    #[test]
    fn test_resolve_ignores_empty_api_key() {
        let resolver = IdentityResolver::default();
        let mut headers = HeaderMap::new();
        headers.insert("api_key", HeaderValue::from_static("   "));

        let key = resolver.resolve(&headers, peer("192.168.1.7:51000"));
        assert_eq!(key, IdentityKey::ip("192.168.1.7"));
    }

    #[test]
    fn test_resolve_without_peer() {
        let resolver = IdentityResolver::default();
        let key = resolver.resolve(&HeaderMap::new(), None);
        assert_eq!(key, IdentityKey::ip("unknown"));
    }

    #[test]
    fn test_custom_header_name() {
        let resolver = IdentityResolver::new("X-Api-Key");
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k1"));

        let key = resolver.resolve(&headers, peer("127.0.0.1:1"));
        assert_eq!(key, IdentityKey::token("k1"));
    }

    #[test]
    fn test_forwarded_for_only_from_trusted_proxy() {
        let resolver = IdentityResolver::default()
            .with_trusted_proxies(vec!["10.0.0.1".parse().unwrap()]);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );

        let trusted = resolver.resolve(&headers, peer("10.0.0.1:4000"));
        assert_eq!(trusted, IdentityKey::ip("203.0.113.9"));

        let untrusted = resolver.resolve(&headers, peer("10.0.0.2:4000"));
        assert_eq!(untrusted, IdentityKey::ip("10.0.0.2"));
    }

    #[test]
    fn test_real_ip_fallback_from_trusted_proxy() {
        let resolver = IdentityResolver::default()
            .with_trusted_proxies(vec!["::1".parse().unwrap()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));

        let key = resolver.resolve(&headers, peer("[::1]:9000"));
        assert_eq!(key, IdentityKey::ip("198.51.100.4"));
    }
}
