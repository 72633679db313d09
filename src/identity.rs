//! Client identity resolution for rate limiting.

use axum::http::HeaderMap;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const REAL_IP: &str = "x-real-ip";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no client address available")]
    Empty,

    #[error("missing port in address '{0}'")]
    MissingPort(String),

    #[error("malformed address '{0}'")]
    Malformed(String),
}

/// Key that partitions rate limit state per caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve an identity from a proxy-supplied header value and the raw
    /// connection address.
    ///
    /// A non-empty forwarded value wins and is used verbatim (first entry of
    /// a comma-separated list); it does not need a port. The connection
    /// address must be in `host:port` form.
    pub fn resolve(forwarded: Option<&str>, remote_addr: &str) -> Result<Self, IdentityError> {
        if let Some(first) = forwarded
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(Self(first.to_string()));
        }

        split_host(remote_addr).map(|host| Self(host.to_string()))
    }

    /// Resolve from request headers, falling back to the peer socket address.
    pub fn from_parts(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<Self, IdentityError> {
        let forwarded = [FORWARDED_FOR, REAL_IP]
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|value| value.to_str().ok())
            .find(|value| !value.trim().is_empty());

        let remote = peer.map(|addr| addr.to_string()).unwrap_or_default();
        Self::resolve(forwarded, &remote)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extract the host part of a `host:port` address. IPv6 hosts must be
/// bracketed (`[::1]:8080`).
fn split_host(addr: &str) -> Result<&str, IdentityError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(IdentityError::Empty);
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest
            .split_once(']')
            .ok_or_else(|| IdentityError::Malformed(addr.to_string()))?;
        return match port.strip_prefix(':') {
            Some(port) if !port.is_empty() && !host.is_empty() => Ok(host),
            Some(_) => Err(IdentityError::Malformed(addr.to_string())),
            None => Err(IdentityError::MissingPort(addr.to_string())),
        };
    }

    match addr.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err(IdentityError::Malformed(addr.to_string())),
        Some((host, port)) if !host.is_empty() && !port.is_empty() => Ok(host),
        Some(_) => Err(IdentityError::Malformed(addr.to_string())),
        None => Err(IdentityError::MissingPort(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_header_wins_over_connection() {
        let id = ClientIdentity::resolve(Some("203.0.113.7"), "127.0.0.1:40000").unwrap();
        assert_eq!(id.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_list_uses_first_entry() {
        let id = ClientIdentity::resolve(Some("198.51.100.4, 10.0.0.1"), "127.0.0.1:1").unwrap();
        assert_eq!(id.as_str(), "198.51.100.4");
    }

    #[test]
    fn test_connection_address_port_is_stripped() {
        let id = ClientIdentity::resolve(None, "192.0.2.10:54321").unwrap();
        assert_eq!(id.as_str(), "192.0.2.10");
    }

    #[test]
    fn test_ipv6_connection_address() {
        let id = ClientIdentity::resolve(None, "[2001:db8::1]:443").unwrap();
        assert_eq!(id.as_str(), "2001:db8::1");
    }

    #[test]
    fn test_blank_forwarded_header_falls_back() {
        let id = ClientIdentity::resolve(Some("  "), "192.0.2.10:80").unwrap();
        assert_eq!(id.as_str(), "192.0.2.10");
    }

    #[test]
    fn test_connection_address_requires_port() {
        assert_eq!(
            ClientIdentity::resolve(None, "192.0.2.10"),
            Err(IdentityError::MissingPort("192.0.2.10".to_string()))
        );
        assert_eq!(ClientIdentity::resolve(None, ""), Err(IdentityError::Empty));
        assert!(matches!(
            ClientIdentity::resolve(None, "2001:db8::1"),
            Err(IdentityError::Malformed(_))
        ));
        assert!(matches!(
            ClientIdentity::resolve(None, "[2001:db8::1]"),
            Err(IdentityError::MissingPort(_))
        ));
    }

    #[test]
    fn test_from_parts_prefers_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(REAL_IP, HeaderValue::from_static("203.0.113.1"));
        let peer: SocketAddr = "10.1.1.1:9000".parse().unwrap();

        let id = ClientIdentity::from_parts(&headers, Some(peer)).unwrap();
        assert_eq!(id.as_str(), "203.0.113.1");

        headers.insert(FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        let id = ClientIdentity::from_parts(&headers, Some(peer)).unwrap();
        assert_eq!(id.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_from_parts_without_peer_is_unresolvable() {
        let headers = HeaderMap::new();
        assert_eq!(
            ClientIdentity::from_parts(&headers, None),
            Err(IdentityError::Empty)
        );
    }
}
