//! Typed view of the request metadata the login path needs.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Reported when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: String,
    pub user_agent: String,
    pub accept_language: String,
    pub accept_encoding: String,
}

impl ClientContext {
    #[must_use]
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_accept_language(mut self, accept_language: impl Into<String>) -> Self {
        self.accept_language = accept_language.into();
        self
    }

    #[must_use]
    pub fn with_accept_encoding(mut self, accept_encoding: impl Into<String>) -> Self {
        self.accept_encoding = accept_encoding.into();
        self
    }

    /// Build the context from request headers and the socket peer, if known.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        Self {
            ip: client_ip(headers, peer),
            user_agent: header(headers, "user-agent"),
            accept_language: header(headers, "accept-language"),
            accept_encoding: header(headers, "accept-encoding"),
        }
    }

    #[must_use]
    pub fn has_known_ip(&self) -> bool {
        self.ip != UNKNOWN_IP
    }
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// First hop of `x-forwarded-for`, else the peer address, else [`UNKNOWN_IP`].
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    peer.map_or_else(|| UNKNOWN_IP.to_string(), |addr| addr.ip().to_string())
}
