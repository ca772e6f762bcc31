use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Credential attached to requests addressed to the execution server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Basic { user: String, password: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
            Credential::Basic { user, .. } => write!(f, "Basic({}:***)", user),
        }
    }
}

/// Scheme, host and port of an execution server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_lowercase(),
            host: host.into().to_lowercase(),
            port,
        }
    }

    /// Endpoint of a URL, with the scheme's default port filled in.
    pub fn of_url(url: &Url) -> Option<Self> {
        Some(Self::new(
            url.scheme(),
            url.host_str()?,
            url.port_or_known_default()?,
        ))
    }

    /// Exact match on scheme, host and port.
    pub fn matches(&self, host: &str, port: u16, scheme: &str) -> bool {
        self.port == port
            && self.scheme.eq_ignore_ascii_case(scheme)
            && self.host.eq_ignore_ascii_case(host)
    }

    pub fn matches_url(&self, url: &Url) -> bool {
        match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => self.matches(host, port, url.scheme()),
            _ => false,
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Source of credentials for the execution server.
///
/// Implementations are shared process-wide and must be side-effect-free.
/// Returning `None` lets the request proceed unauthenticated.
pub trait AuthenticationProvider: Send + Sync {
    fn supply_credentials(&self, host: &str, port: u16, scheme: &str) -> Option<Credential>;
}

/// Always declines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl AuthenticationProvider for NoCredentials {
    fn supply_credentials(&self, _host: &str, _port: u16, _scheme: &str) -> Option<Credential> {
        None
    }
}

/// A fixed credential bound to a single endpoint.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    endpoint: ServerEndpoint,
    credential: Credential,
}

impl StaticTokenProvider {
    pub fn new(endpoint: ServerEndpoint, credential: Credential) -> Self {
        Self {
            endpoint,
            credential,
        }
    }

    pub fn bearer(endpoint: ServerEndpoint, token: impl Into<String>) -> Self {
        Self::new(endpoint, Credential::Bearer(token.into()))
    }
}

impl AuthenticationProvider for StaticTokenProvider {
    fn supply_credentials(&self, host: &str, port: u16, scheme: &str) -> Option<Credential> {
        if self.endpoint.matches(host, port, scheme) {
            Some(self.credential.clone())
        } else {
            tracing::debug!(
                "Declining credentials for {}://{}:{} (bound to {})",
                scheme,
                host,
                port,
                self.endpoint
            );
            None
        }
    }
}

/// Bearer token read from an environment variable, bound to one endpoint.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    inner: Option<StaticTokenProvider>,
}

impl EnvTokenProvider {
    /// Reads `var` once; later changes to the environment are not observed.
    pub fn from_env(endpoint: ServerEndpoint, var: &str) -> Self {
        let inner = std::env::var(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|token| StaticTokenProvider::bearer(endpoint, token.trim()));
        if inner.is_none() {
            tracing::warn!("{} is not set, server requests will be unauthenticated", var);
        }
        Self { inner }
    }

    pub fn has_token(&self) -> bool {
        self.inner.is_some()
    }
}

impl AuthenticationProvider for EnvTokenProvider {
    fn supply_credentials(&self, host: &str, port: u16, scheme: &str) -> Option<Credential> {
        self.inner
            .as_ref()
            .and_then(|p| p.supply_credentials(host, port, scheme))
    }
}
