use crate::error::{ResolveError, Result};
use crate::services::auth::{Credential, ServerEndpoint};
use reqwest::{RequestBuilder, StatusCode, redirect};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

const MAX_REDIRECTS: usize = 10;

/// Hook applied to every outgoing request, e.g. to add tracing headers.
pub trait RequestModifier: Send + Sync {
    fn modify(&self, request: RequestBuilder) -> RequestBuilder;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModifier;

impl RequestModifier for NoopModifier {
    fn modify(&self, request: RequestBuilder) -> RequestBuilder {
        request
    }
}

/// Adds a fixed set of headers to each request.
#[derive(Debug, Default, Clone)]
pub struct StaticHeaders {
    headers: Vec<(String, String)>,
}

impl StaticHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl RequestModifier for StaticHeaders {
    fn modify(&self, request: RequestBuilder) -> RequestBuilder {
        self.headers
            .iter()
            .fold(request, |req, (name, value)| {
                req.header(name.as_str(), value.as_str())
            })
    }
}

/// Decides whether TLS peer verification is enforced for a host.
pub trait HostnameVerifier: Send + Sync {
    fn verify_strictly(&self, host: &str) -> bool;
}

/// Full verification for every host.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictHostnames;

impl HostnameVerifier for StrictHostnames {
    fn verify_strictly(&self, _host: &str) -> bool {
        true
    }
}

/// Relaxes verification for an explicit set of hosts, e.g. an execution
/// server with a self-signed certificate. All other hosts stay strict.
#[derive(Debug, Default, Clone)]
pub struct TrustedHosts {
    hosts: HashSet<String>,
}

impl TrustedHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }
}

impl HostnameVerifier for TrustedHosts {
    fn verify_strictly(&self, host: &str) -> bool {
        !self.hosts.contains(&host.to_lowercase())
    }
}

/// `read` bounds every wait for data, including each body chunk. `transfer`,
/// when set, additionally caps the whole body download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub transfer: Option<Duration>,
}

impl FetchTimeouts {
    pub fn new(connect_ms: u64, read_ms: u64) -> Self {
        Self {
            connect: Duration::from_millis(connect_ms),
            read: Duration::from_millis(read_ms),
            transfer: None,
        }
    }

    pub fn with_transfer_limit(mut self, transfer_ms: u64) -> Self {
        self.transfer = Some(Duration::from_millis(transfer_ms));
        self
    }

    /// Upper bound for connecting and receiving the response head.
    pub fn total(&self) -> Duration {
        self.connect + self.read
    }
}

/// Opens single GET requests for remote references.
#[derive(Clone)]
pub struct FetchSession {
    verifier: Arc<dyn HostnameVerifier>,
    modifier: Arc<dyn RequestModifier>,
    user_agent: String,
}

impl Default for FetchSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchSession {
    pub fn new() -> Self {
        Self {
            verifier: Arc::new(StrictHostnames),
            modifier: Arc::new(NoopModifier),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_modifier(mut self, modifier: Arc<dyn RequestModifier>) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sends the request and waits for the response head.
    ///
    /// Connect and read timeouts apply independently; waiting for the head is
    /// additionally bounded by their sum. A credential, when given, is sent as
    /// an authorization header. Requests carrying a credential or relaxed TLS
    /// verification never follow a redirect to another origin.
    pub async fn open(
        &self,
        url: &Url,
        credential: Option<&Credential>,
        timeouts: FetchTimeouts,
    ) -> Result<FetchResponse> {
        let host = url.host_str().unwrap_or_default().to_string();

        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .user_agent(self.user_agent.as_str());

        let relaxed_tls = !self.verifier.verify_strictly(&host);
        if relaxed_tls {
            tracing::warn!("TLS verification relaxed for trusted host {}", host);
            builder = builder.danger_accept_invalid_certs(true);
        }

        // Neither a credential nor relaxed TLS may carry over to another origin.
        if credential.is_some() || relaxed_tls {
            builder = builder.redirect(same_origin_redirects(url));
        }

        let client = builder.build().map_err(|e| ResolveError::FetchFailed {
            host: host.clone(),
            reason: error_chain(e),
        })?;

        let mut request = client.get(url.clone());
        request = match credential {
            Some(Credential::Bearer(token)) => request.bearer_auth(token),
            Some(Credential::Basic { user, password }) => request.basic_auth(user, Some(password)),
            None => request,
        };
        request = self.modifier.modify(request);

        tracing::debug!(
            "Fetching {} (authenticated: {})",
            redact(url),
            credential.is_some()
        );

        let response = match tokio::time::timeout(timeouts.total(), request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(map_reqwest_error(&host, e)),
            Err(_) => return Err(ResolveError::FetchTimeout { host }),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ResolveError::AuthorizationFailed {
                host,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ResolveError::FetchFailed {
                host,
                reason: format!("HTTP {}", status),
            });
        }

        Ok(FetchResponse {
            host,
            read_timeout: timeouts.read,
            transfer_deadline: timeouts.transfer.map(|t| Instant::now() + t),
            response,
        })
    }
}

/// An open response whose body has not been read yet.
pub struct FetchResponse {
    host: String,
    read_timeout: Duration,
    transfer_deadline: Option<Instant>,
    response: reqwest::Response,
}

impl FetchResponse {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Streams the body into `writer` and returns the number of bytes written.
    ///
    /// Each chunk must arrive within the read timeout. Without a transfer
    /// limit a server that keeps trickling data keeps the download going.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        loop {
            let wait = match self.transfer_deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(ResolveError::FetchTimeout {
                            host: self.host.clone(),
                        });
                    }
                    self.read_timeout.min(left)
                }
                None => self.read_timeout,
            };
            let chunk = match tokio::time::timeout(wait, self.response.chunk()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => return Err(map_reqwest_error(&self.host, e)),
                Err(_) => {
                    return Err(ResolveError::FetchTimeout {
                        host: self.host.clone(),
                    });
                }
            };
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| ResolveError::MaterializationFailed(e.to_string()))?;
            written += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| ResolveError::MaterializationFailed(e.to_string()))?;

        tracing::debug!("Received {} bytes from {}", written, self.host);
        Ok(written)
    }
}

fn same_origin_redirects(origin: &Url) -> redirect::Policy {
    let endpoint = ServerEndpoint::of_url(origin);
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match &endpoint {
            Some(ep) if ep.matches_url(attempt.url()) => attempt.follow(),
            _ => {
                tracing::warn!(
                    "Not following authenticated redirect to {}",
                    attempt.url().host_str().unwrap_or_default()
                );
                attempt.stop()
            }
        }
    })
}

fn map_reqwest_error(host: &str, e: reqwest::Error) -> ResolveError {
    if is_timeout(&e) {
        ResolveError::FetchTimeout {
            host: host.to_string(),
        }
    } else {
        ResolveError::FetchFailed {
            host: host.to_string(),
            reason: error_chain(e),
        }
    }
}

fn is_timeout(e: &reqwest::Error) -> bool {
    if e.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = err.source();
    }
    false
}

/// Error message with its sources, without the request URL.
fn error_chain(e: reqwest::Error) -> String {
    let e = e.without_url();
    let mut parts = Vec::new();
    let mut source = std::error::Error::source(&e);
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    if parts.is_empty() {
        e.to_string()
    } else {
        parts.join(": ")
    }
}

/// URL without query string, which may carry tokens.
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.set_fragment(None);
    let _ = shown.set_password(None);
    shown.to_string()
}
