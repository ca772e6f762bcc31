use crate::services::auth::{AuthenticationProvider, EnvTokenProvider, NoCredentials, ServerEndpoint};
use crate::services::fetch::{FetchSession, StaticHeaders, TrustedHosts};
use crate::services::resolver::ExecutionEnvironment;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

const DEFAULT_TOKEN_VAR: &str = "SERVER_TOKEN";

/// Builds the execution environment from `WORKFLOW_DIR`, `SERVER_URL` and the
/// token variable named by `SERVER_TOKEN_VAR` (default `SERVER_TOKEN`).
pub fn setup_environment() -> ExecutionEnvironment {
    let workflow_dir = env::var("WORKFLOW_DIR").ok().map(PathBuf::from);
    let server_url = env::var("SERVER_URL").ok().and_then(|raw| match Url::parse(&raw) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Ignoring invalid SERVER_URL '{}': {}", raw, e);
            None
        }
    });

    let mut environment = match server_url {
        Some(url) => {
            let credentials: Arc<dyn AuthenticationProvider> = match ServerEndpoint::of_url(&url) {
                Some(endpoint) => {
                    let var = env::var("SERVER_TOKEN_VAR")
                        .unwrap_or_else(|_| DEFAULT_TOKEN_VAR.to_string());
                    info!("Execution server: {}", endpoint);
                    Arc::new(EnvTokenProvider::from_env(endpoint, &var))
                }
                None => Arc::new(NoCredentials),
            };
            ExecutionEnvironment::server(url, credentials)
        }
        None => ExecutionEnvironment::detached(),
    };

    if let Some(dir) = workflow_dir {
        info!("Workflow directory: {}", dir.display());
        environment = environment.with_workflow_dir(dir);
    }

    environment
}

/// Fetch session honouring `TRUSTED_HOSTS` (comma separated) and
/// `FETCH_USER_AGENT`.
pub fn setup_fetch_session() -> FetchSession {
    let mut session = FetchSession::new();

    if let Ok(hosts) = env::var("TRUSTED_HOSTS") {
        let trusted = TrustedHosts::new(hosts.split(','));
        warn!("Relaxed TLS verification for: {}", hosts);
        session = session.with_verifier(Arc::new(trusted));
    }

    if let Ok(agent) = env::var("FETCH_USER_AGENT") {
        session = session.with_user_agent(agent);
    }

    if let Ok(request_id) = env::var("FETCH_REQUEST_ID") {
        session = session.with_modifier(Arc::new(
            StaticHeaders::new().with("x-request-id", request_id),
        ));
    }

    session
}
