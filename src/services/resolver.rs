use crate::config::ResolverConfig;
use crate::error::{ResolveError, Result};
use crate::models::{
    FileReference, PayloadEncoding, ReferenceDescriptor, ResolvedLocation, TempFileHandle,
    ValidationPolicy,
};
use crate::services::auth::{AuthenticationProvider, Credential, NoCredentials, ServerEndpoint};
use crate::services::fetch::{FetchSession, FetchTimeouts, redact};
use crate::services::temp_files::TempFileManager;
use crate::utils::reference::{self, WORKFLOW_SCHEME};
use crate::utils::validation::validate_extension;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Directory below the workflow that holds persisted files.
pub const PERSIST_SUBDIR: &str = ".uploads";

/// Where resolution runs and which identity it may use.
#[derive(Clone)]
pub struct ExecutionEnvironment {
    workflow_dir: Option<PathBuf>,
    server_url: Option<Url>,
    credentials: Arc<dyn AuthenticationProvider>,
}

impl Default for ExecutionEnvironment {
    fn default() -> Self {
        Self::detached()
    }
}

impl ExecutionEnvironment {
    /// No workflow location and no server; workflow-relative references fail.
    pub fn detached() -> Self {
        Self {
            workflow_dir: None,
            server_url: None,
            credentials: Arc::new(NoCredentials),
        }
    }

    pub fn local(workflow_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow_dir: Some(workflow_dir.into()),
            ..Self::detached()
        }
    }

    /// Workflow hosted on an execution server. `base_url` is the workflow's
    /// location on the server; relative references are joined onto it.
    pub fn server(base_url: Url, credentials: Arc<dyn AuthenticationProvider>) -> Self {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            workflow_dir: None,
            server_url: Some(base_url),
            credentials,
        }
    }

    pub fn with_workflow_dir(mut self, workflow_dir: impl Into<PathBuf>) -> Self {
        self.workflow_dir = Some(workflow_dir.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn AuthenticationProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn workflow_dir(&self) -> Option<&Path> {
        self.workflow_dir.as_deref()
    }

    pub fn server_url(&self) -> Option<&Url> {
        self.server_url.as_ref()
    }

    pub fn server_endpoint(&self) -> Option<ServerEndpoint> {
        self.server_url.as_ref().and_then(ServerEndpoint::of_url)
    }

    /// Default root for persisted files.
    pub fn persist_root(&self) -> Option<PathBuf> {
        self.workflow_dir.as_ref().map(|d| d.join(PERSIST_SUBDIR))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Configure-time check: nothing is fetched or written.
    Probe,
    /// Produce a local file; `persist` selects deterministic storage for
    /// fetched files.
    Materialize { persist: bool },
}

/// Result of a single resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub location: ResolvedLocation,
    /// Temp file created for this resolution, if any.
    pub handle: Option<TempFileHandle>,
    /// Name the extension policy was checked against.
    pub file_name: String,
    /// Size of the local file, when one exists.
    pub size: Option<u64>,
}

/// Turns file references into local files.
pub struct Resolver {
    environment: ExecutionEnvironment,
    fetch: FetchSession,
    policy: ValidationPolicy,
    timeouts: FetchTimeouts,
}

impl Resolver {
    pub fn new(environment: ExecutionEnvironment, config: &ResolverConfig) -> Self {
        Self {
            environment,
            fetch: FetchSession::new(),
            policy: config.policy(),
            timeouts: config.timeouts(),
        }
    }

    pub fn with_fetch_session(mut self, fetch: FetchSession) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.environment
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Resolves `reference`. Temp files are allocated from `temp_files`; any
    /// file created for a resolution that fails is released before the error
    /// is returned.
    pub async fn resolve(
        &self,
        reference: &FileReference,
        mode: ResolveMode,
        temp_files: &mut TempFileManager,
    ) -> Result<Resolution> {
        let descriptor = reference::parse(&reference.path)?;
        tracing::debug!(
            "Resolving reference {} as {} ({:?})",
            reference.id,
            descriptor.scheme_name(),
            mode
        );

        let resolution = match descriptor {
            ReferenceDescriptor::Local { fs_path } => self.resolve_local(&fs_path).await?,
            ReferenceDescriptor::Inline {
                media_type,
                encoding,
                raw_data,
            } => {
                self.resolve_inline(
                    reference,
                    media_type.as_deref(),
                    encoding,
                    &raw_data,
                    mode,
                    temp_files,
                )
                .await?
            }
            ReferenceDescriptor::WorkflowRelative { relative_path } => {
                self.resolve_workflow_relative(reference, &relative_path, mode, temp_files)
                    .await?
            }
            ReferenceDescriptor::Remote { url } => {
                self.resolve_remote(reference, &url, mode, temp_files)
                    .await?
            }
        };

        if let Err(e) = validate_extension(&resolution.file_name, &self.policy) {
            if let Some(handle) = &resolution.handle {
                discard(temp_files, handle).await;
            }
            return Err(e);
        }

        tracing::info!(
            "Resolved reference {} to {}",
            reference.id,
            resolution
                .location
                .local_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<not materialized>".to_string())
        );
        Ok(resolution)
    }

    async fn resolve_local(&self, fs_path: &Path) -> Result<Resolution> {
        let canonical = tokio::fs::canonicalize(fs_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResolveError::FileNotFound(fs_path.display().to_string())
            } else {
                ResolveError::FileNotFound(format!("{}: {}", fs_path.display(), e))
            }
        })?;

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| ResolveError::FileNotFound(format!("{}: {}", canonical.display(), e)))?;
        if !metadata.is_file() {
            return Err(ResolveError::FileNotFound(format!(
                "{} is not a file",
                canonical.display()
            )));
        }

        let canonical_uri = file_uri(&canonical)?;
        Ok(Resolution {
            file_name: file_name_of(&canonical),
            location: ResolvedLocation {
                local_path: Some(canonical),
                canonical_uri,
            },
            handle: None,
            size: Some(metadata.len()),
        })
    }

    async fn resolve_inline(
        &self,
        reference: &FileReference,
        media_type: Option<&str>,
        encoding: PayloadEncoding,
        raw_data: &str,
        mode: ResolveMode,
        temp_files: &mut TempFileManager,
    ) -> Result<Resolution> {
        let bytes = reference::decode_payload(encoding, raw_data)?;

        let (stem, ext) = match reference::basis_name(&reference.file_name) {
            (stem, ext) if !stem.is_empty() && !ext.is_empty() => (stem, ext),
            _ => (
                "payload".to_string(),
                media_type
                    .and_then(reference::extension_for_media_type)
                    .unwrap_or("")
                    .to_string(),
            ),
        };

        if mode == ResolveMode::Probe {
            let canonical_uri = reference::inline_uri(media_type, &bytes)?;
            return Ok(Resolution {
                file_name: format!("{}{}", stem, ext),
                location: ResolvedLocation {
                    local_path: None,
                    canonical_uri,
                },
                handle: None,
                size: Some(bytes.len() as u64),
            });
        }

        let handle = temp_files
            .allocate(&stem, &ext, false, &reference.id)
            .await?;
        if let Err(e) = tokio::fs::write(&handle.path, &bytes).await {
            discard(temp_files, &handle).await;
            return Err(ResolveError::MaterializationFailed(format!(
                "cannot write {}: {}",
                handle.path.display(),
                e
            )));
        }

        let canonical_uri = match file_uri(&handle.path) {
            Ok(uri) => uri,
            Err(e) => {
                discard(temp_files, &handle).await;
                return Err(e);
            }
        };
        Ok(Resolution {
            file_name: file_name_of(&handle.path),
            location: ResolvedLocation {
                local_path: Some(handle.path.clone()),
                canonical_uri,
            },
            handle: Some(handle),
            size: Some(bytes.len() as u64),
        })
    }

    async fn resolve_workflow_relative(
        &self,
        reference: &FileReference,
        relative_path: &str,
        mode: ResolveMode,
        temp_files: &mut TempFileManager,
    ) -> Result<Resolution> {
        if let Some(dir) = self.environment.workflow_dir() {
            return self.resolve_local(&dir.join(relative_path)).await;
        }

        if let Some(base) = self.environment.server_url() {
            let url = base.join(relative_path).map_err(|e| {
                ResolveError::MalformedReference(format!("'{}': {}", relative_path, e))
            })?;
            let same_server = self
                .environment
                .server_endpoint()
                .is_some_and(|ep| ep.matches_url(&url));
            if !same_server || !url.path().starts_with(base.path()) {
                return Err(ResolveError::MalformedReference(format!(
                    "workflow-relative path '{}' leaves the workflow location",
                    relative_path
                )));
            }
            return self
                .resolve_remote(reference, &url, mode, temp_files)
                .await;
        }

        Err(ResolveError::EnvironmentUnavailable(format!(
            "no workflow location to resolve '{}://{}' against",
            WORKFLOW_SCHEME, relative_path
        )))
    }

    async fn resolve_remote(
        &self,
        reference: &FileReference,
        url: &Url,
        mode: ResolveMode,
        temp_files: &mut TempFileManager,
    ) -> Result<Resolution> {
        let (stem, ext) = reference::basis_name(url.path());

        let persist = match mode {
            ResolveMode::Probe => {
                return Ok(Resolution {
                    file_name: format!("{}{}", stem, ext),
                    location: ResolvedLocation {
                        local_path: None,
                        canonical_uri: url.clone(),
                    },
                    handle: None,
                    size: None,
                });
            }
            ResolveMode::Materialize { persist } => persist,
        };

        let credential = self.credentials_for(url);
        let handle = temp_files
            .allocate(&stem, &ext, persist, &reference.id)
            .await?;

        let size = match self.download(url, credential.as_ref(), &handle.path).await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!("Fetching {} failed: {}", redact(url), e);
                discard(temp_files, &handle).await;
                return Err(e);
            }
        };

        let canonical_uri = if persist {
            self.persisted_uri(&handle.path)
        } else {
            file_uri(&handle.path)
        };
        let canonical_uri = match canonical_uri {
            Ok(uri) => uri,
            Err(e) => {
                discard(temp_files, &handle).await;
                return Err(e);
            }
        };

        Ok(Resolution {
            file_name: file_name_of(&handle.path),
            location: ResolvedLocation {
                local_path: Some(handle.path.clone()),
                canonical_uri,
            },
            handle: Some(handle),
            size: Some(size),
        })
    }

    /// Credentials are only requested for the execution server itself; any
    /// other host is fetched without them.
    fn credentials_for(&self, url: &Url) -> Option<Credential> {
        let endpoint = self.environment.server_endpoint()?;
        if !endpoint.matches_url(url) {
            return None;
        }
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        self.environment
            .credentials
            .supply_credentials(host, port, url.scheme())
    }

    async fn download(
        &self,
        url: &Url,
        credential: Option<&Credential>,
        target: &Path,
    ) -> Result<u64> {
        let response = self.fetch.open(url, credential, self.timeouts).await?;
        let mut file = tokio::fs::File::create(target).await.map_err(|e| {
            ResolveError::MaterializationFailed(format!("cannot write {}: {}", target.display(), e))
        })?;
        response.copy_to(&mut file).await
    }

    /// `workflow:///…` URI of a persisted file when it lives below the
    /// workflow directory, otherwise its file URI.
    fn persisted_uri(&self, path: &Path) -> Result<Url> {
        let relative = self
            .environment
            .workflow_dir()
            .and_then(|dir| path.strip_prefix(dir).ok());
        let Some(relative) = relative else {
            return file_uri(path);
        };

        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let mut uri = Url::parse(&format!("{}:///", WORKFLOW_SCHEME))
            .map_err(|e| ResolveError::MaterializationFailed(e.to_string()))?;
        uri.set_path(&format!("/{}", segments.join("/")));
        Ok(uri)
    }
}

async fn discard(temp_files: &mut TempFileManager, handle: &TempFileHandle) {
    if let Err(e) = temp_files.release(handle).await {
        tracing::warn!("Could not discard {}: {}", handle.path.display(), e);
    }
}

fn file_uri(path: &Path) -> Result<Url> {
    Url::from_file_path(path).map_err(|_| {
        ResolveError::MalformedReference(format!("{} is not an absolute path", path.display()))
    })
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
