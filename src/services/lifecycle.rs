use crate::config::ResolverConfig;
use crate::error::{ResolveError, Result};
use crate::models::{AllocationMode, FileReference, ResolvedLocation, TempFileHandle};
use crate::services::resolver::{ResolveMode, Resolver};
use crate::services::temp_files::TempFileManager;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// File written by [`LifecycleCoordinator::save_internals`].
pub const INTERNALS_FILE: &str = "resolutions.json";

const MAX_SHOWN_PATH: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Materialized {
    reference: FileReference,
    location: ResolvedLocation,
    handle: Option<TempFileHandle>,
    size: Option<u64>,
}

impl Materialized {
    /// `reference` is unchanged when it equals the one that was resolved,
    /// either as given or as handed back with its resolved size.
    fn matches(&self, reference: &FileReference) -> bool {
        if self.reference == *reference {
            return true;
        }
        self.size
            .is_some_and(|size| self.reference.with_resolved_size(size as i64) == *reference)
    }

    fn is_persisted(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(TempFileHandle::is_deterministic)
    }
}

/// Result for one reference of an execute or configure pass.
#[derive(Debug, Clone)]
pub struct ReferenceOutcome {
    pub reference: FileReference,
    pub result: Result<ResolvedLocation>,
    pub size: Option<u64>,
    /// Served from an earlier resolution without touching the source.
    pub reused: bool,
}

impl ReferenceOutcome {
    /// The reference with `file_size` filled in from the resolved file.
    pub fn updated_reference(&self) -> FileReference {
        match self.size {
            Some(size) => self.reference.with_resolved_size(size as i64),
            None => self.reference.clone(),
        }
    }
}

/// What the hosting component exposes for one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Active {
        reference: FileReference,
        location: ResolvedLocation,
    },
    Inactive {
        reference: FileReference,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSummary {
    pub id: String,
    pub reference: String,
    pub status: &'static str,
    pub local_path: Option<String>,
    pub canonical_uri: Option<String>,
    pub size: Option<u64>,
    pub reused: bool,
    pub error_code: Option<&'static str>,
    pub error: Option<String>,
}

/// Per-reference outcomes of one pass, in the order the references were given.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub epoch: u64,
    pub outcomes: Vec<ReferenceOutcome>,
}

impl ExecutionReport {
    pub fn failures(&self) -> impl Iterator<Item = (&FileReference, &ResolveError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.reference, e)))
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Applies the "disable output if missing" policy: failed references
    /// become inactive outputs when it is set, otherwise the first failure is
    /// returned.
    pub fn outputs(&self, disable_output_if_missing: bool) -> Result<Vec<Output>> {
        self.outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(location) => Ok(Output::Active {
                    reference: o.updated_reference(),
                    location: location.clone(),
                }),
                Err(e) if disable_output_if_missing => Ok(Output::Inactive {
                    reference: o.reference.clone(),
                    reason: e.to_string(),
                }),
                Err(e) => Err(e.clone()),
            })
            .collect()
    }

    pub fn summary(&self) -> Vec<OutcomeSummary> {
        self.outcomes
            .iter()
            .map(|o| {
                let (status, location, error) = match &o.result {
                    Ok(location) => ("resolved", Some(location), None),
                    Err(e) => ("failed", None, Some(e)),
                };
                OutcomeSummary {
                    id: o.reference.id.clone(),
                    reference: shorten(&o.reference.path),
                    status,
                    local_path: location
                        .and_then(|l| l.local_path.as_ref())
                        .map(|p| p.display().to_string()),
                    canonical_uri: location.map(|l| shorten(l.canonical_uri.as_str())),
                    size: o.size,
                    reused: o.reused,
                    error_code: error.map(ResolveError::code),
                    error: error.map(|e| e.to_string()),
                }
            })
            .collect()
    }
}

fn shorten(value: &str) -> String {
    if value.len() <= MAX_SHOWN_PATH {
        return value.to_string();
    }
    let mut end = MAX_SHOWN_PATH;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

/// Ties resolutions to the hosting component's execute/reset/dispose cycle.
///
/// The coordinator is the only owner of the temp file table. Every operation
/// takes `&mut self`, so the references of one component are resolved one at
/// a time and in order.
pub struct LifecycleCoordinator {
    resolver: Resolver,
    temp_files: TempFileManager,
    config: ResolverConfig,
    resolved: BTreeMap<String, Materialized>,
}

impl LifecycleCoordinator {
    pub fn new(resolver: Resolver, config: ResolverConfig) -> Self {
        let persist_root = config
            .persist_dir
            .clone()
            .or_else(|| resolver.environment().persist_root());
        let temp_files = TempFileManager::new(config.temp_dir.clone(), persist_root);
        Self {
            resolver,
            temp_files,
            config,
            resolved: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn temp_files(&self) -> &TempFileManager {
        &self.temp_files
    }

    pub fn resolved_location(&self, reference_id: &str) -> Option<&ResolvedLocation> {
        self.resolved.get(reference_id).map(|m| &m.location)
    }

    /// Configure-time check of every reference. Nothing is fetched, written or
    /// recorded.
    pub async fn configure(&mut self, references: &[FileReference]) -> ExecutionReport {
        let mut outcomes = Vec::with_capacity(references.len());
        for reference in references {
            let result = match self.check_valid(reference) {
                Ok(()) => {
                    self.resolver
                        .resolve(reference, ResolveMode::Probe, &mut self.temp_files)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::warn!(
                    "Reference {} failed configuration check ({}): {}",
                    reference.id,
                    e.code(),
                    e
                );
            }
            outcomes.push(ReferenceOutcome {
                reference: reference.clone(),
                size: None,
                result: result.map(|r| r.location),
                reused: false,
            });
        }
        ExecutionReport {
            epoch: self.temp_files.epoch(),
            outcomes,
        }
    }

    /// Resolves every reference in order. A failing reference is reported and
    /// does not stop the ones after it.
    pub async fn execute(&mut self, references: &[FileReference]) -> ExecutionReport {
        let epoch = self.temp_files.advance_epoch();
        tracing::info!(
            "Executing {} file reference(s) in epoch {}",
            references.len(),
            epoch
        );

        self.release_stale(references).await;

        let mode = ResolveMode::Materialize {
            persist: self.config.persist_locally,
        };
        let mut outcomes = Vec::with_capacity(references.len());
        for reference in references {
            outcomes.push(self.execute_one(reference, mode).await);
        }

        let report = ExecutionReport { epoch, outcomes };
        if !report.is_complete() {
            tracing::warn!(
                "{} of {} reference(s) could not be resolved",
                report.failures().count(),
                references.len()
            );
        }
        report
    }

    async fn execute_one(&mut self, reference: &FileReference, mode: ResolveMode) -> ReferenceOutcome {
        if let Err(e) = self.check_valid(reference) {
            tracing::warn!("Reference {} skipped: {}", reference.id, e);
            return ReferenceOutcome {
                reference: reference.clone(),
                result: Err(e),
                size: None,
                reused: false,
            };
        }

        if let Some(cached) = self.resolved.get(&reference.id) {
            if cached.matches(reference) && still_present(&cached.location).await {
                tracing::debug!("Reusing resolution of reference {}", reference.id);
                return ReferenceOutcome {
                    reference: reference.clone(),
                    result: Ok(cached.location.clone()),
                    size: cached.size,
                    reused: true,
                };
            }
        }

        self.supersede(&reference.id).await;

        let result = self
            .resolver
            .resolve(reference, mode, &mut self.temp_files)
            .await;

        match result {
            Ok(resolution) => {
                let location = resolution.location.clone();
                self.resolved.insert(
                    reference.id.clone(),
                    Materialized {
                        reference: reference.clone(),
                        location: resolution.location,
                        handle: resolution.handle,
                        size: resolution.size,
                    },
                );
                ReferenceOutcome {
                    reference: reference.clone(),
                    result: Ok(location),
                    size: resolution.size,
                    reused: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Reference {} could not be resolved ({}): {}",
                    reference.id,
                    e.code(),
                    e
                );
                ReferenceOutcome {
                    reference: reference.clone(),
                    result: Err(e),
                    size: None,
                    reused: false,
                }
            }
        }
    }

    fn check_valid(&self, reference: &FileReference) -> Result<()> {
        if reference.path_valid {
            Ok(())
        } else {
            Err(ResolveError::MalformedReference(format!(
                "no valid file specified for reference {}",
                reference.id
            )))
        }
    }

    /// Drops the previous resolution of `reference_id` and its temp file.
    async fn supersede(&mut self, reference_id: &str) {
        let Some(previous) = self.resolved.remove(reference_id) else {
            return;
        };
        if let Some(handle) = &previous.handle {
            tracing::debug!(
                "Superseding {} for reference {}",
                handle.path.display(),
                reference_id
            );
            if let Err(e) = self.temp_files.release(handle).await {
                tracing::warn!("{}", e);
            }
        }
    }

    /// Forgets references that are no longer configured. Their anonymous
    /// copies are released; persisted copies stay.
    async fn release_stale(&mut self, references: &[FileReference]) {
        let current: HashSet<&str> = references.iter().map(|r| r.id.as_str()).collect();
        let stale: Vec<String> = self
            .resolved
            .iter()
            .filter(|(id, m)| !current.contains(id.as_str()) && !m.is_persisted())
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            self.supersede(&id).await;
        }
    }

    /// Releases copies made by earlier executions. Persisted copies survive
    /// unless `release_persisted_on_reset` is set.
    pub async fn reset(&mut self) -> usize {
        let release_persisted = self.config.release_persisted_on_reset;
        let released = self
            .temp_files
            .release_where(|h| h.mode == AllocationMode::Anonymous || release_persisted)
            .await;

        self.resolved
            .retain(|_, m| m.is_persisted() && !release_persisted);

        tracing::info!("Reset released {} temp file(s)", released);
        released
    }

    pub async fn dispose(&mut self) -> usize {
        let released = self.reset().await;
        self.resolved.clear();
        released
    }

    /// Hands every materialized file over to the caller. The coordinator
    /// forgets them and will not delete them on reset, dispose or drop.
    pub fn detach(&mut self) -> Vec<TempFileHandle> {
        self.resolved.clear();
        self.temp_files.detach_all()
    }

    /// Writes persisted resolutions to `dir` so a later instance can pick them
    /// up with [`LifecycleCoordinator::load_internals`].
    pub async fn save_internals(&self, dir: &Path) -> Result<usize> {
        let entries: Vec<&Materialized> = self
            .resolved
            .values()
            .filter(|m| m.is_persisted())
            .collect();

        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| ResolveError::MaterializationFailed(e.to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ResolveError::MaterializationFailed(e.to_string()))?;
        let path = dir.join(INTERNALS_FILE);
        tokio::fs::write(&path, json).await.map_err(|e| {
            ResolveError::MaterializationFailed(format!("cannot write {}: {}", path.display(), e))
        })?;

        tracing::debug!("Saved {} persisted resolution(s) to {}", entries.len(), path.display());
        Ok(entries.len())
    }

    /// Restores persisted resolutions saved by an earlier instance. A file
    /// that has gone missing is logged and skipped; it will be fetched again
    /// on the next execution.
    pub async fn load_internals(&mut self, dir: &Path) -> Result<usize> {
        let path = dir.join(INTERNALS_FILE);
        let json = match tokio::fs::read(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(ResolveError::MaterializationFailed(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let entries: Vec<Materialized> = serde_json::from_slice(&json).map_err(|e| {
            ResolveError::MaterializationFailed(format!("corrupt {}: {}", path.display(), e))
        })?;

        let mut restored = 0;
        for entry in entries {
            let Some(handle) = entry.handle.clone() else {
                continue;
            };
            if !tokio::fs::try_exists(&handle.path).await.unwrap_or(false) {
                tracing::warn!(
                    "Persisted file {} for reference {} is missing",
                    handle.path.display(),
                    entry.reference.id
                );
                continue;
            }
            self.temp_files.adopt(handle);
            self.resolved.insert(entry.reference.id.clone(), entry);
            restored += 1;
        }
        Ok(restored)
    }
}

async fn still_present(location: &ResolvedLocation) -> bool {
    match &location.local_path {
        Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn outcome(id: &str, result: Result<ResolvedLocation>) -> ReferenceOutcome {
        ReferenceOutcome {
            reference: FileReference::with_id(id, format!("/data/{}.csv", id)),
            size: result.as_ref().ok().map(|_| 42),
            result,
            reused: false,
        }
    }

    fn location() -> ResolvedLocation {
        ResolvedLocation {
            local_path: Some("/data/a.csv".into()),
            canonical_uri: Url::parse("file:///data/a.csv").unwrap(),
        }
    }

    #[test]
    fn test_outputs_policy() {
        let report = ExecutionReport {
            epoch: 1,
            outcomes: vec![
                outcome("a", Ok(location())),
                outcome("b", Err(ResolveError::FileNotFound("/data/b.csv".into()))),
            ],
        };
        assert!(!report.is_complete());
        assert_eq!(report.failures().count(), 1);

        let outputs = report.outputs(true).unwrap();
        assert_eq!(outputs.len(), 2);
        match &outputs[0] {
            Output::Active { reference, .. } => assert_eq!(reference.file_size, Some(42)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&outputs[1], Output::Inactive { reason, .. } if reason.contains("b.csv")));

        assert!(matches!(
            report.outputs(false),
            Err(ResolveError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_summary() {
        let report = ExecutionReport {
            epoch: 1,
            outcomes: vec![outcome("b", Err(ResolveError::FileNotFound("x".into())))],
        };
        let summary = report.summary();
        assert_eq!(summary[0].status, "failed");
        assert_eq!(summary[0].error_code, Some("FILE_NOT_FOUND"));
        assert!(summary[0].local_path.is_none());
    }

    #[test]
    fn test_size_filled_reference_is_unchanged() {
        let reference = FileReference::with_id("a", "/data/a.csv");
        let entry = Materialized {
            reference: reference.clone(),
            location: location(),
            handle: None,
            size: Some(42),
        };
        assert!(entry.matches(&reference));
        assert!(entry.matches(&reference.with_resolved_size(42)));
        assert!(!entry.matches(&reference.with_resolved_size(7)));
        assert!(!entry.matches(&FileReference::with_id("a", "/data/b.csv")));
    }

    #[test]
    fn test_shorten() {
        assert_eq!(shorten("abc"), "abc");
        let long = "x".repeat(200);
        assert_eq!(shorten(&long).len(), MAX_SHOWN_PATH + 3);
    }
}
