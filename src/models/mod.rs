use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

/// One user-specified or default file slot.
///
/// `id` disambiguates the members of a multi-file set and is the basis for
/// deterministic temp file names. Equality compares the whole value, which is
/// what change detection between executions relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: String,
    pub path: String,
    pub file_name: String,
    pub path_valid: bool,
    pub file_size: Option<i64>,
}

impl FileReference {
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), path)
    }

    pub fn with_id(id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let file_name = crate::utils::reference::display_name(&path);
        Self {
            id: id.into(),
            path_valid: !path.trim().is_empty(),
            path,
            file_name,
            file_size: None,
        }
    }

    /// Copy of this reference carrying the size of the materialized file.
    pub fn with_resolved_size(&self, size: i64) -> Self {
        Self {
            file_size: Some(size),
            ..self.clone()
        }
    }
}

/// Encoding token of an inline payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Base64,
    None,
}

/// Parsed form of [`FileReference::path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceDescriptor {
    Local {
        fs_path: PathBuf,
    },
    Remote {
        url: Url,
    },
    Inline {
        media_type: Option<String>,
        encoding: PayloadEncoding,
        raw_data: String,
    },
    WorkflowRelative {
        relative_path: String,
    },
}

impl ReferenceDescriptor {
    pub fn scheme_name(&self) -> &'static str {
        match self {
            ReferenceDescriptor::Local { .. } => "local",
            ReferenceDescriptor::Remote { .. } => "remote",
            ReferenceDescriptor::Inline { .. } => "inline",
            ReferenceDescriptor::WorkflowRelative { .. } => "workflow",
        }
    }
}

/// Outcome of a resolution. `local_path` is `None` only for configure-time
/// probes, which never materialize anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub local_path: Option<PathBuf>,
    pub canonical_uri: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// One-shot file in the temp directory with a generated name.
    Anonymous,
    /// Path derived from the owning reference id under the persist root.
    Deterministic,
}

/// A temp file owned by the temp file manager. Only `release` deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempFileHandle {
    pub path: PathBuf,
    pub owning_reference_id: String,
    pub mode: AllocationMode,
    /// Execution epoch the handle was allocated in.
    pub epoch: u64,
    pub allocated_at: DateTime<Utc>,
}

impl TempFileHandle {
    pub fn is_deterministic(&self) -> bool {
        self.mode == AllocationMode::Deterministic
    }
}

/// Allow-list of file extensions. An empty set accepts any extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub allowed_extensions: BTreeSet<String>,
}

impl ValidationPolicy {
    /// Normalizes entries to lower case with a leading dot; blank entries are
    /// dropped.
    pub fn from_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty() && e != ".")
            .map(|e| if e.starts_with('.') { e } else { format!(".{}", e) })
            .collect();
        Self { allowed_extensions }
    }

    pub fn accepts_any(&self) -> bool {
        self.allowed_extensions.is_empty()
    }
}
