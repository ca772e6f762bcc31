use crate::error::{ResolveError, Result};
use crate::models::{PayloadEncoding, ReferenceDescriptor};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};
use url::Url;

/// Prefix of an inline payload reference.
pub const INLINE_PREFIX: &str = "data:";

/// Scheme token of references relative to the active workflow.
pub const WORKFLOW_SCHEME: &str = "workflow";

const BASE64_TOKEN: &str = "base64";

/// Common media types and the extension a materialized payload gets.
const MEDIA_TYPE_EXTENSIONS: &[(&str, &str)] = &[
    ("text/plain", ".txt"),
    ("text/csv", ".csv"),
    ("text/tab-separated-values", ".tsv"),
    ("text/html", ".html"),
    ("text/xml", ".xml"),
    ("application/xml", ".xml"),
    ("application/json", ".json"),
    ("application/pdf", ".pdf"),
    ("application/zip", ".zip"),
    ("application/gzip", ".gz"),
    ("application/vnd.ms-excel", ".xls"),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".xlsx",
    ),
    ("image/png", ".png"),
    ("image/jpeg", ".jpg"),
    ("image/gif", ".gif"),
    ("image/svg+xml", ".svg"),
];

/// Parses a raw reference into a descriptor.
///
/// Detection order is inline payload, then absolute URL, then local path. A
/// string that is both a valid URL and an existing file is a URL.
pub fn parse(raw: &str) -> Result<ReferenceDescriptor> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::MalformedReference(
            "empty reference".to_string(),
        ));
    }

    if let Some(rest) = strip_inline_prefix(trimmed) {
        return parse_inline(rest);
    }

    match Url::parse(trimmed) {
        Ok(url) => from_url(trimmed, url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(ReferenceDescriptor::Local {
            fs_path: PathBuf::from(trimmed),
        }),
        Err(e) => Err(ResolveError::MalformedReference(format!(
            "'{}': {}",
            trimmed, e
        ))),
    }
}

fn strip_inline_prefix(raw: &str) -> Option<&str> {
    let prefix = raw.get(..INLINE_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(INLINE_PREFIX) {
        raw.get(INLINE_PREFIX.len()..)
    } else {
        None
    }
}

/// `data:[//][mediatype][;base64],<data>`
fn parse_inline(rest: &str) -> Result<ReferenceDescriptor> {
    let (metadata, data) = rest
        .split_once(',')
        .ok_or_else(|| ResolveError::MalformedReference("no data separator".to_string()))?;

    if data.is_empty() {
        return Err(ResolveError::MalformedReference(
            "no data segment".to_string(),
        ));
    }

    let metadata = metadata.strip_prefix("//").unwrap_or(metadata);
    let (media_type, encoding) = match metadata.rsplit_once(';') {
        Some((head, tail)) if tail == BASE64_TOKEN => (head, PayloadEncoding::Base64),
        _ => (metadata, PayloadEncoding::None),
    };

    Ok(ReferenceDescriptor::Inline {
        media_type: (!media_type.is_empty()).then(|| media_type.to_string()),
        encoding,
        raw_data: data.to_string(),
    })
}

fn from_url(raw: &str, url: Url) -> Result<ReferenceDescriptor> {
    match url.scheme() {
        "file" => url
            .to_file_path()
            .map(|fs_path| ReferenceDescriptor::Local { fs_path })
            .map_err(|_| {
                ResolveError::MalformedReference(format!("'{}' is not a local file URL", raw))
            }),
        "http" | "https" => Ok(ReferenceDescriptor::Remote { url }),
        WORKFLOW_SCHEME => {
            let joined = format!("{}{}", url.host_str().unwrap_or(""), url.path());
            let decoded = percent_decode_str(&joined)
                .decode_utf8()
                .map_err(|e| ResolveError::MalformedReference(format!("'{}': {}", raw, e)))?;
            let relative_path = decoded.trim_start_matches('/').to_string();
            check_relative(&relative_path)?;
            Ok(ReferenceDescriptor::WorkflowRelative { relative_path })
        }
        // Drive letters such as `C:\data\input.csv`.
        scheme if scheme.len() == 1 => Ok(ReferenceDescriptor::Local {
            fs_path: PathBuf::from(raw),
        }),
        // `notes:v2.txt` has no protocol segment and is a file name.
        _ if !raw.contains("://") => Ok(ReferenceDescriptor::Local {
            fs_path: PathBuf::from(raw),
        }),
        scheme => Err(ResolveError::MalformedReference(format!(
            "unsupported scheme '{}'",
            scheme
        ))),
    }
}

/// Workflow-relative paths must stay below the workflow location.
fn check_relative(relative_path: &str) -> Result<()> {
    if relative_path.is_empty() {
        return Err(ResolveError::MalformedReference(
            "empty workflow-relative path".to_string(),
        ));
    }
    // `http://host/x` and similar would be joined as absolute URLs.
    let first = relative_path.split(['/', '\\']).next().unwrap_or("");
    if first.contains(':') {
        return Err(ResolveError::MalformedReference(format!(
            "workflow-relative path '{}' names another location",
            relative_path
        )));
    }
    let escapes = Path::new(relative_path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ResolveError::MalformedReference(format!(
            "workflow-relative path '{}' leaves the workflow",
            relative_path
        )));
    }
    Ok(())
}

/// Decodes the data segment of an inline payload.
pub fn decode_payload(encoding: PayloadEncoding, raw_data: &str) -> Result<Vec<u8>> {
    match encoding {
        PayloadEncoding::Base64 => BASE64
            .decode(raw_data)
            .map_err(|e| ResolveError::InvalidPayloadEncoding(e.to_string())),
        PayloadEncoding::None => Ok(raw_data.as_bytes().to_vec()),
    }
}

/// Self-contained `data:` URI carrying `bytes` base64-encoded, so the URI
/// reproduces the payload exactly.
pub fn inline_uri(media_type: Option<&str>, bytes: &[u8]) -> Result<Url> {
    let raw = format!(
        "{}{};{},{}",
        INLINE_PREFIX,
        media_type.unwrap_or(""),
        BASE64_TOKEN,
        BASE64.encode(bytes)
    );
    Url::parse(&raw).map_err(|e| ResolveError::MalformedReference(e.to_string()))
}

/// Inverse of [`decode_payload`].
pub fn encode_payload(encoding: PayloadEncoding, bytes: &[u8]) -> String {
    match encoding {
        PayloadEncoding::Base64 => BASE64.encode(bytes),
        PayloadEncoding::None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

pub fn extension_for_media_type(media_type: &str) -> Option<&'static str> {
    let normalized = media_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    MEDIA_TYPE_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == normalized)
        .map(|(_, ext)| *ext)
}

/// Splits the last path segment of a reference into `(stem, extension)`.
///
/// Query string and fragment are not part of the file identity and are
/// stripped first. The extension keeps its leading dot and is empty when the
/// name has none.
pub fn basis_name(reference: &str) -> (String, String) {
    let without_query = reference.split(['?', '#']).next().unwrap_or("");
    let segment = without_query
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("");
    let segment = percent_decode_str(segment).decode_utf8_lossy();

    match segment.rfind('.') {
        Some(idx) if idx > 0 => (segment[..idx].to_string(), segment[idx..].to_string()),
        _ => (segment.to_string(), String::new()),
    }
}

/// File name shown for a reference. Inline payloads have none.
pub fn display_name(reference: &str) -> String {
    if strip_inline_prefix(reference.trim()).is_some() {
        return String::new();
    }
    let (stem, ext) = basis_name(reference.trim());
    format!("{}{}", stem, ext)
}
