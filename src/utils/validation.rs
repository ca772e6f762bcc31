use crate::error::{ResolveError, Result};
use crate::models::ValidationPolicy;

/// Maximum length of a generated file name component
pub const MAX_NAME_LEN: usize = 120;

/// Checks a resolved file name against the extension allow-list.
///
/// The extension is everything after the last `.`, compared case-insensitively
/// against policy entries that carry their leading dot.
pub fn validate_extension(file_name: &str, policy: &ValidationPolicy) -> Result<()> {
    if policy.accepts_any() {
        return Ok(());
    }

    let extension = match file_name.rfind('.') {
        Some(idx) if idx + 1 < file_name.len() => file_name[idx..].to_lowercase(),
        _ => {
            return Err(ResolveError::InvalidExtension("no extension".to_string()));
        }
    };

    if policy
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    {
        return Ok(());
    }

    Err(ResolveError::InvalidExtension(format!(
        "'{}' has extension '{}', expected one of: {}",
        file_name,
        extension,
        policy
            .allowed_extensions
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Makes a name derived from a reference safe to use as a path component.
///
/// Separators and reserved characters become `_`, and the result is cut to
/// [`MAX_NAME_LEN`] bytes on a char boundary.
pub fn sanitize_file_name(name: &str) -> String {
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        tracing::debug!("Sanitizing path-like file name: {}", name);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == '/'
                || c == '\\'
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = sanitized.trim_start_matches('.');

    let mut end = sanitized.len().min(MAX_NAME_LEN);
    while !sanitized.is_char_boundary(end) {
        end -= 1;
    }
    let sanitized = &sanitized[..end];

    if sanitized.is_empty() {
        "file".to_string()
    } else {
        sanitized.to_string()
    }
}
