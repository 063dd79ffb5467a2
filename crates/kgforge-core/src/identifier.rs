//! Safe-identifier validation for Cypher structural positions.
//!
//! Labels, relationship types and property keys that appear in MERGE/MATCH
//! patterns cannot be bound as parameters, so they are spliced into query
//! text. Only names matching `^[A-Za-z_][A-Za-z0-9_]*$` are allowed through.

use crate::error::ItemError;

/// Returns true if `name` can be embedded verbatim as a label, type or key.
pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a structural name, returning it unchanged on success.
pub fn ensure_safe(name: &str) -> Result<&str, ItemError> {
    if is_safe_identifier(name) {
        Ok(name)
    } else {
        Err(ItemError::UnsafeIdentifier {
            value: name.to_string(),
        })
    }
}

/// Rewrite a raw column header into a safe identifier.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`; a leading digit gets
/// an extra `_` prefix. An empty header maps to `_`.
pub fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
