//! Folder-name and filename sanitization.
//!
//! IMAP servers expose arbitrary hierarchy delimiters (`/`, `.`, `\`, or
//! none at all) and folder names full of filesystem metacharacters. Nothing
//! a server sends may ever resolve to a path outside the account root.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{ArchiveError, ArchiveResult};

const MAX_COMPONENT_BYTES: usize = 255;

static RESERVED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(CON|PRN|AUX|NUL|COM[1-9]|LPT[1-9])$").unwrap());

/// Splits a raw server folder name on the LIST delimiter and sanitizes each
/// hierarchy component. `.` and `..` components are ascent attempts and fail
/// with `PathEscape`; reserved device names fail with `SanitizationFailed`.
/// An empty result maps to `INBOX`.
pub fn sanitize_folder_components(
    raw_name: &str,
    delimiter: Option<&str>,
) -> ArchiveResult<Vec<String>> {
    let parts: Vec<&str> = match delimiter {
        Some(d) if !d.is_empty() => raw_name.split(d).collect(),
        _ => vec![raw_name],
    };

    let mut components = Vec::with_capacity(parts.len());
    for part in parts {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "." || trimmed == ".." {
            return Err(ArchiveError::PathEscape(raw_name.to_string()));
        }
        if RESERVED_NAME.is_match(trimmed) {
            return Err(ArchiveError::SanitizationFailed(format!(
                "reserved name {trimmed:?} in folder {raw_name:?}"
            )));
        }
        let cleaned = substitute_unsafe(trimmed);
        components.push(truncate_utf8(&cleaned, MAX_COMPONENT_BYTES).to_string());
    }

    if components.is_empty() {
        components.push("INBOX".to_string());
    }
    Ok(components)
}

/// Joins sanitized components under `account_root` and verifies the result
/// stays strictly inside it. The component rules above already forbid
/// ascent; this is the final containment gate for I/O code.
pub fn resolve_under_root(account_root: &Path, components: &[String]) -> ArchiveResult<PathBuf> {
    let mut path = account_root.to_path_buf();
    for component in components {
        path.push(component);
    }

    let escape = || {
        ArchiveError::PathEscape(format!(
            "{} leaves {}",
            path.display(),
            account_root.display()
        ))
    };
    let relative = path.strip_prefix(account_root).map_err(|_| escape())?;
    if !relative
        .components()
        .all(|comp| matches!(comp, Component::Normal(_)))
    {
        return Err(escape());
    }
    Ok(path)
}

/// Sanitizes a single filename (attachment names, account directory names).
/// Infallible: hostile input degrades to `_`-substituted text, an empty
/// result becomes `unknown`.
pub fn sanitize_filename(raw: &str) -> String {
    let trimmed = raw.trim();
    let cleaned: String = trimmed
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' | '/' | '\\' => '_',
            _ => c,
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return "unknown".to_string();
    }
    truncate_filename(&cleaned, MAX_COMPONENT_BYTES)
}

/// Splits `name` into stem and extension at the last dot. A leading dot or a
/// trailing dot does not count as an extension separator.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

fn substitute_unsafe(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

/// Truncates to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncates a filename to `max` bytes, sacrificing the stem before the
/// extension so `report-<long>.pdf` stays a `.pdf`.
fn truncate_filename(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    match ext {
        // +1 for the dot; an extension that itself blows the budget is cut raw.
        Some(ext) if ext.len() + 1 < max => {
            let stem_budget = max - ext.len() - 1;
            format!("{}.{}", truncate_utf8(stem, stem_budget), ext)
        }
        _ => truncate_utf8(name, max).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_split_and_substitution() {
        let parts = sanitize_folder_components("Work/Client: A?", Some("/")).unwrap();
        assert_eq!(parts, vec!["Work", "Client_ A_"]);
    }

    #[test]
    fn dot_delimiter_yields_same_components() {
        let slash = sanitize_folder_components("a/b/c", Some("/")).unwrap();
        let dot = sanitize_folder_components("a.b.c", Some(".")).unwrap();
        assert_eq!(slash, dot);
    }

    #[test]
    fn parent_component_is_path_escape() {
        let err = sanitize_folder_components("Work/../../etc", Some("/")).unwrap_err();
        assert!(matches!(err, ArchiveError::PathEscape(_)));
    }

    #[test]
    fn reserved_name_is_rejected() {
        let err = sanitize_folder_components("com1", Some("/")).unwrap_err();
        assert!(matches!(err, ArchiveError::SanitizationFailed(_)));
    }

    #[test]
    fn empty_name_maps_to_inbox() {
        assert_eq!(
            sanitize_folder_components("", Some("/")).unwrap(),
            vec!["INBOX"]
        );
        assert_eq!(
            sanitize_folder_components("  /  ", Some("/")).unwrap(),
            vec!["INBOX"]
        );
    }

    #[test]
    fn filename_strips_separators() {
        assert_eq!(sanitize_filename("..\\..\\evil.exe"), ".._.._evil.exe");
        assert_eq!(sanitize_filename("a/b:c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("   "), "unknown");
        assert_eq!(sanitize_filename(".."), "unknown");
    }
}
