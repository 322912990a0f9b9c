//! Path sanitization for user-supplied identifiers and filenames.
//!
//! Every event id, person id and filename passes through here before it touches
//! the filesystem or a URL. The output is always a single path segment. A value
//! that had to be changed is logged as a potential security violation, and the
//! sanitized value is used from then on; a value that sanitizes to nothing is
//! rejected with [`GalleryError::InvalidIdentifier`].

use crate::error::{GalleryError, GalleryResult};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// A validated single path segment.
///
/// Only produced by [`identifier`] and [`filename`], so holding one means the
/// value contains no separators, no control characters and no `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment(String);

impl Segment {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for Segment {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

/// Strip separators, drive prefixes, control characters and parent references
/// from an identifier such as an event id or person id.
pub fn sanitize_identifier(component: &str) -> String {
    let mut clean: String = component
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':'))
        .collect();

    while clean.contains("..") {
        clean = clean.replace("..", "");
    }

    if clean == "." {
        clean.clear();
    }

    clean
}

/// Reduce a filename to its final segment, drop leading dots and replace
/// anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    let without_controls: String = filename.chars().filter(|c| !c.is_control()).collect();

    let leaf = without_controls
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    leaf.trim_start_matches('.')
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// Sanitize an identifier for `operation`, logging any change.
pub fn identifier(raw: &str, operation: &str) -> GalleryResult<Segment> {
    checked(raw, sanitize_identifier(raw), "identifier", operation)
}

/// Sanitize a filename for `operation`, logging any change.
pub fn filename(raw: &str, operation: &str) -> GalleryResult<Segment> {
    checked(raw, sanitize_filename(raw), "filename", operation)
}

fn checked(raw: &str, sanitized: String, kind: &str, operation: &str) -> GalleryResult<Segment> {
    if sanitized != raw {
        warn!(
            target: "security",
            kind = kind,
            original = %raw.escape_debug(),
            sanitized = %sanitized,
            operation = operation,
            "Path sanitization applied"
        );
    }

    if sanitized.is_empty() {
        return Err(GalleryError::InvalidIdentifier);
    }

    Ok(Segment(sanitized))
}

/// Resolve `base/<segments..>` and verify the canonical result is still a
/// descendant of the canonical `base`.
///
/// Missing files and containment escapes are both reported as `NotFound`.
pub async fn resolve_within(
    base: &Path,
    segments: &[&Segment],
    operation: &str,
) -> GalleryResult<PathBuf> {
    let candidate = segments
        .iter()
        .fold(base.to_path_buf(), |path, segment| path.join(segment));

    let real_base = match tokio::fs::canonicalize(base).await {
        Ok(path) => path,
        Err(_) => return Err(GalleryError::NotFound),
    };

    let real_candidate = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(_) => return Err(GalleryError::NotFound),
    };

    if !real_candidate.starts_with(&real_base) {
        error!(
            target: "security",
            attempted_path = %candidate.display(),
            resolved_path = %real_candidate.display(),
            operation = operation,
            "Path traversal attempt detected"
        );
        return Err(GalleryError::NotFound);
    }

    Ok(real_candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAVERSALS: &[&str] = &[
        "../",
        "..\\",
        "/",
        "\\",
        "\0",
        "..",
        "../../etc/passwd",
        "..\\..\\windows\\system32",
        "/etc/passwd",
        "C:\\secret.jpg",
        "....//....//x.jpg",
        "E1/../../secret.txt",
        "a\u{7f}b/c\u{1b}d",
    ];

    #[test]
    fn test_sanitize_identifier_never_yields_separator() {
        for input in TRAVERSALS {
            let clean = sanitize_identifier(input);
            assert!(!clean.contains('/'), "{input:?} -> {clean:?}");
            assert!(!clean.contains('\\'), "{input:?} -> {clean:?}");
            assert!(!clean.contains(".."), "{input:?} -> {clean:?}");
            assert!(!clean.chars().any(char::is_control), "{input:?} -> {clean:?}");
        }
    }

    #[test]
    fn test_sanitize_filename_never_yields_separator() {
        for input in TRAVERSALS {
            let clean = sanitize_filename(input);
            assert!(!clean.contains('/'), "{input:?} -> {clean:?}");
            assert!(!clean.contains('\\'), "{input:?} -> {clean:?}");
            assert!(!clean.starts_with('.'), "{input:?} -> {clean:?}");
        }
    }

    #[test]
    fn test_sanitize_identifier_examples() {
        assert_eq!(sanitize_identifier("event-42"), "event-42");
        assert_eq!(sanitize_identifier("../../etc"), "etc");
        assert_eq!(sanitize_identifier("C:\\data"), "Cdata");
        assert_eq!(sanitize_identifier("ev\0ent"), "event");
        assert_eq!(sanitize_identifier("..."), "");
        assert_eq!(sanitize_identifier(".."), "");
    }

    #[test]
    fn test_sanitize_filename_examples() {
        assert_eq!(sanitize_filename("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_filename("../../secret.txt"), "secret.txt");
        assert_eq!(sanitize_filename("..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_filename(".hidden.png"), "hidden.png");
        assert_eq!(sanitize_filename("my photo (1).jpeg"), "my_photo__1_.jpeg");
        assert_eq!(sanitize_filename("watermarked_a.jpg"), "watermarked_a.jpg");
        assert_eq!(sanitize_filename("dir/"), "");
    }

    #[test]
    fn test_empty_result_is_invalid_identifier() {
        assert!(matches!(
            identifier("../..", "test"),
            Err(GalleryError::InvalidIdentifier)
        ));
        assert!(matches!(
            filename("uploads/", "test"),
            Err(GalleryError::InvalidIdentifier)
        ));
    }

    #[test]
    fn test_changed_value_continues_with_sanitized() {
        let segment = identifier("../E1", "test").unwrap();
        assert_eq!(segment.as_str(), "E1");

        let segment = filename("../../a.jpg", "test").unwrap();
        assert_eq!(segment.as_str(), "a.jpg");
    }

    #[tokio::test]
    async fn test_resolve_within_accepts_descendant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("E1")).unwrap();
        std::fs::write(dir.path().join("E1").join("a.jpg"), b"x").unwrap();

        let event = identifier("E1", "test").unwrap();
        let name = filename("a.jpg", "test").unwrap();
        let resolved = resolve_within(dir.path(), &[&event, &name], "test")
            .await
            .unwrap();

        assert!(resolved.ends_with("E1/a.jpg"));
    }

    #[tokio::test]
    async fn test_resolve_within_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let event = identifier("E1", "test").unwrap();

        assert!(matches!(
            resolve_within(dir.path(), &[&event], "test").await,
            Err(GalleryError::NotFound)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_within_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.jpg"), b"secret").unwrap();

        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("E1")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.jpg"),
            base.path().join("E1").join("link.jpg"),
        )
        .unwrap();

        let event = identifier("E1", "test").unwrap();
        let name = filename("link.jpg", "test").unwrap();

        assert!(matches!(
            resolve_within(base.path(), &[&event, &name], "test").await,
            Err(GalleryError::NotFound)
        ));
    }
}
