//! Stable document identity and content hashing (§4.1).
//!
//! Both functions are pure and never configurable: stability is a
//! first-class requirement so that re-running ingestion from a different
//! working directory, or via a symlink, produces identical ids.

use sha2::{Digest, Sha256};

/// Derive the stable document id from `(source_type, source_name, url)`.
///
/// The inputs are lower-cased (source type only), canonicalized, joined with
/// `:`, and hashed with SHA-256. Canonicalization of the url:
/// - percent-decodes the path,
/// - resolves `.`/`..` segments,
/// - preserves a trailing slash only when the url looks like a directory,
/// - resolves symlinks to the real path for `file://` urls.
pub fn document_id(source_type: &str, source_name: &str, url: &str) -> String {
    let canonical_url = canonicalize_url(url);
    let joined = format!("{}:{}:{}", source_type.to_lowercase(), source_name, canonical_url);
    hex_sha256(joined.as_bytes())
}

/// SHA-256 hex digest of a document's content, the authoritative change detector.
pub fn content_hash(text: &str) -> String {
    hex_sha256(text.as_bytes())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonicalize a url for identity purposes.
///
/// `file://` urls are resolved against the filesystem (symlinks followed to
/// their real path) when the path exists; urls for other schemes are
/// normalized lexically (percent-decode + `.`/`..` resolution) without any
/// network or filesystem access.
pub fn canonicalize_url(url: &str) -> String {
    if let Some(path) = url.strip_prefix("file://") {
        return canonicalize_file_url(path);
    }
    lexical_normalize(url)
}

fn canonicalize_file_url(path: &str) -> String {
    let decoded = percent_decode(path);
    let had_trailing_slash = decoded.ends_with('/') && decoded.len() > 1;
    let resolved = std::fs::canonicalize(&decoded)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(decoded);
    let resolved = if had_trailing_slash && !resolved.ends_with('/') {
        format!("{resolved}/")
    } else {
        resolved
    };
    format!("file://{resolved}")
}

fn lexical_normalize(url: &str) -> String {
    let decoded = percent_decode(url);
    let had_trailing_slash = decoded.ends_with('/') && decoded.len() > 1;

    let (scheme_and_host, path) = match decoded.find("://") {
        Some(idx) => {
            let rest = &decoded[idx + 3..];
            match rest.find('/') {
                Some(slash) => (decoded[..idx + 3 + slash].to_string(), &rest[slash..]),
                None => (decoded.clone(), ""),
            }
        }
        None => (String::new(), decoded.as_str()),
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized_path = segments.join("/");
    if path.starts_with('/') {
        normalized_path = format!("/{normalized_path}");
    }
    if had_trailing_slash && !normalized_path.ends_with('/') {
        normalized_path.push('/');
    }

    format!("{scheme_and_host}{normalized_path}")
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_deterministic() {
        let a = document_id("git", "my-repo", "https://example.com/readme.md");
        let b = document_id("git", "my-repo", "https://example.com/readme.md");
        assert_eq!(a, b);
    }

    #[test]
    fn document_id_is_case_insensitive_on_source_type() {
        let a = document_id("Git", "my-repo", "https://example.com/x");
        let b = document_id("git", "my-repo", "https://example.com/x");
        assert_eq!(a, b);
    }

    #[test]
    fn document_id_differs_by_url() {
        let a = document_id("git", "my-repo", "https://example.com/a.md");
        let b = document_id("git", "my-repo", "https://example.com/b.md");
        assert_ne!(a, b);
    }

    #[test]
    fn content_hash_detects_single_byte_changes() {
        let a = content_hash("hello world");
        let b = content_hash("hello worle");
        assert_ne!(a, b);
    }

    #[test]
    fn percent_decoding_normalizes_equivalent_urls() {
        let a = canonicalize_url("https://example.com/a%20b.md");
        let b = canonicalize_url("https://example.com/a b.md");
        assert_eq!(a, b);
    }

    #[test]
    fn dot_segments_are_resolved() {
        let a = canonicalize_url("https://example.com/a/../b.md");
        let b = canonicalize_url("https://example.com/b.md");
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_slash_preserved_for_directories() {
        let normalized = canonicalize_url("https://example.com/docs/");
        assert!(normalized.ends_with('/'));
    }

    #[test]
    fn file_urls_resolve_through_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.txt");
        std::fs::write(&real, "content").unwrap();
        let link = dir.path().join("link.txt");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, &link).unwrap();

        #[cfg(unix)]
        {
            let via_real = document_id("localfile", "A", &format!("file://{}", real.display()));
            let via_link = document_id("localfile", "A", &format!("file://{}", link.display()));
            assert_eq!(via_real, via_link);
        }
    }
}
