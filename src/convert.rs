//! Bytes-to-text conversion, bounded by size and wall-clock time (§4.5).
//!
//! Conversion is treated as CPU-bound: it always runs on
//! `tokio::task::spawn_blocking` so a slow or pathological document never
//! starves the async I/O executor, the same pool-isolation discipline the
//! teacher's processing pipeline reserves for chunking/embedding (§5, §9).
//! A failure never aborts ingestion — the orchestrator turns it into a
//! fallback document whose body records the failure, so the document is
//! still discoverable even though its content could not be read.

use std::time::Duration;

use thiserror::Error;

/// Why conversion failed, for the fallback document's recorded body (§4.5).
#[derive(Debug, Error, Clone)]
pub enum ConversionError {
    /// The input exceeded the configured maximum size.
    #[error("content exceeds max_size ({actual} > {max})")]
    TooLarge {
        /// Actual byte size of the input.
        actual: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Conversion did not finish within the configured timeout.
    #[error("conversion exceeded timeout of {0:?}")]
    Timeout(Duration),
    /// The blocking conversion task panicked.
    #[error("conversion task panicked: {0}")]
    TaskPanicked(String),
    /// The content could not be parsed for its declared mime type.
    #[error("unsupported or malformed content for mime {mime}: {reason}")]
    Unsupported {
        /// The mime type that was rejected.
        mime: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<ConversionError> for crate::error::ErrorKind {
    fn from(e: ConversionError) -> Self {
        crate::error::ErrorKind::Conversion(e.to_string())
    }
}

/// Converted text plus any metadata the converter could recover (title,
/// detected language, etc). Merged into `Document::metadata` by the caller.
#[derive(Debug, Clone, Default)]
pub struct ConvertedContent {
    /// Converted plain-text-or-markup body.
    pub text: String,
    /// Metadata recovered during conversion (e.g. detected title).
    pub metadata: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Convert raw bytes into text, honoring `max_size` and `timeout`.
///
/// Dispatch is by `mime_hint` prefix/suffix; anything not recognized as
/// text-like is treated as opaque and rejected with `Unsupported` so the
/// orchestrator can record a fallback stub (§4.5).
pub async fn convert(
    bytes: Vec<u8>,
    mime_hint: &str,
    max_size: usize,
    timeout: Duration,
) -> Result<ConvertedContent, ConversionError> {
    if bytes.len() > max_size {
        return Err(ConversionError::TooLarge {
            actual: bytes.len(),
            max: max_size,
        });
    }

    let mime = mime_hint.to_string();
    let task = tokio::task::spawn_blocking(move || convert_blocking(&bytes, &mime));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ConversionError::TaskPanicked(join_err.to_string())),
        Err(_elapsed) => Err(ConversionError::Timeout(timeout)),
    }
}

fn convert_blocking(bytes: &[u8], mime_hint: &str) -> Result<ConvertedContent, ConversionError> {
    let mime = mime_hint.to_lowercase();
    if mime.contains("markdown") || mime.contains("text/plain") || mime.is_empty() {
        return Ok(ConvertedContent {
            text: String::from_utf8_lossy(bytes).into_owned(),
            metadata: Default::default(),
        });
    }
    if mime.contains("html") {
        let raw = String::from_utf8_lossy(bytes);
        return Ok(ConvertedContent {
            text: strip_html_tags(&raw),
            metadata: Default::default(),
        });
    }
    if mime.contains("json") {
        let raw = String::from_utf8_lossy(bytes);
        return Ok(ConvertedContent {
            text: raw.into_owned(),
            metadata: Default::default(),
        });
    }
    if mime.starts_with("text/") {
        return Ok(ConvertedContent {
            text: String::from_utf8_lossy(bytes).into_owned(),
            metadata: Default::default(),
        });
    }

    Err(ConversionError::Unsupported {
        mime: mime_hint.to_string(),
        reason: "no converter registered for this content type".to_string(),
    })
}

/// A deliberately simple tag stripper: good enough to get readable text out
/// of Confluence/publicdocs HTML bodies without pulling in a full HTML parser
/// dependency the teacher doesn't already carry.
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build the fallback document body the orchestrator stores when conversion
/// fails, so the document is still searchable by name even though its
/// content could not be read (§4.5).
pub fn fallback_body(title: &str, url: &str, error: &ConversionError) -> String {
    format!("[conversion failed for \"{title}\" at {url}: {error}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn converts_plain_text_verbatim() {
        let result = convert(
            b"hello world".to_vec(),
            "text/plain",
            1024,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.text, "hello world");
    }

    #[tokio::test]
    async fn rejects_oversized_input() {
        let result = convert(vec![0u8; 10], "text/plain", 5, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConversionError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn strips_html_tags() {
        let result = convert(
            b"<html><body><p>Hello <b>world</b></p></body></html>".to_vec(),
            "text/html",
            1024,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.text, "Hello world");
    }

    #[tokio::test]
    async fn unsupported_mime_is_an_error() {
        let result = convert(
            b"\x89PNG".to_vec(),
            "image/png",
            1024,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ConversionError::Unsupported { .. })));
    }

    #[test]
    fn fallback_body_mentions_title_and_url() {
        let err = ConversionError::Unsupported {
            mime: "image/png".into(),
            reason: "no converter".into(),
        };
        let body = fallback_body("diagram.png", "file:///tmp/diagram.png", &err);
        assert!(body.contains("diagram.png"));
        assert!(body.contains("file:///tmp/diagram.png"));
    }
}
