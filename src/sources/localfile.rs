//! Local filesystem source adapter (§4.7).
//!
//! Grounded on `context-harness::connector_fs::scan_filesystem`: same
//! `walkdir` + glob include/exclude shape and the same default excludes
//! (`.git`, `target`, `node_modules`), generalized from an eagerly-collected
//! `Vec<SourceItem>` into a lazy `try_stream!` of `Document`.

use std::path::{Path, PathBuf};

use async_stream::try_stream;
use chrono::{TimeZone, Utc};
use futures_util::stream::BoxStream;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::convert::{convert, fallback_body};
use crate::model::{Document, SourceType};

use super::{DocumentSource, ProjectContext, SourceError, build_document};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

pub struct LocalfileSource {
    name: String,
    root: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl LocalfileSource {
    pub fn new(name: String, path: String, include: Vec<String>, exclude: Vec<String>) -> Self {
        Self {
            name,
            root: PathBuf::from(path),
            include,
            exclude,
        }
    }
}

impl DocumentSource for LocalfileSource {
    fn source_type(&self) -> SourceType {
        SourceType::Localfile
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, ctx: &'a ProjectContext) -> BoxStream<'a, Result<Document, SourceError>> {
        Box::pin(try_stream! {
            let include_set = build_globset(&self.include)?;
            let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
            excludes.extend(self.exclude.iter().cloned());
            let exclude_set = build_globset(&excludes)?;

            for entry in WalkDir::new(&self.root) {
                let entry = entry.map_err(|e| SourceError::Io {
                    path: self.root.display().to_string(),
                    source: std::io::Error::other(e),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let path = entry.path();
                let relative = path.strip_prefix(&self.root).unwrap_or(path);
                let rel_str = relative.to_string_lossy().to_string();

                if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                    continue;
                }

                let document = read_document(&self.name, path, &rel_str, ctx).await?;
                yield document;
            }
        })
    }
}

async fn read_document(
    source_name: &str,
    path: &Path,
    relative_path: &str,
    ctx: &ProjectContext,
) -> Result<Document, SourceError> {
    let metadata = std::fs::metadata(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let modified = metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let modified_secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let timestamp = Utc.timestamp_opt(modified_secs, 0).single().unwrap_or_else(Utc::now);

    let title = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let content_type = guess_content_type(path);
    let url = format!("file://{}", path.display());

    let bytes = std::fs::read(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let (content, content_type) = match convert(bytes, &content_type, ctx.max_file_size as usize, ctx.conversion_timeout).await {
        Ok(converted) => (converted.text, content_type),
        Err(error) => (fallback_body(&title, &url, &error), "text/plain".to_string()),
    };

    Ok(build_document(
        SourceType::Localfile,
        source_name,
        &url,
        title,
        content_type,
        content,
        Default::default(),
        timestamp,
        timestamp,
        false,
    ))
}

fn guess_content_type(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase().as_str() {
        "md" | "markdown" => "text/markdown".to_string(),
        "html" | "htm" => "text/html".to_string(),
        "json" => "application/json".to_string(),
        "txt" | "" => "text/plain".to_string(),
        other => format!("text/{other}"),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SourceError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| SourceError::InvalidConfig(e.to_string()))?);
    }
    builder.build().map_err(|e| SourceError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{pin_mut, stream::StreamExt};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn context() -> ProjectContext {
        ProjectContext {
            project_id: "proj".into(),
            http: Arc::new(crate::http_client::RateLimitedHttpClient::new(Default::default()).unwrap()),
            cache_dir: std::env::temp_dir(),
            max_file_size: 1024 * 1024,
            conversion_timeout: std::time::Duration::from_secs(5),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn enumerates_matching_files_and_skips_excluded_dirs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# Hello").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("ignored.md"), "nope").unwrap();

        let source = LocalfileSource::new(
            "docs".into(),
            dir.path().display().to_string(),
            vec!["**/*.md".into()],
            vec![],
        );
        let ctx = context();
        let stream = source.enumerate(&ctx);
        pin_mut!(stream);
        let mut docs = Vec::new();
        while let Some(item) = stream.next().await {
            docs.push(item.unwrap());
        }
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "a.md");
        assert!(docs[0].content.contains("Hello"));
    }
}
