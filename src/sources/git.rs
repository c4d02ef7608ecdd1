//! Git repository source adapter (§4.7).
//!
//! Grounded on `context-harness::connector_git::scan_git`: shallow clone (or
//! fetch+reset to update an existing cache) via the `git` binary, then a
//! `walkdir` pass extracting per-file `git log` metadata (last commit
//! timestamp, author) and a browsable GitHub/GitLab blob URL. Generalized
//! from a synchronous `Vec<SourceItem>` return into a lazy `Document` stream;
//! the clone/fetch step still shells out synchronously (git has no async
//! API) but runs inside `spawn_blocking` so it never stalls the executor.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_stream::try_stream;
use chrono::{TimeZone, Utc};
use futures_util::stream::BoxStream;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::model::{Document, SourceType};

use super::{DocumentSource, ProjectContext, SourceError, build_document};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Enumerates tracked files at a branch tip of a cloned git repository.
pub struct GitSource {
    name: String,
    url: String,
    branch: String,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl GitSource {
    pub fn new(name: String, url: String, branch: String, include: Vec<String>, exclude: Vec<String>) -> Self {
        Self {
            name,
            url,
            branch,
            include,
            exclude,
        }
    }
}

impl DocumentSource for GitSource {
    fn source_type(&self) -> SourceType {
        SourceType::Git
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, ctx: &'a ProjectContext) -> BoxStream<'a, Result<Document, SourceError>> {
        Box::pin(try_stream! {
            let cache_dir = ctx.cache_dir.join(".git-cache").join(short_hash(&self.url));
            let url = self.url.clone();
            let branch = self.branch.clone();
            let cache_dir_clone = cache_dir.clone();
            let head_sha = tokio::task::spawn_blocking(move || sync_repo(&url, &branch, &cache_dir_clone))
                .await
                .map_err(|e| SourceError::Process { program: "git".into(), message: e.to_string() })??;

            let include_set = build_globset(&self.include)?;
            let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
            excludes.extend(self.exclude.iter().cloned());
            let exclude_set = build_globset(&excludes)?;

            for entry in WalkDir::new(&cache_dir) {
                let entry = entry.map_err(|e| SourceError::Io {
                    path: cache_dir.display().to_string(),
                    source: std::io::Error::other(e),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let relative = path.strip_prefix(&cache_dir).unwrap_or(path);
                let rel_str = relative.to_string_lossy().to_string();
                if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                    continue;
                }

                let document = build_file_document(&self.name, &self.url, &head_sha, &cache_dir, path, &rel_str).await?;
                yield document;
            }
        })
    }
}

fn sync_repo(url: &str, branch: &str, cache_dir: &Path) -> Result<String, SourceError> {
    if cache_dir.join(".git").exists() {
        run_git(cache_dir, &["fetch", "origin", branch])?;
        run_git(cache_dir, &["reset", "--hard", &format!("origin/{branch}")])?;
    } else {
        std::fs::create_dir_all(cache_dir).map_err(|source| SourceError::Io {
            path: cache_dir.display().to_string(),
            source,
        })?;
        let parent = cache_dir.parent().unwrap_or(cache_dir);
        run_git(
            parent,
            &[
                "clone",
                "--branch",
                branch,
                "--single-branch",
                "--depth",
                "1",
                url,
                &cache_dir.display().to_string(),
            ],
        )?;
    }
    run_git_output(cache_dir, &["rev-parse", "HEAD"])
}

fn run_git(dir: &Path, args: &[&str]) -> Result<(), SourceError> {
    run_git_output(dir, args).map(|_| ())
}

fn run_git_output(dir: &Path, args: &[&str]) -> Result<String, SourceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| SourceError::Process {
            program: "git".into(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(SourceError::Process {
            program: "git".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn build_file_document(
    source_name: &str,
    repo_url: &str,
    head_sha: &str,
    repo_dir: &Path,
    path: &Path,
    relative_path: &str,
) -> Result<Document, SourceError> {
    let path_owned = path.to_path_buf();
    let repo_dir_owned = repo_dir.to_path_buf();
    let (body, commit_ts, author) = tokio::task::spawn_blocking(move || {
        let body = std::fs::read_to_string(&path_owned).unwrap_or_default();
        let commit_ts = file_last_commit_time(&repo_dir_owned, &path_owned);
        let author = file_last_author(&repo_dir_owned, &path_owned);
        (body, commit_ts, author)
    })
    .await
    .map_err(|e| SourceError::Process { program: "git".into(), message: e.to_string() })?;

    let updated_secs = commit_ts.unwrap_or(0);
    let timestamp = Utc.timestamp_opt(updated_secs, 0).single().unwrap_or_else(Utc::now);
    let title = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let url = build_web_url(repo_url, head_sha, relative_path);

    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("git_sha".to_string(), serde_json::Value::String(head_sha.to_string()));
    metadata.insert("repo_url".to_string(), serde_json::Value::String(repo_url.to_string()));
    if let Some(author) = author {
        metadata.insert(
            crate::model::metadata_keys::AUTHOR.to_string(),
            serde_json::Value::String(author),
        );
    }

    Ok(build_document(
        SourceType::Git,
        source_name,
        &url,
        title,
        "text/plain".to_string(),
        body,
        metadata,
        timestamp,
        timestamp,
        false,
    ))
}

fn file_last_commit_time(repo_dir: &Path, path: &Path) -> Option<i64> {
    let output = Command::new("git")
        .args(["log", "-1", "--format=%ct", "--"])
        .arg(path)
        .current_dir(repo_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse::<i64>().ok()
}

fn file_last_author(repo_dir: &Path, path: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["log", "-1", "--format=%an", "--"])
        .arg(path)
        .current_dir(repo_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let author = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if author.is_empty() { None } else { Some(author) }
}

fn build_web_url(repo_url: &str, sha: &str, relative_path: &str) -> String {
    if let Some(rest) = repo_url.strip_prefix("git@github.com:") {
        let repo = rest.trim_end_matches(".git");
        return format!("https://github.com/{repo}/blob/{sha}/{relative_path}");
    }
    if repo_url.contains("github.com") {
        let base = repo_url.trim_end_matches(".git");
        return format!("{base}/blob/{sha}/{relative_path}");
    }
    if let Some(rest) = repo_url.strip_prefix("git@gitlab.com:") {
        let repo = rest.trim_end_matches(".git");
        return format!("https://gitlab.com/{repo}/-/blob/{sha}/{relative_path}");
    }
    format!("git://{repo_url}/{relative_path}")
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
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

    #[test]
    fn web_url_handles_github_ssh_remote() {
        let url = build_web_url("git@github.com:acme/platform.git", "abc123", "docs/readme.md");
        assert_eq!(url, "https://github.com/acme/platform/blob/abc123/docs/readme.md");
    }

    #[test]
    fn web_url_falls_back_for_unknown_hosts() {
        let url = build_web_url("https://example.com/repo.git", "abc123", "a.md");
        assert_eq!(url, "git://https://example.com/repo.git/a.md");
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("https://github.com/acme/platform.git"), short_hash("https://github.com/acme/platform.git"));
    }
}
