//! Search service: three read-only tools over Qdrant (§4.11).
//!
//! Each tool embeds the query exactly once, then issues one or more
//! filtered Qdrant searches and post-processes hits entirely in-process.
//! The state store is never touched here — search is read-only (§5).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::embedding::{EmbeddingClient, EmbeddingError};
use crate::model::{SourceType, metadata_keys};
use crate::qdrant::{QdrantError, QdrantService, SearchFilterArgs, build_filter, stream_payloads_with_ids};

/// Project scope assumed when a tool call omits `project_id`, matching the
/// MCP server's env-var-only configuration surface (§6): it has no loaded
/// project list to default to, so callers supply `project_id` per request,
/// falling back to this single-tenant default when they don't.
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Errors raised by a search-service call.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The embedding call failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// A Qdrant call failed.
    #[error(transparent)]
    Qdrant(#[from] QdrantError),
    /// The request itself was malformed (§7: `InvalidRequest`).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<SearchError> for crate::error::ErrorKind {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Embedding(err) => err.into(),
            SearchError::Qdrant(err) => err.into(),
            SearchError::InvalidRequest(msg) => crate::error::ErrorKind::InvalidRequest(msg),
        }
    }
}

/// One ranked hit, shared shape across all three tools (§4.11).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Cosine similarity score, higher is closer.
    pub score: f32,
    /// The source document this chunk came from.
    pub document_id: String,
    /// 0-based position of this chunk within its document.
    pub chunk_index: usize,
    /// The chunk's text.
    pub content: String,
    /// The adapter kind that produced the source document.
    pub source_type: SourceType,
    /// The configured source instance name.
    pub source_name: String,
    /// Canonical link back to the origin document.
    pub url: String,
    /// The document's title.
    pub title: String,
    /// Remaining freeform metadata carried on the point's payload.
    pub metadata: BTreeMap<String, Value>,
}

/// `search` tool arguments (§4.11).
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    /// Natural-language query to embed and match against.
    pub query: String,
    /// Project to scope the search to; defaults to [`DEFAULT_PROJECT_ID`].
    #[serde(default)]
    pub project_id: Option<String>,
    /// Maximum hits to return, clamped to `[1, 100]`.
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    /// Restrict hits to one or more `source_type`s; empty means no restriction.
    #[serde(default)]
    pub source_types: Vec<SourceType>,
}

fn default_search_limit() -> usize {
    5
}

/// `hierarchy_search` tool arguments (§4.11).
#[derive(Debug, Clone, Deserialize)]
pub struct HierarchySearchRequest {
    /// Natural-language query to embed and match against.
    pub query: String,
    /// Project to scope the search to; defaults to [`DEFAULT_PROJECT_ID`].
    #[serde(default)]
    pub project_id: Option<String>,
    /// Maximum hits to return, clamped to `[1, 100]`.
    #[serde(default = "default_hierarchy_limit")]
    pub limit: usize,
    /// Group results by root ancestor instead of returning a flat ranked list.
    #[serde(default)]
    pub organize_by_hierarchy: bool,
    /// Hierarchy-specific post-filters.
    #[serde(default)]
    pub hierarchy_filter: HierarchyFilter,
}

fn default_hierarchy_limit() -> usize {
    10
}

/// Post-filters applied after the candidate set is fetched (§4.11).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HierarchyFilter {
    /// Keep only candidates with no ancestors (top of a Confluence space).
    #[serde(default)]
    pub root_only: bool,
    /// Keep only candidates whose ancestor chain has exactly this length.
    #[serde(default)]
    pub depth: Option<usize>,
    /// Keep only candidates whose immediate parent has this title.
    #[serde(default)]
    pub parent_title: Option<String>,
    /// Keep only candidates that do (`true`) or don't (`false`) have children.
    #[serde(default)]
    pub has_children: Option<bool>,
}

/// One hit enriched with its hierarchy ancestor path.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyHit {
    /// The underlying ranked hit.
    #[serde(flatten)]
    pub hit: SearchHit,
    /// Breadcrumb of ancestor titles, root first.
    pub ancestors: Vec<String>,
}

/// One root-ancestor group of `hierarchy_search` results.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyGroup {
    /// The root ancestor title shared by every hit in this group.
    pub root: String,
    /// Hits under this root, sorted by `(ancestors, score desc)`.
    pub hits: Vec<HierarchyHit>,
}

/// `hierarchy_search` response: flat or grouped depending on the request.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HierarchySearchResponse {
    /// `organize_by_hierarchy=false`: one ranked list.
    Flat(Vec<HierarchyHit>),
    /// `organize_by_hierarchy=true`: grouped by root ancestor.
    Grouped(Vec<HierarchyGroup>),
}

/// `attachment_search` tool arguments (§4.11).
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentSearchRequest {
    /// Natural-language query to embed and match against.
    pub query: String,
    /// Project to scope the search to; defaults to [`DEFAULT_PROJECT_ID`].
    #[serde(default)]
    pub project_id: Option<String>,
    /// Maximum hits to return, clamped to `[1, 100]`.
    #[serde(default = "default_attachment_limit")]
    pub limit: usize,
    /// Batch-fetch each hit's parent title/url.
    #[serde(default = "default_true")]
    pub include_parent_context: bool,
    /// Attachment-specific post-filters.
    #[serde(default)]
    pub attachment_filter: AttachmentFilter,
}

fn default_attachment_limit() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Post-filters applied after the candidate set is fetched (§4.11).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentFilter {
    /// Restrict the candidate fetch to documents with a non-null `attachment_of`.
    #[serde(default)]
    pub attachments_only: bool,
    /// Keep only hits whose `content_type` or filename extension matches.
    #[serde(default)]
    pub file_type: Option<String>,
    /// Keep only hits whose `file_size` is at least this many bytes.
    #[serde(default)]
    pub file_size_min: Option<u64>,
    /// Keep only hits whose `file_size` is at most this many bytes.
    #[serde(default)]
    pub file_size_max: Option<u64>,
    /// Keep only hits whose `author` matches exactly.
    #[serde(default)]
    pub author: Option<String>,
    /// Keep only hits whose parent document's title matches exactly.
    #[serde(default)]
    pub parent_document_title: Option<String>,
}

/// Title and url of an attachment's parent document.
#[derive(Debug, Clone, Serialize)]
pub struct ParentContext {
    /// The parent document's id.
    pub document_id: String,
    /// The parent document's title.
    pub title: String,
    /// Canonical link back to the parent document.
    pub url: String,
}

/// One attachment hit, optionally enriched with its parent's title/url.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentHit {
    /// The underlying ranked hit.
    #[serde(flatten)]
    pub hit: SearchHit,
    /// The attachment's parent document, if `include_parent_context` was set
    /// and a parent could be resolved.
    pub parent: Option<ParentContext>,
}

/// Embeds queries and issues filtered Qdrant searches on behalf of the MCP
/// server's three tools. Holds no mutable state; safe to share behind an
/// `Arc` across concurrent tool calls (§5: "the server library handles
/// multiplexing").
pub struct SearchService {
    qdrant: Arc<QdrantService>,
    embedding: Arc<dyn EmbeddingClient>,
    collection_name: String,
}

impl SearchService {
    /// Build a search service over one collection.
    pub fn new(qdrant: Arc<QdrantService>, embedding: Arc<dyn EmbeddingClient>, collection_name: String) -> Self {
        Self {
            qdrant,
            embedding,
            collection_name,
        }
    }

    /// `search(query, limit, source_types?)` (§4.11).
    pub async fn search(&self, request: SearchRequest, cancel: &CancellationToken) -> Result<Vec<SearchHit>, SearchError> {
        let query = require_non_empty_query(&request.query)?;
        let limit = request.limit.clamp(1, 100);
        let project_id = project_id_or_default(&request.project_id);
        let vector = self.embed_query(query, cancel).await?;

        let mut hits = Vec::new();
        if request.source_types.is_empty() {
            let filter = SearchFilterArgs::for_project(project_id);
            let points = self.qdrant.search(&self.collection_name, vector, limit, &filter, None).await?;
            hits.extend(points.into_iter().filter_map(hit_from_point));
        } else {
            for source_type in &request.source_types {
                let filter = SearchFilterArgs {
                    source_type: Some(source_type.as_str().to_string()),
                    ..SearchFilterArgs::for_project(project_id)
                };
                let points = self
                    .qdrant
                    .search(&self.collection_name, vector.clone(), limit, &filter, None)
                    .await?;
                hits.extend(points.into_iter().filter_map(hit_from_point));
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// `hierarchy_search(query, limit, organize_by_hierarchy, hierarchy_filter)` (§4.11).
    pub async fn hierarchy_search(
        &self,
        request: HierarchySearchRequest,
        cancel: &CancellationToken,
    ) -> Result<HierarchySearchResponse, SearchError> {
        let query = require_non_empty_query(&request.query)?;
        let limit = request.limit.clamp(1, 100);
        let project_id = project_id_or_default(&request.project_id);
        let vector = self.embed_query(query, cancel).await?;

        let filter = SearchFilterArgs {
            source_type: Some(SourceType::Confluence.as_str().to_string()),
            ..SearchFilterArgs::for_project(project_id)
        };
        let candidates = self
            .qdrant
            .search(&self.collection_name, vector, limit.saturating_mul(3), &filter, None)
            .await?;

        let mut hits: Vec<HierarchyHit> = candidates
            .into_iter()
            .filter_map(hit_from_point)
            .map(|hit| {
                let ancestors = ancestors_of(&hit);
                HierarchyHit { hit, ancestors }
            })
            .collect();

        let needs_children_scan = request.hierarchy_filter.has_children.is_some();
        let ancestor_titles = if needs_children_scan {
            Some(self.collect_ancestor_titles(project_id).await?)
        } else {
            None
        };

        let hierarchy_filter = &request.hierarchy_filter;
        hits.retain(|candidate| {
            if hierarchy_filter.root_only && !candidate.ancestors.is_empty() {
                return false;
            }
            if let Some(depth) = hierarchy_filter.depth
                && candidate.ancestors.len() != depth
            {
                return false;
            }
            if let Some(parent_title) = &hierarchy_filter.parent_title
                && candidate.ancestors.last() != Some(parent_title)
            {
                return false;
            }
            if let Some(has_children) = hierarchy_filter.has_children {
                let is_ancestor = ancestor_titles
                    .as_ref()
                    .is_some_and(|titles| titles.contains(&candidate.hit.title));
                if is_ancestor != has_children {
                    return false;
                }
            }
            true
        });

        sort_by_score(&mut hits, |h| h.hit.score);
        hits.truncate(limit);

        if request.organize_by_hierarchy {
            Ok(HierarchySearchResponse::Grouped(group_by_root(hits)))
        } else {
            Ok(HierarchySearchResponse::Flat(hits))
        }
    }

    /// `attachment_search(query, limit, include_parent_context, attachment_filter)` (§4.11).
    pub async fn attachment_search(
        &self,
        request: AttachmentSearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<AttachmentHit>, SearchError> {
        let query = require_non_empty_query(&request.query)?;
        let limit = request.limit.clamp(1, 100);
        let project_id = project_id_or_default(&request.project_id);
        let vector = self.embed_query(query, cancel).await?;

        let filter = SearchFilterArgs {
            attachment: request.attachment_filter.attachments_only.then_some(true),
            ..SearchFilterArgs::for_project(project_id)
        };
        let candidates = self
            .qdrant
            .search(&self.collection_name, vector, limit.saturating_mul(3), &filter, None)
            .await?;
        let mut hits: Vec<SearchHit> = candidates.into_iter().filter_map(hit_from_point).collect();

        let attachment_filter = &request.attachment_filter;
        hits.retain(|hit| {
            if let Some(file_type) = &attachment_filter.file_type
                && !matches_file_type(hit, file_type)
            {
                return false;
            }
            if let Some(min) = attachment_filter.file_size_min
                && file_size_of(hit).unwrap_or(0) < min
            {
                return false;
            }
            if let Some(max) = attachment_filter.file_size_max
                && file_size_of(hit).unwrap_or(u64::MAX) > max
            {
                return false;
            }
            if let Some(author) = &attachment_filter.author {
                let doc_author = hit.metadata.get(metadata_keys::AUTHOR).and_then(|v| v.as_str());
                if doc_author != Some(author.as_str()) {
                    return false;
                }
            }
            true
        });

        let parent_ids: BTreeSet<String> = hits.iter().filter_map(parent_id_of).collect();
        let needs_parents = request.include_parent_context || attachment_filter.parent_document_title.is_some();
        let parent_contexts = if needs_parents {
            self.fetch_parent_contexts(project_id, &parent_ids).await?
        } else {
            HashMap::new()
        };

        if let Some(parent_title) = &attachment_filter.parent_document_title {
            hits.retain(|hit| {
                parent_id_of(hit)
                    .and_then(|parent_id| parent_contexts.get(&parent_id))
                    .is_some_and(|parent| &parent.title == parent_title)
            });
        }

        sort_hits(&mut hits);
        hits.truncate(limit);

        let attachment_hits = hits
            .into_iter()
            .map(|hit| {
                let parent = if request.include_parent_context {
                    parent_id_of(&hit).and_then(|parent_id| parent_contexts.get(&parent_id)).cloned()
                } else {
                    None
                };
                AttachmentHit { hit, parent }
            })
            .collect();
        Ok(attachment_hits)
    }

    async fn embed_query(&self, query: &str, cancel: &CancellationToken) -> Result<Vec<f32>, SearchError> {
        let mut vectors = self.embedding.embed(vec![query.to_string()], cancel).await?;
        vectors.pop().ok_or_else(|| SearchError::Embedding(EmbeddingError::EmptyResponse))
    }

    /// Scan every stored Confluence chunk's `hierarchy_ancestors`, collecting
    /// the union of every title that appears as someone's ancestor — the
    /// secondary filtered scan `has_children` requires (§4.11).
    async fn collect_ancestor_titles(&self, project_id: &str) -> Result<HashSet<String>, SearchError> {
        let filter_args = SearchFilterArgs {
            source_type: Some(SourceType::Confluence.as_str().to_string()),
            ..SearchFilterArgs::for_project(project_id)
        };
        let filter = build_filter(&filter_args);
        let stream = stream_payloads_with_ids(
            &self.qdrant,
            &self.collection_name,
            json!([metadata_keys::HIERARCHY_ANCESTORS]),
            filter,
        );
        futures_util::pin_mut!(stream);

        let mut titles = HashSet::new();
        while let Some(item) = stream.next().await {
            let (_, payload) = item?;
            if let Some(ancestors) = payload.get(metadata_keys::HIERARCHY_ANCESTORS).and_then(|v| v.as_array()) {
                for ancestor in ancestors {
                    if let Some(title) = ancestor.as_str() {
                        titles.insert(title.to_string());
                    }
                }
            }
        }
        Ok(titles)
    }

    /// Batch-fetch `{document_id, title, url}` for a set of parent document
    /// ids in a single scroll call, rather than one lookup per hit (§4.11:
    /// "batch these lookups").
    async fn fetch_parent_contexts(
        &self,
        project_id: &str,
        parent_ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, ParentContext>, SearchError> {
        if parent_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let should: Vec<Value> = parent_ids
            .iter()
            .map(|id| json!({ "key": "document_id", "match": { "value": id } }))
            .collect();
        let filter = json!({
            "must": [{ "key": "project_id", "match": { "value": project_id } }],
            "should": should,
            "min_should": { "conditions_count": 1 },
        });
        let stream = stream_payloads_with_ids(
            &self.qdrant,
            &self.collection_name,
            json!(["document_id", "title", "url"]),
            Some(filter),
        );
        futures_util::pin_mut!(stream);

        let mut found = HashMap::new();
        while found.len() < parent_ids.len() {
            let Some(item) = stream.next().await else { break };
            let (_, payload) = item?;
            let Some(document_id) = payload.get("document_id").and_then(|v| v.as_str()) else {
                continue;
            };
            if !parent_ids.contains(document_id) || found.contains_key(document_id) {
                continue;
            }
            let title = payload.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let url = payload.get("url").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            found.insert(
                document_id.to_string(),
                ParentContext {
                    document_id: document_id.to_string(),
                    title,
                    url,
                },
            );
        }
        Ok(found)
    }
}

fn require_non_empty_query(query: &str) -> Result<&str, SearchError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(SearchError::InvalidRequest("query must not be empty".into()));
    }
    Ok(trimmed)
}

fn project_id_or_default(project_id: &Option<String>) -> &str {
    project_id.as_deref().unwrap_or(DEFAULT_PROJECT_ID)
}

fn hit_from_point(point: crate::qdrant::ScoredPoint) -> Option<SearchHit> {
    let mut payload = point.payload?;
    let document_id = take_string(&mut payload, "document_id")?;
    let chunk_index = payload.remove("chunk_index").and_then(|v| v.as_u64())? as usize;
    let content = take_string(&mut payload, "content")?;
    let url = take_string(&mut payload, "url")?;
    let title = take_string(&mut payload, "title")?;
    let source_type = take_string(&mut payload, "source_type").and_then(|s| parse_source_type(&s))?;
    let source_name = take_string(&mut payload, "source_name")?;
    payload.remove("project_id");

    Some(SearchHit {
        score: point.score,
        document_id,
        chunk_index,
        content,
        source_type,
        source_name,
        url,
        title,
        metadata: payload.into_iter().collect(),
    })
}

fn take_string(payload: &mut Map<String, Value>, key: &str) -> Option<String> {
    payload.remove(key).and_then(|v| v.as_str().map(str::to_string))
}

fn parse_source_type(s: &str) -> Option<SourceType> {
    match s {
        "git" => Some(SourceType::Git),
        "confluence" => Some(SourceType::Confluence),
        "jira" => Some(SourceType::Jira),
        "publicdocs" => Some(SourceType::Publicdocs),
        "localfile" => Some(SourceType::Localfile),
        _ => None,
    }
}

fn ancestors_of(hit: &SearchHit) -> Vec<String> {
    hit.metadata
        .get(metadata_keys::HIERARCHY_ANCESTORS)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn parent_id_of(hit: &SearchHit) -> Option<String> {
    hit.metadata.get(metadata_keys::ATTACHMENT_OF).and_then(|v| v.as_str()).map(str::to_string)
}

fn file_size_of(hit: &SearchHit) -> Option<u64> {
    hit.metadata.get(metadata_keys::FILE_SIZE).and_then(|v| v.as_u64())
}

fn matches_file_type(hit: &SearchHit, file_type: &str) -> bool {
    let wanted = file_type.trim_start_matches('.').to_lowercase();
    if let Some(content_type) = hit.metadata.get("content_type").and_then(|v| v.as_str())
        && content_type.to_lowercase().contains(&wanted)
    {
        return true;
    }
    extension_of(&hit.title).or_else(|| extension_of(&hit.url)).is_some_and(|ext| ext == wanted)
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name).extension().and_then(|ext| ext.to_str()).map(str::to_lowercase)
}

/// Ranking tie-breaks shared by every tool: higher score first, then newer
/// `metadata.updated_at` first, then lexicographic `document_id` (§4.11).
fn sort_hits(hits: &mut [SearchHit]) {
    sort_by_score(hits, |hit| hit.score);
}

fn sort_by_score<T>(items: &mut [T], score_of: impl Fn(&T) -> f32) {
    items.sort_by(|a, b| {
        score_of(b)
            .partial_cmp(&score_of(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| updated_at_of(b).cmp(&updated_at_of(a)))
            .then_with(|| document_id_of(a).cmp(&document_id_of(b)))
    });
}

fn updated_at_of_hit(hit: &SearchHit) -> &str {
    hit.metadata.get(metadata_keys::UPDATED_AT).and_then(|v| v.as_str()).unwrap_or("")
}

fn document_id_of_hit(hit: &SearchHit) -> &str {
    &hit.document_id
}

trait RankedItem {
    fn ranked_hit(&self) -> &SearchHit;
}

impl RankedItem for SearchHit {
    fn ranked_hit(&self) -> &SearchHit {
        self
    }
}

impl RankedItem for HierarchyHit {
    fn ranked_hit(&self) -> &SearchHit {
        &self.hit
    }
}

fn updated_at_of<T: RankedItem>(item: &T) -> &str {
    updated_at_of_hit(item.ranked_hit())
}

fn document_id_of<T: RankedItem>(item: &T) -> &str {
    document_id_of_hit(item.ranked_hit())
}

/// Group hierarchy hits by root ancestor, each group sorted by
/// `(ancestors-path, score desc)` (§4.11).
fn group_by_root(hits: Vec<HierarchyHit>) -> Vec<HierarchyGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<HierarchyHit>> = HashMap::new();

    for hit in hits {
        let root = hit.ancestors.first().cloned().unwrap_or_else(|| hit.hit.title.clone());
        if !groups.contains_key(&root) {
            order.push(root.clone());
        }
        groups.entry(root).or_default().push(hit);
    }

    order
        .into_iter()
        .map(|root| {
            let mut group_hits = groups.remove(&root).unwrap_or_default();
            group_hits.sort_by(|a, b| {
                a.ancestors
                    .cmp(&b.ancestors)
                    .then_with(|| b.hit.score.partial_cmp(&a.hit.score).unwrap_or(std::cmp::Ordering::Equal))
            });
            HierarchyGroup { root, hits: group_hits }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use httpmock::MockServer;

    fn sample_hit(document_id: &str, score: f32, updated_at: &str) -> SearchHit {
        let mut metadata = BTreeMap::new();
        metadata.insert(metadata_keys::UPDATED_AT.to_string(), json!(updated_at));
        SearchHit {
            score,
            document_id: document_id.to_string(),
            chunk_index: 0,
            content: "content".into(),
            source_type: SourceType::Localfile,
            source_name: "docs".into(),
            url: format!("file:///{document_id}"),
            title: document_id.to_string(),
            metadata,
        }
    }

    #[test]
    fn sort_hits_breaks_ties_by_updated_at_then_document_id() {
        let mut hits = vec![
            sample_hit("b", 0.8, "2024-01-01T00:00:00Z"),
            sample_hit("a", 0.8, "2024-01-02T00:00:00Z"),
            sample_hit("c", 0.9, "2024-01-01T00:00:00Z"),
        ];
        sort_hits(&mut hits);
        assert_eq!(hits.iter().map(|h| h.document_id.as_str()).collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }

    #[test]
    fn matches_file_type_checks_content_type_then_extension() {
        let mut hit = sample_hit("doc-1", 1.0, "");
        hit.title = "report.PDF".into();
        assert!(matches_file_type(&hit, "pdf"));
        assert!(!matches_file_type(&hit, "docx"));

        hit.title = "report".into();
        hit.metadata.insert("content_type".into(), json!("application/pdf"));
        assert!(matches_file_type(&hit, "pdf"));
    }

    #[test]
    fn group_by_root_sorts_within_group_by_ancestors_then_score() {
        let mut deep = sample_hit("deep", 0.5, "");
        deep.title = "Deep Page".into();
        let shallow = sample_hit("shallow", 0.9, "");

        let hits = vec![
            HierarchyHit {
                hit: deep,
                ancestors: vec!["Root".into(), "Mid".into()],
            },
            HierarchyHit {
                hit: shallow,
                ancestors: vec!["Root".into()],
            },
        ];
        let groups = group_by_root(hits);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].root, "Root");
        assert_eq!(groups[0].hits[0].hit.document_id, "shallow");
        assert_eq!(groups[0].hits[1].hit.document_id, "deep");
    }

    struct FakeEmbeddingClient;

    #[async_trait]
    impl EmbeddingClient for FakeEmbeddingClient {
        async fn embed(&self, texts: Vec<String>, _cancel: &CancellationToken) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.into_iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.len()
        }

        fn vector_size(&self) -> usize {
            3
        }
    }

    fn qdrant_service(base_url: String) -> QdrantService {
        QdrantService::new(&crate::config::QdrantConfig {
            url: base_url,
            api_key: None,
            collection_name: "docs".into(),
            timeout_s: 5,
            batch_size: 64,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn search_rejects_empty_query() {
        let server = MockServer::start_async().await;
        let service = SearchService::new(
            Arc::new(qdrant_service(server.base_url())),
            Arc::new(FakeEmbeddingClient),
            "docs".into(),
        );
        let cancel = CancellationToken::new();
        let err = service
            .search(
                SearchRequest {
                    query: "   ".into(),
                    project_id: None,
                    limit: 5,
                    source_types: vec![],
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn search_embeds_once_and_returns_ranked_hits() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/collections/docs/points/query")
                    .body_contains("\"project_id\"");
                then.status(200).json_body(json!({
                    "result": [
                        {
                            "id": "11111111-1111-1111-1111-111111111111",
                            "score": 0.7,
                            "payload": {
                                "project_id": "proj-a",
                                "source_type": "localfile",
                                "source_name": "docs",
                                "document_id": "a.md",
                                "chunk_index": 0,
                                "content": "hello world",
                                "url": "file:///a.md",
                                "title": "a.md"
                            }
                        }
                    ]
                }));
            })
            .await;

        let service = SearchService::new(
            Arc::new(qdrant_service(server.base_url())),
            Arc::new(FakeEmbeddingClient),
            "docs".into(),
        );
        let cancel = CancellationToken::new();
        let hits = service
            .search(
                SearchRequest {
                    query: "hello".into(),
                    project_id: Some("proj-a".into()),
                    limit: 5,
                    source_types: vec![],
                },
                &cancel,
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "a.md");
        assert_eq!(hits[0].score, 0.7);
    }
}
