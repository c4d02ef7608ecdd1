//! QDrant vector store integration: collection lifecycle, upsert, filtered
//! search, and delete-by-document (§4.9).

mod client;
mod filters;
mod payload;
mod scroller;
mod types;

pub use client::QdrantService;
pub use filters::{build_document_filter, build_filter};
pub use payload::{build_payload, point_id};
pub use scroller::stream_payloads_with_ids;
pub use types::{QdrantError, ScoredPoint, SearchFilterArgs, UpsertSummary};
