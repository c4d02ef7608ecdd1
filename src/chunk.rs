//! Token-budgeted chunking: structured mode (Markdown/code) and fallback
//! mode (plain sliding window) (§4.6).
//!
//! The token-counting and sliding-window machinery generalizes a
//! `processing::chunking`-style module (`build_token_counter`,
//! `chunk_text_with_counter`, `apply_overlap`): same tiktoken-first/
//! whitespace-fallback counter, same trim-to-budget sliding-window overlap.
//! Structured mode (heading/code-fence awareness and `section_path`
//! breadcrumbs) is new, grounded on the same `Chunker`-composition style.

use std::sync::Arc;

use semchunk_rs::Chunker;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base};

use crate::model::Chunk;

/// Errors raised while chunking a document's content.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// `chunk_size` was zero.
    #[error("chunk_size must be greater than zero")]
    InvalidChunkSize,
}

impl From<ChunkingError> for crate::error::ErrorKind {
    fn from(e: ChunkingError) -> Self {
        crate::error::ErrorKind::Conversion(e.to_string())
    }
}

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Token-budget parameters for one chunking call (§6 `global.chunking`).
#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    /// Target chunk size, in tokens.
    pub chunk_size: usize,
    /// Token overlap between consecutive chunks.
    pub chunk_overlap: usize,
    /// Hard byte ceiling per chunk, independent of token count.
    pub max_chunk_bytes: usize,
    /// Tokenizer model name, used to pick a tiktoken encoding; any value
    /// tiktoken doesn't recognize falls back to `ceil(len/4)` (§4.4, §9).
    pub tokenizer_model: String,
}

/// Split `content` into chunks for `document_id`, choosing structured mode
/// for Markdown-like content (headings or fenced code present) and fallback
/// mode otherwise.
///
/// Deterministic: identical `(content, options)` always yields
/// byte-identical chunks (§8 property 3).
pub fn chunk_document(
    document_id: &str,
    content: &str,
    content_type: &str,
    options: &ChunkingOptions,
) -> Result<Vec<Chunk>, ChunkingError> {
    if options.chunk_size == 0 {
        return Err(ChunkingError::InvalidChunkSize);
    }
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let counter = build_token_counter(&options.tokenizer_model);

    let raw_sections = if is_structured(content_type, content) {
        split_structured(content)
    } else {
        vec![(Vec::new(), content.to_string())]
    };

    let mut chunks = Vec::new();
    for (section_path, section_text) in raw_sections {
        let pieces = chunk_text_with_counter(
            &section_text,
            options.chunk_size,
            options.chunk_overlap,
            counter.clone(),
        );
        for piece in pieces {
            let piece = clamp_to_byte_budget(piece, options.max_chunk_bytes);
            let token_count = counter(&piece);
            let index = chunks.len();
            chunks.push(Chunk {
                id: format!("{document_id}#{index}"),
                document_id: document_id.to_string(),
                chunk_index: index,
                content: piece,
                token_count,
                metadata: Default::default(),
                chunk_total: 0,
                section_path: if section_path.is_empty() {
                    None
                } else {
                    Some(section_path.clone())
                },
            });
        }
    }

    let total = chunks.len();
    for chunk in &mut chunks {
        chunk.chunk_total = total;
    }
    Ok(chunks)
}

fn is_structured(content_type: &str, content: &str) -> bool {
    content_type.contains("markdown")
        || content_type.contains("html")
        || content.lines().any(|l| l.trim_start().starts_with('#'))
        || content.contains("```")
}

/// Split Markdown-ish content on heading lines and fenced code blocks,
/// emitting `(section_path, text)` pairs. A fence is never split across
/// sections: its contents are kept with whatever heading precedes it.
fn split_structured(content: &str) -> Vec<(Vec<String>, String)> {
    let mut sections: Vec<(Vec<String>, String)> = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            current.push_str(line);
            current.push('\n');
            continue;
        }
        if !in_fence && trimmed.starts_with('#') {
            if !current.trim().is_empty() {
                sections.push((path.clone(), std::mem::take(&mut current)));
            }
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            let title = trimmed.trim_start_matches('#').trim().to_string();
            path.truncate(level.saturating_sub(1));
            path.push(title);
            current.push_str(line);
            current.push('\n');
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push((path, current));
    }
    if sections.is_empty() {
        sections.push((Vec::new(), content.to_string()));
    }
    sections
}

fn clamp_to_byte_budget(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Build a token counter from a tokenizer model name: tiktoken when the
/// model resolves to a known encoding, otherwise `ceil(len/4)` (§4.4, §9).
pub fn build_token_counter(model: &str) -> TokenCounter {
    match resolve_encoding(model) {
        Some(encoding) => {
            let encoding = Arc::new(encoding);
            Arc::new(move |segment: &str| encoding.encode_ordinary(segment).len())
        }
        None => {
            tracing::warn!(model, "tokenizer unavailable; falling back to ceil(len/4) counter");
            Arc::new(|segment: &str| segment.len().div_ceil(4))
        }
    }
}

fn resolve_encoding(model: &str) -> Option<CoreBPE> {
    if let Ok(encoding) = get_bpe_from_model(model) {
        return Some(encoding);
    }
    match model {
        "cl100k_base" => cl100k_base().ok(),
        "o200k_base" => o200k_base().ok(),
        "p50k_base" => p50k_base().ok(),
        "p50k_edit" => p50k_edit().ok(),
        "r50k_base" | "gpt2" => r50k_base().ok(),
        _ => None,
    }
}

fn chunk_text_with_counter(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    token_counter: TokenCounter,
) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let counter_for_chunker = token_counter.clone();
    let chunker = Chunker::new(
        chunk_size,
        Box::new(move |segment: &str| counter_for_chunker.as_ref()(segment)),
    );
    let base_chunks = chunker.chunk(text);
    apply_overlap(base_chunks, chunk_size, overlap, &token_counter)
}

fn apply_overlap(
    chunks: Vec<String>,
    chunk_size: usize,
    overlap: usize,
    token_counter: &TokenCounter,
) -> Vec<String> {
    if chunks.is_empty() {
        return chunks;
    }
    let effective_overlap = overlap.min(chunk_size.saturating_sub(1));
    if effective_overlap == 0 {
        return chunks;
    }

    let mut overlapped = Vec::with_capacity(chunks.len());
    let mut iter = chunks.into_iter();
    let mut previous = iter.next().expect("non-empty chunk list");
    overlapped.push(previous.clone());

    for current in iter {
        let tail = tail_with_token_limit(&previous, effective_overlap, token_counter);
        let mut combined = String::with_capacity(tail.len() + current.len() + 1);
        if !tail.is_empty() {
            combined.push_str(tail);
            if !tail.ends_with(char::is_whitespace) && !current.starts_with(char::is_whitespace) {
                combined.push(' ');
            }
        }
        combined.push_str(&current);
        overlapped.push(trim_to_token_budget(&combined, chunk_size, token_counter));
        previous = current;
    }
    overlapped
}

fn tail_with_token_limit<'a>(text: &'a str, token_limit: usize, counter: &TokenCounter) -> &'a str {
    if token_limit == 0 {
        return "";
    }
    let trimmed = text.trim_start();
    if counter(trimmed) <= token_limit {
        return trimmed;
    }
    let len = text.len();
    let mut start = 0;
    while start < len {
        start = text[start..]
            .char_indices()
            .nth(1)
            .map(|(offset, _)| start + offset)
            .unwrap_or(len);
        let candidate = text[start..].trim_start();
        if counter(candidate) <= token_limit {
            return candidate;
        }
    }
    ""
}

fn trim_to_token_budget(text: &str, budget: usize, counter: &TokenCounter) -> String {
    if budget == 0 {
        return String::new();
    }
    if counter(text) <= budget {
        return text.to_string();
    }
    let len = text.len();
    let mut start = 0;
    while start < len {
        start = text[start..]
            .char_indices()
            .nth(1)
            .map(|(offset, _)| start + offset)
            .unwrap_or(len);
        let candidate = text[start..].trim_start();
        if counter(candidate) <= budget {
            return candidate.to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(chunk_size: usize, overlap: usize) -> ChunkingOptions {
        ChunkingOptions {
            chunk_size,
            chunk_overlap: overlap,
            max_chunk_bytes: 8000,
            tokenizer_model: "unknown-local-model".into(),
        }
    }

    #[test]
    fn empty_input_yields_zero_chunks() {
        let chunks = chunk_document("doc-1", "   ", "text/plain", &options(10, 0)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let error = chunk_document("doc-1", "hello", "text/plain", &options(0, 0)).unwrap_err();
        assert!(matches!(error, ChunkingError::InvalidChunkSize));
    }

    #[test]
    fn chunk_index_and_document_id_are_set() {
        let text = "one two three four five six seven eight";
        let chunks = chunk_document("doc-1", text, "text/plain", &options(2, 0)).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.document_id, "doc-1");
            assert_eq!(chunk.chunk_total, chunks.len());
        }
    }

    #[test]
    fn is_deterministic_across_runs() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let a = chunk_document("doc-1", text, "text/plain", &options(3, 1)).unwrap();
        let b = chunk_document("doc-1", text, "text/plain", &options(3, 1)).unwrap();
        let a_content: Vec<_> = a.iter().map(|c| c.content.clone()).collect();
        let b_content: Vec<_> = b.iter().map(|c| c.content.clone()).collect();
        assert_eq!(a_content, b_content);
    }

    #[test]
    fn structured_mode_tracks_section_path() {
        let text = "# Title\nintro text\n## Sub\nbody text here that is long enough";
        let chunks = chunk_document("doc-1", text, "text/markdown", &options(50, 0)).unwrap();
        assert!(chunks.iter().any(|c| c.section_path.as_deref() == Some(&["Title".to_string()][..])));
        assert!(
            chunks
                .iter()
                .any(|c| c.section_path.as_deref() == Some(&["Title".to_string(), "Sub".to_string()][..]))
        );
    }

    #[test]
    fn fenced_code_block_is_never_split() {
        let text = "# Title\n```\nline one\nline two\nline three\n```\nmore text";
        let chunks = chunk_document("doc-1", text, "text/markdown", &options(3, 0)).unwrap();
        let has_whole_fence = chunks.iter().any(|c| c.content.contains("```\nline one"));
        assert!(has_whole_fence);
    }

    #[test]
    fn respects_max_chunk_bytes() {
        let text = "word ".repeat(2000);
        let mut opts = options(10_000, 0);
        opts.max_chunk_bytes = 50;
        let chunks = chunk_document("doc-1", &text, "text/plain", &opts).unwrap();
        for chunk in chunks {
            assert!(chunk.content.len() <= 50);
        }
    }
}
