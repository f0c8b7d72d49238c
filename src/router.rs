//! C1 — Index Router: resolves document names to physical index
//! identifiers. Backed by an in-memory, read-mostly `DocumentIndexMap`
//! guarded by `parking_lot::RwLock`, replaced wholesale on ingestion events
//! the way the teacher's `space.rs` swaps its in-memory registries.

use crate::types::DocumentIndexEntry;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;

pub struct IndexRouter {
    map: RwLock<HashMap<String, DocumentIndexEntry>>,
}

impl Default for IndexRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRouter {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or overwrite) the physical text index for `document_name`.
    /// Called by the ingestion pipeline through the interface the core
    /// exposes; never called from within a query path.
    pub fn register(&self, document_name: &str, index_id: &str) {
        self.map
            .write()
            .entry(document_name.to_string())
            .or_default()
            .text_index = index_id.to_string();
    }

    pub fn register_image_index(&self, document_name: &str, index_id: &str) {
        self.map
            .write()
            .entry(document_name.to_string())
            .or_default()
            .image_index = Some(index_id.to_string());
    }

    pub fn unregister(&self, document_name: &str) {
        self.map.write().remove(document_name);
    }

    /// Replace the whole map atomically, e.g. after reloading the
    /// externally persisted DocumentIndexMap at startup.
    pub fn replace_all(&self, entries: HashMap<String, DocumentIndexEntry>) {
        *self.map.write() = entries;
    }

    /// Resolve active document names to text index identifiers. An empty
    /// `active_sources` resolves to every known text index. Unknown names
    /// are logged and dropped rather than treated as an error.
    pub fn resolve(&self, active_sources: &[String]) -> Vec<String> {
        let map = self.map.read();
        if active_sources.is_empty() {
            return map.values().map(|e| e.text_index.clone()).collect();
        }
        active_sources
            .iter()
            .filter_map(|name| match map.get(name) {
                Some(entry) => Some(entry.text_index.clone()),
                None => {
                    warn!(document = %name, "index router: unknown document, dropping from selection");
                    None
                }
            })
            .collect()
    }

    /// Resolve active document names to image-OCR index identifiers,
    /// analogous to [`resolve`] but over the (optional) image index per
    /// document.
    pub fn resolve_images(&self, active_sources: &[String]) -> Vec<String> {
        let map = self.map.read();
        let candidates: Box<dyn Iterator<Item = &DocumentIndexEntry>> = if active_sources.is_empty()
        {
            Box::new(map.values())
        } else {
            Box::new(active_sources.iter().filter_map(|name| {
                let entry = map.get(name);
                if entry.is_none() {
                    warn!(document = %name, "index router: unknown document, dropping from image selection");
                }
                entry
            }))
        };
        candidates.filter_map(|e| e.image_index.clone()).collect()
    }

    /// Every registered document display name, for the planner's
    /// document-scope detection.
    pub fn document_names(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

/// Lowercase; replace any character outside `[a-z0-9_-]` with `-`; collapse
/// consecutive `-`; strip leading/trailing `-`/`_`; ensure the first char is
/// a letter or `_` (prefix `doc-` otherwise); truncate to 255 chars; empty
/// input maps to `"document"`.
pub fn sanitize_index_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut replaced = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            replaced.push(c);
        } else {
            replaced.push('-');
        }
    }

    let mut collapsed = String::with_capacity(replaced.len());
    let mut prev_dash = false;
    for c in replaced.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push('-');
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }

    let trimmed = collapsed.trim_matches(|c| c == '-' || c == '_').to_string();

    let mut result = if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed
    };

    match result.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => result = format!("doc-{result}"),
    }

    result.truncate(255);
    if result.is_empty() {
        "document".to_string()
    } else {
        result
    }
}

/// Find the first index name among `candidate` and `candidate-1`,
/// `candidate-2`, ... that `exists` reports as free, capped at 1000 suffix
/// attempts per the collision policy.
pub fn find_next_available_index_name(
    candidate: &str,
    mut exists: impl FnMut(&str) -> bool,
) -> Option<String> {
    if !exists(candidate) {
        return Some(candidate.to_string());
    }
    for suffix in 1..=1000 {
        let attempt = format!("{candidate}-{suffix}");
        if !exists(&attempt) {
            return Some(attempt);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces_invalid_chars() {
        assert_eq!(sanitize_index_name("My Doc!!.pdf"), "my-doc-pdf");
    }

    #[test]
    fn sanitize_collapses_consecutive_dashes() {
        assert_eq!(sanitize_index_name("a---b"), "a-b");
    }

    #[test]
    fn sanitize_strips_leading_trailing_separators() {
        assert_eq!(sanitize_index_name("--hello--"), "hello");
    }

    #[test]
    fn sanitize_prefixes_when_first_char_is_digit() {
        assert_eq!(sanitize_index_name("123report"), "doc-123report");
    }

    #[test]
    fn sanitize_empty_input_maps_to_document() {
        assert_eq!(sanitize_index_name(""), "document");
        assert_eq!(sanitize_index_name("!!!"), "document");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_index_name("Weird Name $$ 2024.pdf");
        let twice = sanitize_index_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn find_next_available_index_name_appends_suffix_on_collision() {
        let taken = ["report", "report-1"];
        let name = find_next_available_index_name("report", |n| taken.contains(&n)).unwrap();
        assert_eq!(name, "report-2");
    }

    #[test]
    fn find_next_available_index_name_returns_candidate_when_free() {
        let name = find_next_available_index_name("report", |_| false).unwrap();
        assert_eq!(name, "report");
    }

    #[test]
    fn resolve_empty_active_sources_returns_all_known_indexes() {
        let router = IndexRouter::new();
        router.register("a.pdf", "idx-a");
        router.register("b.pdf", "idx-b");
        let mut resolved = router.resolve(&[]);
        resolved.sort();
        assert_eq!(resolved, vec!["idx-a".to_string(), "idx-b".to_string()]);
    }

    #[test]
    fn resolve_drops_unknown_documents() {
        let router = IndexRouter::new();
        router.register("a.pdf", "idx-a");
        let resolved = router.resolve(&["a.pdf".to_string(), "missing.pdf".to_string()]);
        assert_eq!(resolved, vec!["idx-a".to_string()]);
    }

    #[test]
    fn resolve_images_only_returns_documents_with_an_image_index() {
        let router = IndexRouter::new();
        router.register("a.pdf", "idx-a");
        router.register_image_index("a.pdf", "idx-a-img");
        router.register("b.pdf", "idx-b");
        let resolved = router.resolve_images(&[]);
        assert_eq!(resolved, vec!["idx-a-img".to_string()]);
    }
}
