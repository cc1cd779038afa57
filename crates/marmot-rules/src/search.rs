//! The Search component query rules call out to (spec.md §4.H, §6). No
//! concrete search engine lives in this workspace, so this is the seam a
//! deployment plugs a real one into — mirrors the teacher's own pattern
//! of defining a narrow trait at the boundary of a component it doesn't
//! own (e.g. its plugin-host traits) rather than reaching into another
//! service's internals.

use async_trait::async_trait;
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("query execution failed: {0}")]
    QueryFailed(String),
    /// The backend cannot scope a query to a single asset; the caller
    /// should fall back to full reconciliation instead (spec.md §4.H
    /// step 3, "mark for reconciliation").
    #[error("backend cannot scope queries to a single asset")]
    SingleAssetScopingUnsupported,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Runs `query_expression` against the whole corpus and returns
    /// matching asset MRNs.
    async fn search(&self, query_expression: &str) -> Result<BTreeSet<String>, SearchError>;

    /// Runs `query_expression` scoped to a single asset, for incremental
    /// evaluation. Returns `Err(SingleAssetScopingUnsupported)` if the
    /// backend has no such capability.
    async fn matches_single(&self, query_expression: &str, asset_mrn: &str) -> Result<bool, SearchError> {
        let _ = (query_expression, asset_mrn);
        Err(SearchError::SingleAssetScopingUnsupported)
    }
}

/// Test/demo backend: holds a fixed corpus and treats `query_expression`
/// as a literal substring match against each asset's indexed text.
pub struct InMemorySearchBackend {
    corpus: std::collections::BTreeMap<String, String>,
}

impl InMemorySearchBackend {
    pub fn new() -> Self {
        Self { corpus: Default::default() }
    }

    pub fn index(&mut self, asset_mrn: &str, text: &str) {
        self.corpus.insert(asset_mrn.to_string(), text.to_string());
    }
}

impl Default for InMemorySearchBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchBackend for InMemorySearchBackend {
    async fn search(&self, query_expression: &str) -> Result<BTreeSet<String>, SearchError> {
        Ok(self
            .corpus
            .iter()
            .filter(|(_, text)| text.contains(query_expression))
            .map(|(mrn, _)| mrn.clone())
            .collect())
    }

    async fn matches_single(&self, query_expression: &str, asset_mrn: &str) -> Result<bool, SearchError> {
        Ok(self.corpus.get(asset_mrn).is_some_and(|text| text.contains(query_expression)))
    }
}
