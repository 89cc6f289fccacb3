//! In-memory knowledge sources for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::pipeline::matching::token_overlap;
use crate::traits::knowledge::{AuthoritativeDocument, AuthoritativeSource, KnowledgeSource, SearchQuery};
use crate::types::evidence::{Excerpt, Locator, SourceKind};
use crate::types::ids::TenantId;

/// Keyword-ranked excerpt search over passages held in memory.
///
/// Passages added with [`add_shared`](Self::add_shared) are visible to every
/// tenant (legislation, case law); passages added with
/// [`add_for_tenant`](Self::add_for_tenant) only to that tenant.
pub struct MemoryKnowledgeSource {
    name: String,
    kind: SourceKind,
    shared: RwLock<Vec<Excerpt>>,
    tenants: RwLock<HashMap<TenantId, Vec<Excerpt>>>,
}

impl MemoryKnowledgeSource {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            shared: RwLock::new(Vec::new()),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Add a passage visible to all tenants.
    pub fn add_shared(&self, locator: Locator, text: impl Into<String>) {
        self.shared
            .write()
            .unwrap()
            .push(Excerpt::new(locator, text));
    }

    /// Add a passage visible to one tenant only.
    pub fn add_for_tenant(&self, tenant_id: TenantId, locator: Locator, text: impl Into<String>) {
        self.tenants
            .write()
            .unwrap()
            .entry(tenant_id)
            .or_default()
            .push(Excerpt::new(locator, text));
    }

    /// Number of passages visible to a tenant.
    pub fn passage_count(&self, tenant_id: TenantId) -> usize {
        let tenant = self
            .tenants
            .read()
            .unwrap()
            .get(&tenant_id)
            .map_or(0, Vec::len);
        tenant + self.shared.read().unwrap().len()
    }
}

#[async_trait]
impl KnowledgeSource for MemoryKnowledgeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Excerpt>> {
        let mut candidates = self.shared.read().unwrap().clone();
        if let Some(own) = self.tenants.read().unwrap().get(&query.tenant_id) {
            candidates.extend(own.iter().cloned());
        }

        let mut ranked: Vec<Excerpt> = candidates
            .into_iter()
            .filter_map(|excerpt| {
                let score = token_overlap(&query.text, &excerpt.text) as f32;
                (score > 0.0).then(|| excerpt.with_score(score))
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(query.limit);

        tracing::debug!(source = %self.name, hits = ranked.len(), "memory search");
        Ok(ranked)
    }
}

/// Authoritative documents keyed by locator.
///
/// Lookups ignore identifier and section case, matching how citations are
/// fingerprinted.
#[derive(Default)]
pub struct MemoryAuthority {
    documents: RwLock<HashMap<Locator, AuthoritativeDocument>>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: AuthoritativeDocument) {
        let key = Self::key(&document.locator);
        self.documents.write().unwrap().insert(key, document);
    }

    pub fn with_document(self, document: AuthoritativeDocument) -> Self {
        self.insert(document);
        self
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    fn key(locator: &Locator) -> Locator {
        Locator {
            source: locator.source,
            identifier: locator.identifier.trim().to_lowercase(),
            section: locator.section.as_ref().map(|s| s.trim().to_lowercase()),
        }
    }
}

#[async_trait]
impl AuthoritativeSource for MemoryAuthority {
    async fn lookup(&self, locator: &Locator) -> Result<Option<AuthoritativeDocument>> {
        Ok(self
            .documents
            .read()
            .unwrap()
            .get(&Self::key(locator))
            .cloned())
    }
}
