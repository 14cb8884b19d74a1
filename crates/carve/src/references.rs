//! Named, lazily resolved values shared across every extraction.
//!
//! Each name moves Unresolved → Resolving → Resolved(value | error) exactly
//! once. Concurrent callers for a name that is still resolving wait on the
//! same computation. The outcome, failures included, is kept for the life of
//! the registry: no TTL, no invalidation. Only values that stay valid for
//! the whole run (an auth token, a session id) belong here.
//!
//! Re-entering a name from inside its own resolution fails fast with a cycle
//! error. The chain is tracked per task, so two tasks that each start a
//! different member of the same cycle at the same moment can still wait on
//! each other.

use crate::config::ReferenceDefinition;
use crate::node::JsonNode;
use crate::types::{CarveError, CarveResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

/// Computes the value of a reference. Supplied by the wiring layer so the
/// registry does not depend on fetchers or the extraction engine.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve(&self, definition: &ReferenceDefinition) -> CarveResult<JsonNode>;
}

struct Entry {
    definition: ReferenceDefinition,
    state: OnceCell<CarveResult<JsonNode>>,
}

tokio::task_local! {
    static RESOLUTION_CHAIN: Vec<String>;
}

/// Name → definition table with single-flight, memoized resolution.
#[derive(Default)]
pub struct ReferenceRegistry {
    entries: DashMap<String, Arc<Entry>>,
    resolver: OnceLock<Arc<dyn ReferenceResolver>>,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the definitions and the resolver. Allowed once.
    pub fn register(
        &self,
        definitions: impl IntoIterator<Item = ReferenceDefinition>,
        resolver: Arc<dyn ReferenceResolver>,
    ) -> CarveResult<()> {
        self.resolver.set(resolver).map_err(|_| {
            CarveError::Configuration("references are already registered".to_string())
        })?;
        for definition in definitions {
            tracing::debug!(reference = %definition.name, "registered reference");
            self.entries.insert(
                definition.name.clone(),
                Arc::new(Entry {
                    definition,
                    state: OnceCell::new(),
                }),
            );
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Whether `name` already has a memoized outcome.
    pub fn is_resolved(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| e.state.initialized())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `name`, running the resolver only for the first caller.
    pub async fn resolve(&self, name: &str) -> CarveResult<JsonNode> {
        let entry = self
            .entries
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CarveError::resolution(name, "unknown reference"))?;

        if let Some(outcome) = entry.state.get() {
            return outcome.clone();
        }

        let chain = RESOLUTION_CHAIN
            .try_with(|chain| chain.clone())
            .unwrap_or_default();
        if chain.iter().any(|n| n == name) {
            let path = chain.join(" -> ");
            return Err(CarveError::resolution(
                name,
                format!("cycle detected: {path} -> {name}"),
            ));
        }

        let resolver = self
            .resolver
            .get()
            .cloned()
            .ok_or_else(|| CarveError::resolution(name, "no resolver installed"))?;

        let mut next = chain;
        next.push(name.to_string());

        entry
            .state
            .get_or_init(|| async {
                tracing::debug!(reference = name, "resolving reference");
                let outcome = RESOLUTION_CHAIN
                    .scope(next, resolver.resolve(&entry.definition))
                    .await;
                match outcome {
                    Ok(node) => Ok(node),
                    Err(e) => {
                        tracing::warn!(reference = name, error = %e, "reference failed, memoizing failure");
                        Err(CarveError::resolution(name, e.to_string()))
                    }
                }
            })
            .await
            .clone()
    }
}
