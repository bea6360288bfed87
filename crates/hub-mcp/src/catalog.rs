//! The aggregated, namespaced view of every provider's tools

use futures::future::join_all;
use hub_core::{HubError, ProviderId, ProviderState, ToolSpec};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::provider::Provider;
use crate::supervisor::ProcessSupervisor;

/// Name the host sees: `prefix_name`, or `name` alone for an empty prefix.
pub fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub qualified_name: String,
    pub provider: ProviderId,
    pub provider_name: String,
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl CatalogEntry {
    /// Spec advertised to the host, under the qualified name.
    pub fn to_tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// A qualified name two providers both produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collision {
    pub qualified_name: String,
    pub kept: String,
    pub dropped: String,
}

impl From<&Collision> for HubError {
    fn from(c: &Collision) -> Self {
        HubError::NameCollision {
            qualified: c.qualified_name.clone(),
            kept: c.kept.clone(),
            dropped: c.dropped.clone(),
        }
    }
}

/// Immutable snapshot; replaced wholesale on every rebuild.
#[derive(Debug, Default)]
pub struct Catalog {
    generation: u64,
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
    collisions: Vec<Collision>,
    failures: Vec<(String, String)>,
}

impl Catalog {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, qualified_name: &str) -> Option<&CatalogEntry> {
        self.index.get(qualified_name).map(|&i| &self.entries[i])
    }

    /// Entries in provider registration order, then each provider's order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(CatalogEntry::to_tool_spec).collect()
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    /// Providers whose listing failed during this build, with the reason.
    pub fn failures(&self) -> &[(String, String)] {
        &self.failures
    }

    /// Whether both snapshots advertise the same names.
    pub fn same_names(&self, other: &Catalog) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.qualified_name == b.qualified_name)
    }
}

/// Accumulates provider listings into a [`Catalog`]. The first provider to
/// claim a qualified name keeps it.
#[derive(Default)]
pub struct CatalogBuilder {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
    collisions: Vec<Collision>,
    failures: Vec<(String, String)>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(
        &mut self,
        id: ProviderId,
        provider_name: &str,
        prefix: &str,
        tools: Vec<ToolSpec>,
    ) -> &mut Self {
        for tool in tools {
            let qualified_name = qualify(prefix, &tool.name);
            if let Some(&existing) = self.index.get(&qualified_name) {
                let collision = Collision {
                    qualified_name,
                    kept: self.entries[existing].provider_name.clone(),
                    dropped: provider_name.to_string(),
                };
                warn!("{}", HubError::from(&collision));
                self.collisions.push(collision);
                continue;
            }

            self.index.insert(qualified_name.clone(), self.entries.len());
            self.entries.push(CatalogEntry {
                qualified_name,
                provider: id,
                provider_name: provider_name.to_string(),
                original_name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            });
        }
        self
    }

    pub fn add_failure(&mut self, provider_name: &str, error: &HubError) -> &mut Self {
        self.failures.push((provider_name.to_string(), error.to_string()));
        self
    }

    pub fn build(self, generation: u64) -> Catalog {
        Catalog {
            generation,
            entries: self.entries,
            index: self.index,
            collisions: self.collisions,
            failures: self.failures,
        }
    }
}

/// Shared handle on the current catalog.
///
/// Readers take a snapshot and never block rebuilds; rebuilds are
/// serialized and swap the snapshot in one step.
pub struct CatalogHandle {
    current: RwLock<Arc<Catalog>>,
    build_lock: Mutex<()>,
    generation: watch::Sender<u64>,
}

impl CatalogHandle {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Catalog::default())),
            build_lock: Mutex::new(()),
            generation: watch::channel(0).0,
        }
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Observe catalog replacements; the value is the new generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Rebuild from the supervisor's providers and swap it in.
    ///
    /// Ready providers are listed afresh. Providers in the middle of a
    /// restart contribute their last known tools so calls to them report the
    /// provider as unavailable; dead providers contribute nothing.
    pub async fn refresh(&self, supervisor: &ProcessSupervisor) -> Arc<Catalog> {
        let _guard = self.build_lock.lock().await;

        let providers = supervisor.providers();
        let listings = join_all(providers.iter().map(|provider| list_for_catalog(provider.as_ref()))).await;

        let mut builder = CatalogBuilder::new();
        for (provider, listing) in providers.iter().zip(listings) {
            match listing {
                Some(Ok(tools)) => {
                    builder.add_provider(provider.id(), provider.name(), provider.prefix(), tools);
                }
                Some(Err(e)) => {
                    warn!("Failed to list tools from '{}': {}", provider.name(), e);
                    builder.add_failure(provider.name(), &e);
                }
                None => {}
            }
        }

        let generation = *self.generation.borrow() + 1;
        let catalog = Arc::new(builder.build(generation));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = catalog.clone();
        self.generation.send_replace(generation);

        info!(
            generation,
            tools = catalog.len(),
            collisions = catalog.collisions().len(),
            "catalog rebuilt"
        );
        catalog
    }
}

impl Default for CatalogHandle {
    fn default() -> Self {
        Self::new()
    }
}

async fn list_for_catalog(provider: &dyn Provider) -> Option<hub_core::Result<Vec<ToolSpec>>> {
    match provider.state() {
        ProviderState::Ready => Some(provider.list_tools().await),
        ProviderState::Degraded | ProviderState::Starting => {
            let cached = provider.cached_tools();
            if cached.is_some() {
                debug!("Using last known tools for restarting provider '{}'", provider.name());
            }
            cached.map(Ok)
        }
        ProviderState::Discovered | ProviderState::Dead => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("db", "run_query"), "db_run_query");
        assert_eq!(qualify("", "status"), "status");
    }

    #[test]
    fn test_catalog_aggregates_with_prefixes() {
        let mut builder = CatalogBuilder::new();
        builder
            .add_provider(ProviderId(0), "local", "", vec![tool("status")])
            .add_provider(ProviderId(1), "db", "db", vec![tool("run_query"), tool("list_tables")])
            .add_provider(ProviderId(2), "aws", "aws", vec![tool("list_resources")]);
        let catalog = builder.build(1);

        let names: Vec<_> = catalog.entries().iter().map(|e| e.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["status", "db_run_query", "db_list_tables", "aws_list_resources"]);

        let entry = catalog.get("db_run_query").unwrap();
        assert_eq!(entry.provider, ProviderId(1));
        assert_eq!(entry.original_name, "run_query");
        assert_eq!(catalog.tool_specs()[1].name, "db_run_query");
        assert!(catalog.collisions().is_empty());
    }

    #[test]
    fn test_collision_first_registered_wins_and_is_recorded_once() {
        let mut builder = CatalogBuilder::new();
        builder
            .add_provider(ProviderId(0), "local", "", vec![tool("db_run_query")])
            .add_provider(ProviderId(1), "db", "db", vec![tool("run_query")]);
        let catalog = builder.build(3);

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("db_run_query").unwrap().provider, ProviderId(0));
        assert_eq!(catalog.collisions().len(), 1);
        let collision = &catalog.collisions()[0];
        assert_eq!(collision.kept, "local");
        assert_eq!(collision.dropped, "db");
        assert!(matches!(HubError::from(collision), HubError::NameCollision { .. }));
    }

    #[test]
    fn test_same_names() {
        let mut a = CatalogBuilder::new();
        a.add_provider(ProviderId(0), "local", "", vec![tool("x")]);
        let mut b = CatalogBuilder::new();
        b.add_provider(ProviderId(0), "local", "", vec![tool("x")]);
        assert!(a.build(1).same_names(&b.build(2)));
        assert!(!Catalog::default().same_names(&{
            let mut c = CatalogBuilder::new();
            c.add_provider(ProviderId(0), "local", "", vec![tool("y")]);
            c.build(1)
        }));
    }

    #[tokio::test]
    async fn test_refresh_includes_ready_local_provider() {
        let registry = Arc::new(hub_tools::ToolRegistry::new());
        registry
            .register(hub_tools::FnTool::new("status", "Status", json!({}), |_| async {
                Ok(json!("ok"))
            }))
            .unwrap();
        let mut supervisor = ProcessSupervisor::new();
        supervisor.add_local("", registry, std::time::Duration::from_secs(1));

        let handle = CatalogHandle::new();
        assert!(handle.snapshot().is_empty());
        let mut generations = handle.subscribe();

        // Not started yet: nothing is listed
        let catalog = handle.refresh(&supervisor).await;
        assert!(catalog.is_empty());

        supervisor.start_all().await;
        let catalog = handle.refresh(&supervisor).await;
        assert_eq!(catalog.generation(), 2);
        assert!(catalog.get("status").is_some());
        assert_eq!(handle.snapshot().generation(), 2);

        generations.changed().await.unwrap();
        assert_eq!(*generations.borrow(), 2);
    }
}
