//! Tools the gateway itself serves through the local provider

use async_trait::async_trait;
use hub_core::{HubError, Result};
use hub_tools::{object_schema, Tool};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use crate::catalog::CatalogHandle;
use crate::supervisor::ProcessSupervisor;

fn supervisor_gone(tool: &str) -> HubError {
    HubError::tool_error(tool, "gateway is shutting down")
}

/// Reports the state of every provider.
pub struct ProvidersTool {
    supervisor: Weak<ProcessSupervisor>,
}

impl ProvidersTool {
    pub const NAME: &'static str = "hub_providers";

    pub fn new(supervisor: &Arc<ProcessSupervisor>) -> Self {
        Self { supervisor: Arc::downgrade(supervisor) }
    }
}

#[async_trait]
impl Tool for ProvidersTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "List the tool providers behind this gateway with their state and restart count"
    }

    fn schema(&self) -> Value {
        object_schema(json!({}), &[])
    }

    async fn execute(&self, _args: Value) -> Result<Value> {
        let supervisor = self.supervisor.upgrade().ok_or_else(|| supervisor_gone(Self::NAME))?;
        let statuses = supervisor.statuses();
        Ok(json!({
            "count": statuses.len(),
            "providers": statuses,
        }))
    }
}

/// Re-lists every ready provider and swaps in a new catalog.
pub struct RefreshCatalogTool {
    supervisor: Weak<ProcessSupervisor>,
    catalog: Arc<CatalogHandle>,
}

impl RefreshCatalogTool {
    pub const NAME: &'static str = "hub_refresh_catalog";

    pub fn new(supervisor: &Arc<ProcessSupervisor>, catalog: Arc<CatalogHandle>) -> Self {
        Self {
            supervisor: Arc::downgrade(supervisor),
            catalog,
        }
    }
}

#[async_trait]
impl Tool for RefreshCatalogTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Rebuild the aggregated tool catalog from all ready providers"
    }

    fn schema(&self) -> Value {
        object_schema(json!({}), &[])
    }

    async fn execute(&self, _args: Value) -> Result<Value> {
        let supervisor = self.supervisor.upgrade().ok_or_else(|| supervisor_gone(Self::NAME))?;
        let catalog = self.catalog.refresh(&supervisor).await;
        Ok(json!({
            "generation": catalog.generation(),
            "tools": catalog.len(),
            "collisions": catalog.collisions(),
            "failures": catalog
                .failures()
                .iter()
                .map(|(provider, error)| json!({ "provider": provider, "error": error }))
                .collect::<Vec<_>>(),
        }))
    }
}
