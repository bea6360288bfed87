use hub_core::{HubError, ProviderKind, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::CatalogHandle;
use crate::provider::CallContext;
use crate::supervisor::ProcessSupervisor;
use crate::types::RequestId;

/// Outcome of a routed call, tagged with the kind of provider that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub kind: ProviderKind,
    pub value: Value,
}

/// Resolves qualified names against the current catalog and dispatches to
/// the owning provider.
pub struct RequestRouter {
    supervisor: Arc<ProcessSupervisor>,
    catalog: Arc<CatalogHandle>,
}

impl RequestRouter {
    pub fn new(supervisor: Arc<ProcessSupervisor>, catalog: Arc<CatalogHandle>) -> Self {
        Self { supervisor, catalog }
    }

    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: Value,
        host_request: Option<RequestId>,
        cancel: CancellationToken,
    ) -> Result<Routed> {
        let snapshot = self.catalog.snapshot();
        let entry = snapshot
            .get(qualified_name)
            .ok_or_else(|| HubError::UnknownTool(qualified_name.to_string()))?;
        let provider = self
            .supervisor
            .get(entry.provider)
            .ok_or_else(|| HubError::UnknownTool(qualified_name.to_string()))?;

        let ctx = CallContext {
            qualified_name: qualified_name.to_string(),
            host_request,
            cancel,
            timeout: None,
        };

        debug!(
            tool = %qualified_name,
            provider = %entry.provider_name,
            original = %entry.original_name,
            "routing call"
        );
        let started = Instant::now();
        let outcome = provider.call(&entry.original_name, arguments, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                info!(tool = %qualified_name, elapsed_ms, "call completed");
                Ok(Routed { kind: provider.kind(), value })
            }
            Err(e) => {
                warn!(tool = %qualified_name, elapsed_ms, "call failed: {}", e);
                Err(e)
            }
        }
    }
}
