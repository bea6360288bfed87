use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hub_core::{HubError, ProviderId, ProviderKind, ProviderState, Result, ToolSpec};
use hub_tools::{args_object, ToolRegistry};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::RequestId;

/// Point-in-time view of one provider, as reported by `hub_providers` and
/// the `providers` command.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: ProviderId,
    pub name: String,
    pub kind: ProviderKind,
    pub prefix: String,
    pub state: ProviderState,
    pub since: DateTime<Utc>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Notifications published by providers to whoever maintains the catalog.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    StateChanged {
        id: ProviderId,
        name: String,
        from: ProviderState,
        to: ProviderState,
    },
    /// The provider announced that its tool list changed
    ToolsChanged { id: ProviderId, name: String },
}

/// Per-call context threaded from the host request down to the provider.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Name the host used, for errors and logs
    pub qualified_name: String,
    pub host_request: Option<RequestId>,
    pub cancel: CancellationToken,
    /// Overrides the provider's default call timeout
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            ..Default::default()
        }
    }
}

/// A source of tools the gateway aggregates.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderId;
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn prefix(&self) -> &str;
    fn status(&self) -> ProviderStatus;

    fn state(&self) -> ProviderState {
        self.status().state
    }

    /// Tools from the last successful listing, kept while the provider is
    /// restarting so calls fail as unavailable rather than unknown.
    fn cached_tools(&self) -> Option<Vec<ToolSpec>>;

    async fn start(&self) -> Result<()>;
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;
    async fn call(&self, tool: &str, args: Value, ctx: CallContext) -> Result<Value>;
    async fn stop(&self) -> Result<()>;
}

/// Lifecycle bookkeeping shared by both provider kinds.
pub(crate) struct StateCell {
    id: ProviderId,
    name: String,
    inner: Mutex<StateInner>,
    events: broadcast::Sender<ProviderEvent>,
}

struct StateInner {
    state: ProviderState,
    since: DateTime<Utc>,
    restarts: u32,
    last_error: Option<String>,
}

impl StateCell {
    pub(crate) fn new(id: ProviderId, name: &str, events: broadcast::Sender<ProviderEvent>) -> Self {
        Self {
            id,
            name: name.to_string(),
            inner: Mutex::new(StateInner {
                state: ProviderState::Discovered,
                since: Utc::now(),
                restarts: 0,
                last_error: None,
            }),
            events,
        }
    }

    pub(crate) fn id(&self) -> ProviderId {
        self.id
    }

    pub(crate) fn get(&self) -> ProviderState {
        self.lock().state
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// transition happened.
    pub(crate) fn transition(&self, next: ProviderState, error: Option<String>) -> bool {
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            if !from.can_transition_to(next) {
                debug!(provider = %self.name, "ignoring transition {} -> {}", from, next);
                return false;
            }
            inner.state = next;
            inner.since = Utc::now();
            if error.is_some() {
                inner.last_error = error;
            }
            from
        };

        if next.is_terminal() || next == ProviderState::Degraded {
            warn!(provider = %self.name, "state {} -> {}", from, next);
        } else {
            info!(provider = %self.name, "state {} -> {}", from, next);
        }
        let _ = self.events.send(ProviderEvent::StateChanged {
            id: self.id,
            name: self.name.clone(),
            from,
            to: next,
        });
        true
    }

    pub(crate) fn record_restart(&self) -> u32 {
        let mut inner = self.lock();
        inner.restarts += 1;
        inner.restarts
    }

    pub(crate) fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn status(&self, kind: ProviderKind, prefix: &str, command: Option<String>) -> ProviderStatus {
        let inner = self.lock();
        ProviderStatus {
            id: self.id,
            name: self.name.clone(),
            kind,
            prefix: prefix.to_string(),
            state: inner.state,
            since: inner.since,
            restarts: inner.restarts,
            last_error: inner.last_error.clone(),
            command,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handlers running inside the gateway process.
pub struct LocalProvider {
    prefix: String,
    registry: Arc<ToolRegistry>,
    call_timeout: Duration,
    state: StateCell,
}

impl LocalProvider {
    pub fn new(
        id: ProviderId,
        prefix: impl Into<String>,
        registry: Arc<ToolRegistry>,
        call_timeout: Duration,
        events: broadcast::Sender<ProviderEvent>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            registry,
            call_timeout,
            state: StateCell::new(id, "local", events),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn id(&self) -> ProviderId {
        self.state.id
    }

    fn name(&self) -> &str {
        &self.state.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn status(&self) -> ProviderStatus {
        self.state.status(ProviderKind::Local, &self.prefix, None)
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    fn cached_tools(&self) -> Option<Vec<ToolSpec>> {
        None
    }

    async fn start(&self) -> Result<()> {
        self.state.transition(ProviderState::Starting, None);
        self.state.transition(ProviderState::Ready, None);
        info!("Local provider ready with {} tools", self.registry.len());
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(self.registry.specs())
    }

    async fn call(&self, tool: &str, args: Value, ctx: CallContext) -> Result<Value> {
        let state = self.state.get();
        if state != ProviderState::Ready {
            return Err(HubError::ProviderUnavailable { provider: self.name().to_string(), state });
        }
        let handler = self
            .registry
            .get(tool)
            .ok_or_else(|| HubError::UnknownTool(ctx.qualified_name.clone()))?;
        let args = Value::Object(args_object(args)?);
        let timeout = ctx.timeout.unwrap_or(self.call_timeout);

        debug!(tool = %ctx.qualified_name, "executing local tool");
        tokio::select! {
            outcome = tokio::time::timeout(timeout, handler.execute(args)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(HubError::CallTimeout {
                    tool: ctx.qualified_name,
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
            // Dropping the handler future abandons it; any result is discarded.
            _ = ctx.cancel.cancelled() => Err(HubError::Cancelled { tool: ctx.qualified_name }),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.state.transition(ProviderState::Dead, None);
        Ok(())
    }
}
