//! Owns every provider for the lifetime of a gateway session

use futures::future::join_all;
use hub_config::ProviderDefinition;
use hub_core::{ProviderId, ProviderKind, ProviderState};
use hub_tools::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::{LocalProvider, Provider, ProviderEvent, ProviderStatus};
use crate::remote::{RemoteProvider, SupervisionOptions};
use crate::transport::Launcher;

const EVENT_CAPACITY: usize = 256;

/// Arena of providers indexed by [`ProviderId`].
///
/// Providers are registered before the supervisor is shared; the set is
/// fixed for the rest of the session. Registration order is catalog
/// precedence order.
pub struct ProcessSupervisor {
    providers: Vec<Arc<dyn Provider>>,
    events: broadcast::Sender<ProviderEvent>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            providers: Vec::new(),
            events,
        }
    }

    fn next_id(&self) -> ProviderId {
        ProviderId(self.providers.len())
    }

    pub fn add_local(
        &mut self,
        prefix: impl Into<String>,
        registry: Arc<ToolRegistry>,
        call_timeout: Duration,
    ) -> ProviderId {
        let id = self.next_id();
        let provider = LocalProvider::new(id, prefix, registry, call_timeout, self.events.clone());
        self.providers.push(Arc::new(provider));
        id
    }

    pub fn add_remote(
        &mut self,
        definition: ProviderDefinition,
        launcher: Arc<dyn Launcher>,
        options: SupervisionOptions,
    ) -> ProviderId {
        let id = self.next_id();
        debug!("Registering remote provider '{}' as {}", definition.name, id);
        let provider = RemoteProvider::new(id, definition, launcher, options, self.events.clone());
        self.providers.push(provider);
        id
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.providers.get(id.0).cloned()
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.providers.iter().map(|p| p.status()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// Start every provider. Local providers are ready when this returns;
    /// remote providers start on their own tasks so a slow or failing one
    /// never holds up the others.
    pub async fn start_all(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for provider in &self.providers {
            match provider.kind() {
                ProviderKind::Local => {
                    if let Err(e) = provider.start().await {
                        warn!("Local provider failed to start: {}", e);
                    }
                }
                ProviderKind::Remote => {
                    let provider = provider.clone();
                    handles.push(tokio::spawn(async move {
                        if let Err(e) = provider.start().await {
                            debug!("Provider '{}' start failed: {}", provider.name(), e);
                        }
                    }));
                }
            }
        }
        info!("Started {} providers ({} remote launching)", self.providers.len(), handles.len());
        handles
    }

    /// Whether every provider has left its startup states.
    pub fn is_settled(&self) -> bool {
        self.providers.iter().all(|p| {
            !matches!(p.state(), ProviderState::Discovered | ProviderState::Starting)
        })
    }

    /// Wait until every provider has finished starting (successfully or not),
    /// or until `timeout` elapses. Returns whether all settled.
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        let mut events = self.subscribe();
        let wait = async {
            while !self.is_settled() {
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok() && self.is_settled()
    }

    /// Stop every provider in parallel. Each remote gets the configured grace
    /// period before it is killed.
    pub async fn shutdown(&self) {
        info!("Shutting down {} providers", self.providers.len());
        let stops = self.providers.iter().map(|provider| {
            let provider = provider.clone();
            async move {
                if let Err(e) = provider.stop().await {
                    warn!("Error stopping provider '{}': {}", provider.name(), e);
                }
            }
        });
        join_all(stops).await;
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
