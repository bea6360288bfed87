//! Wires discovery, supervision, catalog and routing into one session.

use hub_config::{GatewaySettings, ProviderDefinition};
use hub_core::{ProviderState, Result};
use hub_tools::ToolRegistry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builtin::{ProvidersTool, RefreshCatalogTool};
use crate::catalog::{Catalog, CatalogHandle};
use crate::codec::{BoxedReader, BoxedWriter};
use crate::host::HostConnection;
use crate::provider::{ProviderEvent, ProviderStatus};
use crate::remote::SupervisionOptions;
use crate::router::RequestRouter;
use crate::supervisor::ProcessSupervisor;
use crate::transport::{Launcher, ProcessLauncher};

pub struct GatewayBuilder {
    settings: GatewaySettings,
    registry: Arc<ToolRegistry>,
    launcher: Arc<dyn Launcher>,
    providers: Vec<ProviderDefinition>,
}

impl GatewayBuilder {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings,
            registry: Arc::new(ToolRegistry::new()),
            launcher: Arc::new(ProcessLauncher::new()),
            providers: Vec::new(),
        }
    }

    /// In-process tools served by the local provider.
    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_providers(mut self, providers: Vec<ProviderDefinition>) -> Self {
        self.providers = providers;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let options = SupervisionOptions::from_settings(&self.settings);
        let mut supervisor = ProcessSupervisor::new();
        supervisor.add_local(
            self.settings.local_prefix.clone(),
            self.registry.clone(),
            self.settings.timeouts.local_call(),
        );
        for definition in self.providers {
            supervisor.add_remote(definition, self.launcher.clone(), options.clone());
        }

        let supervisor = Arc::new(supervisor);
        let catalog = Arc::new(CatalogHandle::new());
        self.registry.register(ProvidersTool::new(&supervisor))?;
        self.registry
            .register(RefreshCatalogTool::new(&supervisor, catalog.clone()))?;

        let router = Arc::new(RequestRouter::new(supervisor.clone(), catalog.clone()));
        Ok(Gateway {
            settings: self.settings,
            supervisor,
            catalog,
            router,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// One gateway session: providers, their catalog and the router in front.
pub struct Gateway {
    settings: GatewaySettings,
    supervisor: Arc<ProcessSupervisor>,
    catalog: Arc<CatalogHandle>,
    router: Arc<RequestRouter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(settings: GatewaySettings) -> GatewayBuilder {
        GatewayBuilder::new(settings)
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.snapshot()
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.supervisor.statuses()
    }

    /// Start all providers and keep the catalog in step with them. Returns
    /// once local tools are listed; remote providers join as they become
    /// ready.
    pub async fn start(&self) {
        let events = self.supervisor.subscribe();
        let maintainer = tokio::spawn(maintain_catalog(
            self.supervisor.clone(),
            self.catalog.clone(),
            events,
        ));
        self.lock_tasks().push(maintainer);

        let launches = self.supervisor.start_all().await;
        self.lock_tasks().extend(launches);
        self.catalog.refresh(&self.supervisor).await;
    }

    /// Wait for every provider to finish starting, then rebuild the catalog.
    pub async fn settle(&self, timeout: Duration) -> Arc<Catalog> {
        if !self.supervisor.wait_settled(timeout).await {
            warn!("Some providers were still starting after {:?}", timeout);
        }
        self.catalog.refresh(&self.supervisor).await
    }

    /// Serve a host over the given streams until it disconnects.
    pub async fn serve(&self, reader: BoxedReader, writer: BoxedWriter) -> Result<()> {
        let host = HostConnection::new(
            self.router.clone(),
            self.catalog.clone(),
            writer,
            self.settings.name.clone(),
        );
        host.serve(reader).await
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
            .await
    }

    /// Stop every provider. The gateway is not restartable afterwards.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.supervisor.shutdown().await;
        info!("Gateway stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rebuild the catalog whenever a provider enters or leaves `Ready`, or
/// announces new tools.
async fn maintain_catalog(
    supervisor: Arc<ProcessSupervisor>,
    catalog: Arc<CatalogHandle>,
    mut events: tokio::sync::broadcast::Receiver<ProviderEvent>,
) {
    loop {
        let rebuild = match events.recv().await {
            Ok(ProviderEvent::StateChanged { name, from, to, .. }) => {
                debug!(provider = %name, "{} -> {}", from, to);
                from == ProviderState::Ready
                    || to == ProviderState::Ready
                    || to == ProviderState::Dead
            }
            Ok(ProviderEvent::ToolsChanged { .. }) => true,
            Err(RecvError::Lagged(skipped)) => {
                debug!("missed {} provider events", skipped);
                true
            }
            Err(RecvError::Closed) => break,
        };
        if rebuild {
            catalog.refresh(&supervisor).await;
        }
    }
}
