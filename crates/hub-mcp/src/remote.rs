//! Remote providers: separately launched processes spoken to over stdio.
//!
//! A remote provider is launched and handshaken once by [`Provider::start`].
//! After it first becomes ready a monitor task owns the process: it notices
//! crashes (process exit or loss of its output stream), restarts with backoff
//! up to the policy's bound, and performs the graceful stop at shutdown.

use async_trait::async_trait;
use hub_config::{GatewaySettings, ProviderDefinition, RestartPolicy};
use hub_core::{codes, HubError, ProviderId, ProviderKind, ProviderState, Result, ToolSpec};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{Inbound, RequestOptions, RpcConnection};
use crate::provider::{CallContext, Provider, ProviderEvent, ProviderStatus, StateCell};
use crate::transport::{Launcher, ProcessHandle, Spawned};
use crate::types::{
    Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcResponse,
    ListToolsResult, ToolCallParams, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, METHOD_TOOLS_LIST_CHANGED, PROTOCOL_VERSION,
};

const MAX_LIST_PAGES: usize = 64;

/// Timeouts and restart policy applied to every remote provider.
#[derive(Debug, Clone)]
pub struct SupervisionOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
    pub restart_policy: RestartPolicy,
}

impl SupervisionOptions {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            handshake_timeout: settings.timeouts.handshake(),
            call_timeout: settings.timeouts.call(),
            shutdown_grace: settings.timeouts.shutdown_grace(),
            restart_policy: settings.restart_policy.clone(),
        }
    }
}

impl Default for SupervisionOptions {
    fn default() -> Self {
        Self::from_settings(&GatewaySettings::default())
    }
}

/// A live process plus the connection speaking to it.
struct Running {
    connection: Arc<RpcConnection>,
    process: Box<dyn ProcessHandle>,
}

pub struct RemoteProvider {
    me: Weak<RemoteProvider>,
    definition: ProviderDefinition,
    launcher: Arc<dyn Launcher>,
    options: SupervisionOptions,
    state: StateCell,
    connection: RwLock<Option<Arc<RpcConnection>>>,
    tools: Mutex<Option<Vec<ToolSpec>>>,
    shutdown: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteProvider {
    pub fn new(
        id: ProviderId,
        definition: ProviderDefinition,
        launcher: Arc<dyn Launcher>,
        options: SupervisionOptions,
        events: broadcast::Sender<ProviderEvent>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: StateCell::new(id, &definition.name, events),
            definition,
            launcher,
            options,
            connection: RwLock::new(None),
            tools: Mutex::new(None),
            shutdown,
            monitor: Mutex::new(None),
        })
    }

    pub fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    fn call_timeout(&self) -> Duration {
        self.definition.call_timeout.unwrap_or(self.options.call_timeout)
    }

    fn current_connection(&self) -> Option<Arc<RpcConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connection(&self, connection: Option<Arc<RpcConnection>>) {
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connection usable for calls, or the error a caller should see.
    fn ready_connection(&self) -> Result<Arc<RpcConnection>> {
        let state = self.state.get();
        match (state, self.current_connection()) {
            (ProviderState::Ready, Some(connection)) if !connection.is_closed() => Ok(connection),
            _ => Err(self.unavailable()),
        }
    }

    fn unavailable(&self) -> HubError {
        let state = match self.state.get() {
            // The stream is gone even if the monitor has not caught up yet
            ProviderState::Ready => ProviderState::Degraded,
            other => other,
        };
        HubError::ProviderUnavailable { provider: self.definition.name.clone(), state }
    }

    async fn launch_and_handshake(&self) -> Result<Running> {
        let name = self.definition.name.as_str();
        let Spawned { reader, writer, mut process } =
            self.launcher.launch(name, &self.definition.launch).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = RpcConnection::spawn(name, reader, writer, Some(inbound_tx));
        tokio::spawn(serve_inbound(
            self.me.clone(),
            Arc::downgrade(&connection),
            inbound_rx,
        ));

        match self.handshake(&connection).await {
            Ok(()) => Ok(Running { connection, process }),
            Err(e) => {
                connection.close().await;
                if let Err(kill_err) = process.kill().await {
                    debug!(provider = %name, "kill after failed handshake: {}", kill_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self, connection: &RpcConnection) -> Result<()> {
        let name = &self.definition.name;
        let timeout = self.options.handshake_timeout;
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Some(Implementation::default()),
        };

        let result = connection
            .request(
                METHOD_INITIALIZE,
                Some(serde_json::to_value(params)?),
                RequestOptions::new(format!("{}/initialize", name), timeout),
            )
            .await
            .map_err(|e| match e {
                HubError::CallTimeout { .. } => HubError::HandshakeTimeout {
                    provider: name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                },
                other => HubError::startup(name.as_str(), other.to_string()),
            })?;

        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => {
                let server = init
                    .server_info
                    .map(|info| format!("{} {}", info.name, info.version))
                    .unwrap_or_else(|| "unknown server".to_string());
                info!(provider = %name, protocol = %init.protocol_version, "handshake complete with {}", server);
            }
            Err(e) => warn!(provider = %name, "unexpected initialize result: {}", e),
        }

        connection.notify(METHOD_INITIALIZED, None).await
    }

    /// Stop a running instance: close its input, wait out the grace period,
    /// then kill.
    async fn graceful_stop(&self, mut running: Running) {
        let name = &self.definition.name;
        running.connection.close().await;
        match tokio::time::timeout(self.options.shutdown_grace, running.process.wait()).await {
            Ok(Ok(exit)) => info!(provider = %name, code = ?exit.code, "provider exited"),
            Ok(Err(e)) => warn!(provider = %name, "error waiting for provider exit: {}", e),
            Err(_) => {
                warn!(
                    provider = %name,
                    "provider did not exit within {:?}; killing",
                    self.options.shutdown_grace
                );
                if let Err(e) = running.process.kill().await {
                    warn!(provider = %name, "failed to kill provider: {}", e);
                }
            }
        }
    }

    /// Owns the process after the first successful start.
    async fn monitor(self: Arc<Self>, mut running: Running) {
        let name = self.definition.name.clone();
        let policy = self.options.restart_policy.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut attempts: u32 = 0;

        loop {
            // `None` means shutdown was requested
            let crashed = tokio::select! {
                exit = running.process.wait() => Some(match exit {
                    Ok(exit) => format!("process exited with code {:?}", exit.code),
                    Err(e) => format!("lost track of process: {}", e),
                }),
                _ = running.connection.closed() => Some("output stream closed".to_string()),
                _ = shutdown_requested(&mut shutdown) => None,
            };
            let Some(reason) = crashed else {
                self.set_connection(None);
                self.graceful_stop(running).await;
                self.state.transition(ProviderState::Dead, None);
                return;
            };

            self.set_connection(None);
            running.connection.abort();
            running.connection.close().await;
            if let Err(e) = running.process.kill().await {
                debug!(provider = %name, "kill after crash: {}", e);
            }
            let crash = HubError::ProviderCrashed { provider: name.clone(), message: reason };
            warn!("{}", crash);
            self.state.transition(ProviderState::Degraded, Some(crash.to_string()));

            // Restart attempts are counted for the whole session.
            loop {
                attempts += 1;
                if attempts > policy.max_retries {
                    let err = HubError::RestartsExhausted {
                        provider: name.clone(),
                        attempts: policy.max_retries,
                    };
                    error!("{}", err);
                    *self.tools.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    self.state.transition(ProviderState::Dead, Some(err.to_string()));
                    return;
                }

                let delay = policy.delay_for(attempts);
                info!(
                    provider = %name,
                    "restarting in {:?} (attempt {}/{})",
                    delay, attempts, policy.max_retries
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(&mut shutdown) => {
                        self.state.transition(ProviderState::Dead, None);
                        return;
                    }
                }

                self.state.record_restart();
                self.state.transition(ProviderState::Starting, None);
                let attempt = tokio::select! {
                    attempt = self.launch_and_handshake() => attempt,
                    _ = shutdown_requested(&mut shutdown) => {
                        self.state.transition(ProviderState::Dead, None);
                        return;
                    }
                };
                match attempt {
                    Ok(next) => {
                        self.set_connection(Some(next.connection.clone()));
                        running = next;
                        self.state.transition(ProviderState::Ready, None);
                        break;
                    }
                    Err(e) => {
                        warn!(provider = %name, "restart attempt {} failed: {}", attempts, e);
                        self.state.transition(ProviderState::Degraded, Some(e.to_string()));
                    }
                }
            }
        }
    }

    fn invalidate_tools(&self) {
        *self.tools.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.state.emit(ProviderEvent::ToolsChanged {
            id: self.state.id(),
            name: self.definition.name.clone(),
        });
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Answers provider-initiated traffic for one connection.
async fn serve_inbound(
    provider: Weak<RemoteProvider>,
    connection: Weak<RpcConnection>,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Inbound::Request(request) => {
                let response = if request.method == METHOD_PING {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    JsonRpcResponse::failure(
                        Some(request.id),
                        JsonRpcError::new(
                            codes::METHOD_NOT_FOUND,
                            format!("Method not found: {}", request.method),
                        ),
                    )
                };
                let Some(conn) = connection.upgrade() else { break };
                if let Err(e) = conn.respond(response).await {
                    debug!(provider = %conn.name(), "failed to answer provider request: {}", e);
                }
            }
            Inbound::Notification(note) if note.method == METHOD_TOOLS_LIST_CHANGED => {
                if let Some(provider) = provider.upgrade() {
                    info!(provider = %provider.definition.name, "provider tool list changed");
                    provider.invalidate_tools();
                }
            }
            Inbound::Notification(note) => {
                debug!(method = %note.method, params = ?note.params, "provider notification");
            }
        }
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn id(&self) -> ProviderId {
        self.state.id()
    }

    fn name(&self) -> &str {
        &self.definition.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    fn prefix(&self) -> &str {
        &self.definition.prefix
    }

    fn status(&self) -> ProviderStatus {
        let launch = &self.definition.launch;
        let command = std::iter::once(launch.command.as_str())
            .chain(launch.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.state.status(ProviderKind::Remote, &self.definition.prefix, Some(command))
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    fn cached_tools(&self) -> Option<Vec<ToolSpec>> {
        self.tools.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn start(&self) -> Result<()> {
        if !self.state.transition(ProviderState::Starting, None) {
            return Err(self.unavailable());
        }

        let running = match self.launch_and_handshake().await {
            Ok(running) => running,
            Err(e) => {
                error!("{}", e);
                self.state.transition(ProviderState::Dead, Some(e.to_string()));
                return Err(e);
            }
        };

        // Checked under the monitor lock so `stop` either sees the monitor or
        // we see its shutdown request.
        let stopped = {
            let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
            match self.me.upgrade() {
                Some(me) if !self.is_shutting_down() => {
                    self.set_connection(Some(running.connection.clone()));
                    self.state.transition(ProviderState::Ready, None);
                    *slot = Some(tokio::spawn(me.monitor(running)));
                    None
                }
                _ => Some(running),
            }
        };

        match stopped {
            None => Ok(()),
            Some(running) => {
                self.graceful_stop(running).await;
                self.state.transition(ProviderState::Dead, None);
                Err(self.unavailable())
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let connection = self.ready_connection()?;
        let name = &self.definition.name;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = connection
                .request(
                    METHOD_TOOLS_LIST,
                    params,
                    RequestOptions::new(format!("{}/tools/list", name), self.call_timeout()),
                )
                .await
                .map_err(|e| match e {
                    HubError::ConnectionClosed(_) => self.unavailable(),
                    other => other,
                })?;
            let page: ListToolsResult = serde_json::from_value(value)
                .map_err(|e| HubError::malformed(name.as_str(), format!("invalid tools/list result: {}", e)))?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    cursor = None;
                    break;
                }
            }
        }
        if cursor.is_some() {
            warn!(provider = %name, "tools/list still paginating after {} pages; truncating", MAX_LIST_PAGES);
        }

        debug!(provider = %name, "listed {} tools", tools.len());
        *self.tools.lock().unwrap_or_else(PoisonError::into_inner) = Some(tools.clone());
        Ok(tools)
    }

    async fn call(&self, tool: &str, args: Value, ctx: CallContext) -> Result<Value> {
        let connection = self.ready_connection()?;
        let timeout = ctx.timeout.unwrap_or_else(|| self.call_timeout());
        let params = serde_json::to_value(ToolCallParams {
            name: tool.to_string(),
            arguments: args,
        })?;
        let options = RequestOptions::new(ctx.qualified_name.clone(), timeout)
            .on_behalf_of(ctx.host_request.clone())
            .with_cancel(ctx.cancel.clone());

        connection
            .request(METHOD_TOOLS_CALL, Some(params), options)
            .await
            .map_err(|e| match e {
                HubError::ConnectionClosed(_) => self.unavailable(),
                other => other,
            })
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        match monitor {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(provider = %self.definition.name, "monitor task failed: {}", e);
                }
            }
            None => {
                self.state.transition(ProviderState::Dead, None);
            }
        }
        Ok(())
    }
}
