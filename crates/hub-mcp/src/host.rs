//! The single connection to the host client.
//!
//! Every request is handled on its own task, so a slow tool call never holds
//! up `tools/list` or other calls; responses go out in completion order.

use hub_core::{codes, HubError, ProviderKind, Result};
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, CatalogHandle};
use crate::codec::{BoxedReader, BoxedWriter, FrameReader, FrameWriter, Message};
use crate::router::{RequestRouter, Routed};
use crate::types::{
    CancelledParams, Implementation, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, ToolCallParams, METHOD_CANCELLED,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    METHOD_TOOLS_LIST_CHANGED, PROTOCOL_VERSION,
};

const STREAM: &str = "host";

pub struct HostConnection {
    router: Arc<RequestRouter>,
    catalog: Arc<CatalogHandle>,
    writer: FrameWriter,
    server_info: Implementation,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    initialized: AtomicBool,
    /// Parent of every request token. Cancelled when the session ends or the
    /// host stream fails.
    session: CancellationToken,
}

impl HostConnection {
    pub fn new(
        router: Arc<RequestRouter>,
        catalog: Arc<CatalogHandle>,
        writer: BoxedWriter,
        server_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            catalog,
            writer: FrameWriter::new(STREAM, writer),
            server_info: Implementation {
                name: server_name.into(),
                ..Implementation::default()
            },
            in_flight: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            session: CancellationToken::new(),
        })
    }

    /// Serve the host until its input ends or its output fails.
    pub async fn serve(self: Arc<Self>, reader: BoxedReader) -> Result<()> {
        let mut frames = FrameReader::new(reader);
        let notifier = tokio::spawn(self.clone().announce_catalog_changes());
        info!("Serving host connection");

        let outcome = loop {
            let frame = tokio::select! {
                frame = frames.next_frame() => frame,
                _ = self.session.cancelled() => {
                    break Err(HubError::ConnectionClosed(STREAM.to_string()));
                }
            };
            match frame {
                Ok(Some(line)) => self.dispatch(&line).await,
                Ok(None) => {
                    info!("Host closed the connection");
                    break Ok(());
                }
                Err(e) => {
                    warn!("Host stream failed: {}", e);
                    break Err(HubError::IoError(e));
                }
            }
        };

        notifier.abort();
        let abandoned = {
            let mut in_flight = self.lock_in_flight();
            let count = in_flight.len();
            in_flight.clear();
            count
        };
        if abandoned > 0 {
            debug!("cancelling {} in-flight calls", abandoned);
        }
        self.session.cancel();
        outcome
    }

    async fn dispatch(self: &Arc<Self>, line: &str) {
        match Message::decode(line) {
            Ok(Message::Request(request)) => {
                let cancel = self.session.child_token();
                let tracked = request.method == METHOD_TOOLS_CALL;
                if tracked {
                    let registered = match self.lock_in_flight().entry(request.id.clone()) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(slot) => {
                            slot.insert(cancel.clone());
                            true
                        }
                    };
                    if !registered {
                        warn!(id = %request.id, "host reused an in-flight request id");
                        let error = JsonRpcError::new(
                            codes::INVALID_REQUEST,
                            format!("Request id {} is already in flight", request.id),
                        );
                        let response = JsonRpcResponse::failure(Some(request.id), error);
                        self.send(Message::Response(response)).await;
                        return;
                    }
                }
                let this = self.clone();
                tokio::spawn(async move {
                    let id = request.id.clone();
                    let response = this.handle_request(request, cancel).await;
                    if tracked {
                        this.lock_in_flight().remove(&id);
                    }
                    this.send(Message::Response(response)).await;
                });
            }
            Ok(Message::Notification(note)) => self.handle_notification(note),
            Ok(Message::Response(response)) => {
                debug!(id = ?response.id, "ignoring response from host");
            }
            Err(e) => {
                warn!("{}", e.clone().into_hub_error(STREAM));
                let response = JsonRpcResponse::failure(e.id, JsonRpcError::new(e.code, e.message));
                self.send(Message::Response(response)).await;
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest, cancel: CancellationToken) -> JsonRpcResponse {
        let JsonRpcRequest { id, method, params, .. } = request;
        debug!(%id, %method, "host request");

        let outcome = match method.as_str() {
            METHOD_INITIALIZE => self.initialize(),
            METHOD_PING => Ok(json!({})),
            METHOD_TOOLS_LIST => self.list_tools(),
            METHOD_TOOLS_CALL => self.call_tool(&id, params, cancel).await,
            other => {
                return JsonRpcResponse::failure(
                    Some(id),
                    JsonRpcError::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", other)),
                );
            }
        };

        match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::failure(Some(id), JsonRpcError::from(&e)),
        }
    }

    fn handle_notification(&self, note: JsonRpcNotification) {
        match note.method.as_str() {
            METHOD_INITIALIZED => {
                self.initialized.store(true, Ordering::SeqCst);
                info!("Host initialized");
            }
            METHOD_CANCELLED => {
                let params = note
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
                let Some(params) = params else {
                    warn!("cancellation without a usable requestId ignored");
                    return;
                };
                let token = self.lock_in_flight().get(&params.request_id).cloned();
                match token {
                    Some(token) => {
                        info!(id = %params.request_id, reason = ?params.reason, "host cancelled request");
                        token.cancel();
                    }
                    None => debug!(id = %params.request_id, "cancellation for unknown request"),
                }
            }
            other => debug!(method = %other, "ignoring host notification"),
        }
    }

    fn initialize(&self) -> Result<Value> {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({ "tools": { "listChanged": true } }),
            server_info: Some(self.server_info.clone()),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn list_tools(&self) -> Result<Value> {
        let snapshot = self.catalog.snapshot();
        let result = ListToolsResult {
            tools: snapshot.tool_specs(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn call_tool(&self, id: &RequestId, params: Option<Value>, cancel: CancellationToken) -> Result<Value> {
        let params: ToolCallParams = params
            .ok_or_else(|| HubError::InvalidParams("tools/call requires params".into()))
            .and_then(|p| {
                serde_json::from_value(p).map_err(|e| HubError::InvalidParams(e.to_string()))
            })?;

        let routed = self
            .router
            .call(&params.name, params.arguments, Some(id.clone()), cancel)
            .await?;
        Ok(into_call_result(routed))
    }

    /// Tell the host when the set of advertised names changes.
    async fn announce_catalog_changes(self: Arc<Self>) {
        let mut generations = self.catalog.subscribe();
        let mut announced: Arc<Catalog> = self.catalog.snapshot();
        while generations.changed().await.is_ok() {
            let current = self.catalog.snapshot();
            if current.same_names(&announced) {
                continue;
            }
            announced = current;
            if !self.initialized.load(Ordering::SeqCst) {
                continue;
            }
            debug!("announcing tool list change");
            let note = JsonRpcNotification::new(METHOD_TOOLS_LIST_CHANGED, None);
            self.send(Message::Notification(note)).await;
        }
    }

    async fn send(&self, message: Message) {
        if let Err(e) = self.writer.send(&message).await {
            error!("Failed to write to host: {}", e);
            self.session.cancel();
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remote results are relayed verbatim; local values are wrapped as text
/// content unless they already are a call result.
fn into_call_result(routed: Routed) -> Value {
    match routed.kind {
        ProviderKind::Remote => routed.value,
        ProviderKind::Local => {
            if routed.value.get("content").map_or(false, Value::is_array) {
                return routed.value;
            }
            let text = serde_json::to_string_pretty(&routed.value)
                .unwrap_or_else(|_| routed.value.to_string());
            json!({ "content": [{ "type": "text", "text": text }] })
        }
    }
}
