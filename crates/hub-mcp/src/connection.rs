//! Request/response correlation over one provider stream

use hub_core::{HubError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{BoxedReader, BoxedWriter, FrameReader, FrameWriter, Message};
use crate::types::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, METHOD_CANCELLED,
};

type Delivery = std::result::Result<JsonRpcResponse, HubError>;

/// An outstanding outbound request awaiting exactly one resolution.
#[derive(Debug)]
pub struct PendingCall {
    pub method: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    /// Host request this call was issued on behalf of
    pub host_request: Option<RequestId>,
    tx: oneshot::Sender<Delivery>,
}

/// Provider-initiated traffic handed to the owner of the connection.
#[derive(Debug)]
pub enum Inbound {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// Per-request options for [`RpcConnection::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Name used in timeout and cancellation errors
    pub label: String,
    pub host_request: Option<RequestId>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new(label: impl Into<String>, timeout: Duration) -> Self {
        Self {
            timeout,
            label: label.into(),
            host_request: None,
            cancel: None,
        }
    }

    pub fn on_behalf_of(mut self, host_request: Option<RequestId>) -> Self {
        self.host_request = host_request;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// A JSON-RPC client over a pair of byte streams.
///
/// Every request registers a [`PendingCall`] under a fresh id. Whichever of
/// response, deadline, cancellation or stream loss comes first removes the
/// entry; the others find it gone and do nothing.
pub struct RpcConnection {
    name: String,
    writer: FrameWriter,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<watch::Sender<bool>>,
    reader_task: JoinHandle<()>,
}

impl RpcConnection {
    pub fn spawn(
        name: impl Into<String>,
        reader: BoxedReader,
        writer: BoxedWriter,
        inbound: Option<mpsc::UnboundedSender<Inbound>>,
    ) -> Arc<Self> {
        let name = name.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(watch::channel(false).0);

        let reader_task = tokio::spawn(read_loop(
            name.clone(),
            FrameReader::new(reader),
            pending.clone(),
            closed.clone(),
            inbound,
        ));

        Arc::new(Self {
            writer: FrameWriter::new(name.clone(), writer),
            name,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the inbound stream has ended.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stop reading and fail every outstanding request, as if the stream had
    /// ended.
    pub fn abort(&self) {
        self.reader_task.abort();
        fail_pending(&self.name, &self.pending, &self.closed);
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Send a request and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + options.timeout;

        self.lock_pending().insert(
            id,
            PendingCall {
                method: method.to_string(),
                issued_at,
                deadline,
                host_request: options.host_request.clone(),
                tx,
            },
        );
        // The reader flags closure before draining, so an entry inserted after
        // the drain is caught here.
        if self.is_closed() {
            self.take_pending(id);
            return Err(HubError::ConnectionClosed(self.name.clone()));
        }

        let request = JsonRpcRequest::new(RequestId::from(id), method, params);
        if let Err(e) = self.writer.send(&Message::Request(request)).await {
            self.take_pending(id);
            return Err(e);
        }
        debug!(provider = %self.name, id, method, "request sent");

        let cancel = options.cancel.clone().unwrap_or_default();
        tokio::pin!(rx);

        let delivery = tokio::select! {
            delivered = &mut rx => delivered
                .unwrap_or_else(|_| Err(HubError::ConnectionClosed(self.name.clone()))),
            _ = tokio::time::sleep_until(deadline) => {
                if self.take_pending(id).is_some() {
                    warn!(provider = %self.name, id, method, "request timed out");
                    return Err(HubError::CallTimeout {
                        tool: options.label,
                        timeout_ms: options.timeout.as_millis() as u64,
                    });
                }
                // Lost the race to the reader; its delivery is already queued.
                rx.await.unwrap_or_else(|_| Err(HubError::ConnectionClosed(self.name.clone())))
            }
            _ = cancel.cancelled() => {
                if self.take_pending(id).is_some() {
                    info!(provider = %self.name, id, method, "request cancelled");
                    let note = JsonRpcNotification::new(
                        METHOD_CANCELLED,
                        Some(json!({ "requestId": id, "reason": "cancelled by client" })),
                    );
                    if let Err(e) = self.writer.send(&Message::Notification(note)).await {
                        debug!(provider = %self.name, "failed to forward cancellation: {}", e);
                    }
                    return Err(HubError::Cancelled { tool: options.label });
                }
                rx.await.unwrap_or_else(|_| Err(HubError::ConnectionClosed(self.name.clone())))
            }
        };

        let response = delivery?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = JsonRpcNotification::new(method, params);
        self.writer.send(&Message::Notification(note)).await
    }

    /// Answer a provider-initiated request.
    pub async fn respond(&self, response: JsonRpcResponse) -> Result<()> {
        self.writer.send(&Message::Response(response)).await
    }

    /// Close the outbound stream; a well-behaved provider exits on EOF.
    pub async fn close(&self) {
        self.writer.close().await;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, id: u64) -> Option<PendingCall> {
        self.lock_pending().remove(&id)
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    name: String,
    mut reader: FrameReader,
    pending: PendingMap,
    closed: Arc<watch::Sender<bool>>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
) {
    loop {
        match reader.next_frame().await {
            Ok(Some(line)) => match Message::decode(&line) {
                Ok(Message::Response(response)) => deliver(&name, &pending, response),
                Ok(Message::Request(request)) => forward(&name, &inbound, Inbound::Request(request)),
                Ok(Message::Notification(note)) => {
                    forward(&name, &inbound, Inbound::Notification(note))
                }
                Err(e) => warn!(provider = %name, "{}", e.into_hub_error(&name)),
            },
            Ok(None) => {
                info!(provider = %name, "provider stream closed");
                break;
            }
            Err(e) => {
                warn!(provider = %name, "provider stream failed: {}", e);
                break;
            }
        }
    }

    fail_pending(&name, &pending, &closed);
}

/// Mark the connection closed, then fail whatever is still pending.
fn fail_pending(name: &str, pending: &PendingMap, closed: &watch::Sender<bool>) {
    closed.send_replace(true);
    let drained: Vec<(u64, PendingCall)> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (id, call) in drained {
        debug!(provider = %name, id, method = %call.method, "failing pending request on close");
        let _ = call.tx.send(Err(HubError::ConnectionClosed(name.to_string())));
    }
}

fn deliver(name: &str, pending: &PendingMap, response: JsonRpcResponse) {
    let Some(id) = response.id.as_ref().and_then(RequestId::as_u64) else {
        warn!(provider = %name, "response without a usable id dropped");
        return;
    };
    let call = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    match call {
        Some(call) => {
            debug!(
                provider = %name,
                id,
                elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
                "response received"
            );
            let _ = call.tx.send(Ok(response));
        }
        None => debug!(provider = %name, id, "late or unknown response dropped"),
    }
}

fn forward(name: &str, inbound: &Option<mpsc::UnboundedSender<Inbound>>, message: Inbound) {
    match inbound {
        Some(tx) if tx.send(message).is_ok() => {}
        _ => debug!(provider = %name, "unhandled provider-initiated message dropped"),
    }
}
