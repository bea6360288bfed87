//! Newline-delimited JSON-RPC framing shared by the host and provider streams

use hub_core::{codes, HubError, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::trace;

use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One decoded frame.
#[derive(Debug, Clone)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Why a frame could not be decoded, with enough context to answer it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// `PARSE_ERROR` for invalid JSON, `INVALID_REQUEST` for valid JSON that
    /// is not a JSON-RPC message
    pub code: i32,
    /// Id of the offending request, when one could be recovered
    pub id: Option<RequestId>,
    pub message: String,
}

impl DecodeError {
    pub fn into_hub_error(self, stream: &str) -> HubError {
        HubError::malformed(stream, self.message)
    }
}

impl Message {
    pub fn decode(line: &str) -> std::result::Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(line).map_err(|e| DecodeError {
            code: codes::PARSE_ERROR,
            id: None,
            message: format!("invalid JSON: {}", e),
        })?;

        let invalid = |id: Option<RequestId>, message: String| DecodeError {
            code: codes::INVALID_REQUEST,
            id,
            message,
        };

        let Some(object) = value.as_object() else {
            return Err(invalid(None, "frame is not a JSON object".into()));
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(invalid(None, "missing or unsupported jsonrpc version".into()));
        }

        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw.clone())
                    .map_err(|_| invalid(None, format!("unsupported id: {}", raw)))?,
            ),
        };

        if object.contains_key("method") {
            return if id.is_some() {
                serde_json::from_value(value.clone())
                    .map(Message::Request)
                    .map_err(|e| invalid(id.clone(), format!("invalid request: {}", e)))
            } else {
                serde_json::from_value(value.clone())
                    .map(Message::Notification)
                    .map_err(|e| invalid(None, format!("invalid notification: {}", e)))
            };
        }

        if object.contains_key("result") || object.contains_key("error") {
            return serde_json::from_value(value.clone())
                .map(Message::Response)
                .map_err(|e| invalid(id.clone(), format!("invalid response: {}", e)));
        }

        Err(invalid(id, "frame is neither a request, a notification nor a response".into()))
    }

    pub fn encode(&self) -> Result<String> {
        let line = match self {
            Message::Request(request) => serde_json::to_string(request)?,
            Message::Response(response) => serde_json::to_string(response)?,
            Message::Notification(notification) => serde_json::to_string(notification)?,
        };
        Ok(line)
    }
}

/// Splits a byte stream into newline-terminated frames.
pub struct FrameReader {
    inner: BufReader<BoxedReader>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Next non-empty frame, or `None` at a clean end of stream.
    ///
    /// Bytes left without a terminating newline when the stream ends are
    /// reported as `UnexpectedEof` rather than dispatched.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<String>> {
        loop {
            self.buf.clear();
            let n = self.inner.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes)", n),
                ));
            }

            let line = String::from_utf8_lossy(&self.buf);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                trace!("<- {}", trimmed);
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

/// Writes whole frames; concurrent senders never interleave bytes.
pub struct FrameWriter {
    inner: Mutex<Option<BoxedWriter>>,
    stream: String,
}

impl FrameWriter {
    pub fn new(stream: impl Into<String>, writer: BoxedWriter) -> Self {
        Self {
            inner: Mutex::new(Some(writer)),
            stream: stream.into(),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut line = message.encode()?;
        line.push('\n');

        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| HubError::ConnectionClosed(self.stream.clone()))?;
        trace!("-> {}", line.trim_end());
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down and release the underlying stream. Later sends fail with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}
