#![allow(dead_code)]

use async_trait::async_trait;
use hub_config::{GatewaySettings, LaunchSpec, ProviderDefinition, SourceKind};
use hub_core::{HubError, ProviderState, Result};
use hub_mcp::codec::FrameReader;
use hub_mcp::{ExitInfo, Gateway, Launcher, ProcessHandle, Spawned};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::{watch, Mutex as AsyncMutex};

/// Behaviour of one scripted provider.
#[derive(Debug, Clone, Default)]
pub struct FakeSpec {
    pub tools: Vec<&'static str>,
    /// Never answer `initialize`
    pub silent: bool,
    /// Launches beyond this count fail
    pub max_launches: Option<usize>,
    /// Tools that take this long to answer
    pub slow_tools: Vec<&'static str>,
    pub slow_delay: Duration,
    /// Keep running after stdin closes, until killed
    pub ignore_eof: bool,
    /// Serve `tools/list` this many tools at a time
    pub page_size: Option<usize>,
    /// Send a `ping` to the gateway once initialized
    pub ping_on_init: bool,
}

impl FakeSpec {
    pub fn with_tools(tools: &[&'static str]) -> Self {
        Self {
            tools: tools.to_vec(),
            ..Default::default()
        }
    }
}

/// Observations shared between the fake providers and the test.
#[derive(Debug, Default)]
pub struct FakeLog {
    /// (provider, original tool name, arguments)
    pub calls: Vec<(String, String, Value)>,
    /// (provider, request id) of `notifications/cancelled` received
    pub cancellations: Vec<(String, Value)>,
    pub launches: HashMap<String, usize>,
    pub kills: HashMap<String, usize>,
    /// Responses to provider-initiated pings
    pub pongs: Vec<Value>,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    specs: Arc<HashMap<String, FakeSpec>>,
    pub log: Arc<Mutex<FakeLog>>,
    instances: Arc<Mutex<HashMap<String, Arc<watch::Sender<bool>>>>>,
}

impl FakeLauncher {
    pub fn new(specs: Vec<(&str, FakeSpec)>) -> Self {
        Self {
            specs: Arc::new(specs.into_iter().map(|(n, s)| (n.to_string(), s)).collect()),
            ..Default::default()
        }
    }

    /// Make the current instance of `name` exit abruptly.
    pub fn crash(&self, name: &str) {
        if let Some(exit) = self.instances.lock().unwrap().get(name) {
            exit.send_replace(true);
        }
    }

    pub fn launches(&self, name: &str) -> usize {
        self.log.lock().unwrap().launches.get(name).copied().unwrap_or(0)
    }

    pub fn kills(&self, name: &str) -> usize {
        self.log.lock().unwrap().kills.get(name).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn definitions(&self) -> Vec<ProviderDefinition> {
        let mut names: Vec<&String> = self.specs.keys().collect();
        names.sort();
        names.into_iter().map(|n| definition(n)).collect()
    }
}

pub fn definition(name: &str) -> ProviderDefinition {
    ProviderDefinition {
        name: name.to_string(),
        prefix: hub_config::slugify(name),
        launch: LaunchSpec {
            command: "fake-provider".to_string(),
            args: vec![name.to_string()],
            env: HashMap::new(),
            cwd: None,
        },
        call_timeout: None,
        source: SourceKind::Explicit,
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, name: &str, _spec: &LaunchSpec) -> Result<Spawned> {
        let spec = self
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::startup(name, "no such fake"))?;

        let launches = {
            let mut log = self.log.lock().unwrap();
            let n = log.launches.entry(name.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if spec.max_launches.map_or(false, |max| launches > max) {
            return Err(HubError::startup(name, "launch refused"));
        }

        let (gateway_out, fake_in) = duplex(256 * 1024);
        let (fake_out, gateway_in) = duplex(256 * 1024);
        let exit = Arc::new(watch::channel(false).0);
        self.instances
            .lock()
            .unwrap()
            .insert(name.to_string(), exit.clone());

        tokio::spawn(run_fake(
            name.to_string(),
            spec,
            fake_in,
            fake_out,
            exit.clone(),
            self.log.clone(),
        ));

        Ok(Spawned {
            reader: Box::new(gateway_in),
            writer: Box::new(gateway_out),
            process: Box::new(FakeProcess {
                name: name.to_string(),
                exit,
                log: self.log.clone(),
            }),
        })
    }
}

struct FakeProcess {
    name: String,
    exit: Arc<watch::Sender<bool>>,
    log: Arc<Mutex<FakeLog>>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let mut rx = self.exit.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
        Ok(ExitInfo { code: Some(0), success: true })
    }

    async fn kill(&mut self) -> Result<()> {
        if !*self.exit.borrow() {
            *self.log.lock().unwrap().kills.entry(self.name.clone()).or_insert(0) += 1;
        }
        self.exit.send_replace(true);
        Ok(())
    }
}

async fn exited(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|e| *e).await;
}

type SharedWriter = Arc<AsyncMutex<Option<DuplexStream>>>;

async fn write_line(writer: &SharedWriter, value: Value) {
    let mut guard = writer.lock().await;
    if let Some(out) = guard.as_mut() {
        let line = format!("{}\n", value);
        let _ = out.write_all(line.as_bytes()).await;
    }
}

async fn run_fake(
    name: String,
    spec: FakeSpec,
    input: DuplexStream,
    output: DuplexStream,
    exit: Arc<watch::Sender<bool>>,
    log: Arc<Mutex<FakeLog>>,
) {
    let writer: SharedWriter = Arc::new(AsyncMutex::new(Some(output)));
    let mut frames = FrameReader::new(Box::new(input));
    let mut exit_rx = exit.subscribe();
    let mut eof = false;

    loop {
        let line = tokio::select! {
            frame = frames.next_frame(), if !eof => frame,
            _ = exited(&mut exit_rx) => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            _ if spec.ignore_eof => {
                eof = true;
                continue;
            }
            _ => break,
        };
        let message: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);

        match (method.as_deref(), id) {
            (Some("initialize"), Some(id)) => {
                if !spec.silent {
                    write_line(
                        &writer,
                        json!({"jsonrpc": "2.0", "id": id, "result": {
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": name, "version": "0.0.1"}
                        }}),
                    )
                    .await;
                }
            }
            (Some("notifications/initialized"), None) => {
                if spec.ping_on_init {
                    write_line(&writer, json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"})).await;
                }
            }
            (Some("tools/list"), Some(id)) => {
                let offset: usize = message["params"]["cursor"]
                    .as_str()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                let page = spec.page_size.unwrap_or(spec.tools.len().max(1));
                let tools: Vec<Value> = spec
                    .tools
                    .iter()
                    .skip(offset)
                    .take(page)
                    .map(|t| json!({"name": t, "description": format!("{} from {}", t, name), "inputSchema": {"type": "object"}}))
                    .collect();
                let mut result = json!({ "tools": tools });
                if offset + page < spec.tools.len() {
                    result["nextCursor"] = json!((offset + page).to_string());
                }
                write_line(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
            }
            (Some("tools/call"), Some(id)) => {
                let tool = message["params"]["name"].as_str().unwrap_or_default().to_string();
                let args = message["params"]["arguments"].clone();
                log.lock().unwrap().calls.push((name.clone(), tool.clone(), args.clone()));

                if !spec.tools.contains(&tool.as_str()) {
                    write_line(
                        &writer,
                        json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32602, "message": format!("no tool {}", tool)}}),
                    )
                    .await;
                    continue;
                }
                let delay = if spec.slow_tools.contains(&tool.as_str()) {
                    spec.slow_delay
                } else {
                    Duration::ZERO
                };
                let writer = writer.clone();
                let provider = name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_line(
                        &writer,
                        json!({"jsonrpc": "2.0", "id": id, "result": {
                            "content": [{"type": "text", "text": format!("{}:{}", provider, tool)}],
                            "echo": args
                        }}),
                    )
                    .await;
                });
            }
            (Some("notifications/cancelled"), None) => {
                let request_id = message["params"]["requestId"].clone();
                log.lock().unwrap().cancellations.push((name.clone(), request_id));
            }
            (None, Some(_)) => {
                // Response to our ping
                log.lock().unwrap().pongs.push(message);
            }
            _ => {}
        }
    }

    exit.send_replace(true);
    writer.lock().await.take();
}

/// Settings with timeouts small enough for tests.
pub fn fast_settings() -> GatewaySettings {
    let mut settings = GatewaySettings::default();
    settings.timeouts.handshake_ms = 300;
    settings.timeouts.call_ms = 2_000;
    settings.timeouts.local_call_ms = 2_000;
    settings.timeouts.shutdown_grace_ms = 100;
    settings.restart_policy.max_retries = 2;
    settings.restart_policy.initial_delay_ms = 20;
    settings.restart_policy.max_delay_ms = 50;
    settings
}

pub async fn wait_for_state(gateway: &Gateway, name: &str, state: ProviderState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = gateway
            .statuses()
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.state);
        if current == Some(state) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "provider {} stuck in {:?}, wanted {}",
            name,
            current,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Host side of a gateway session over in-memory streams.
pub struct TestClient {
    writer: DuplexStream,
    reader: FrameReader,
    next_id: i64,
    backlog: Vec<Value>,
}

impl TestClient {
    /// Start serving `gateway` and return a client connected to it.
    pub fn connect(gateway: Arc<Gateway>) -> (Self, tokio::task::JoinHandle<Result<()>>) {
        let (client_out, gateway_in) = duplex(256 * 1024);
        let (gateway_out, client_in) = duplex(256 * 1024);
        let serve = tokio::spawn(async move {
            gateway
                .serve(Box::new(gateway_in), Box::new(gateway_out))
                .await
        });
        let client = Self {
            writer: client_out,
            reader: FrameReader::new(Box::new(client_in)),
            next_id: 1,
            backlog: Vec::new(),
        };
        (client, serve)
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn send_request(&mut self, method: &str, params: Value) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string();
        self.send_raw(&line).await;
        id
    }

    /// End the host's input stream, as a client does when it exits.
    pub async fn close_input(&mut self) {
        self.writer.shutdown().await.unwrap();
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        let line = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
        self.send_raw(&line).await;
    }

    pub async fn next_message(&mut self) -> Value {
        if !self.backlog.is_empty() {
            return self.backlog.remove(0);
        }
        self.read_one().await
    }

    async fn read_one(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_frame())
            .await
            .expect("no message from gateway within 5s")
            .unwrap()
            .expect("gateway closed the stream");
        serde_json::from_str(&line).unwrap()
    }

    pub async fn response_for(&mut self, id: i64) -> Value {
        if let Some(pos) = self.backlog.iter().position(|m| m["id"] == json!(id)) {
            return self.backlog.remove(pos);
        }
        loop {
            let message = self.read_one().await;
            if message["id"] == json!(id) {
                return message;
            }
            self.backlog.push(message);
        }
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.send_request(method, params).await;
        self.response_for(id).await
    }

    pub async fn tool_names(&mut self) -> Vec<String> {
        let response = self.request("tools/list", json!({})).await;
        response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }

    /// Whether anything arrives within `wait`.
    pub async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        self.backlog.is_empty()
            && tokio::time::timeout(wait, self.reader.next_frame()).await.is_err()
    }

    pub async fn handshake(&mut self) {
        let response = self
            .request("initialize", json!({"protocolVersion": "2024-11-05", "capabilities": {}}))
            .await;
        assert!(response["result"]["capabilities"]["tools"]["listChanged"].as_bool().unwrap());
        self.notify("notifications/initialized", json!({})).await;
    }
}
