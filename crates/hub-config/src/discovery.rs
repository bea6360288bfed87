//! Provider discovery across client, application and project config files.
//!
//! Every file uses the common `mcpServers` layout understood by desktop MCP
//! clients. Sources are read in precedence order and later sources replace
//! earlier definitions with the same name. Problems are collected as
//! diagnostics instead of aborting discovery.

use hub_core::HubError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::GatewaySettings;

static NON_ALNUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("Invalid regex pattern"));

/// Where a provider file sits in the precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ClientGlobal,
    ApplicationGlobal,
    ProjectLocal,
    Explicit,
}

#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub kind: SourceKind,
    pub path: PathBuf,
}

impl ConfigSource {
    pub fn new(kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self { kind, path: path.into() }
    }
}

/// How to launch a remote provider process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Passed to the child untouched
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// A remote provider ready to hand to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDefinition {
    pub name: String,
    pub prefix: String,
    pub launch: LaunchSpec,
    /// Per-provider call timeout overriding the gateway default
    pub call_timeout: Option<Duration>,
    pub source: SourceKind,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandField {
    Line(String),
    Argv(Vec<String>),
}

/// One entry under `mcpServers`.
#[derive(Debug, Deserialize)]
struct ProviderEntry {
    command: Option<CommandField>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    url: Option<String>,
    #[serde(default)]
    disabled: bool,
    /// Call timeout in milliseconds
    timeout: Option<u64>,
    prefix: Option<String>,
}

/// Outcome of a discovery pass.
#[derive(Debug, Default)]
pub struct Discovery {
    pub providers: Vec<ProviderDefinition>,
    pub diagnostics: Vec<HubError>,
}

pub struct ConfigDiscovery {
    sources: Vec<ConfigSource>,
    exclude: Vec<String>,
}

impl ConfigDiscovery {
    pub fn new(sources: Vec<ConfigSource>) -> Self {
        Self { sources, exclude: Vec::new() }
    }

    pub fn with_exclude(mut self, names: Vec<String>) -> Self {
        self.exclude = names;
        self
    }

    /// Standard candidate locations, lowest precedence first.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        let home = &settings.paths.home_dir;
        let app_dir = home.join(".mcp-hub");

        let mut sources = vec![
            ConfigSource::new(SourceKind::ClientGlobal, home.join(".cursor").join("mcp.json")),
            ConfigSource::new(SourceKind::ApplicationGlobal, app_dir.join("providers.json")),
            ConfigSource::new(SourceKind::ApplicationGlobal, app_dir.join("providers.yaml")),
            ConfigSource::new(SourceKind::ApplicationGlobal, app_dir.join("providers.yml")),
            ConfigSource::new(
                SourceKind::ProjectLocal,
                settings.paths.workspace_dir.join("mcp-hub.local.json"),
            ),
        ];
        for path in &settings.provider_files {
            sources.push(ConfigSource::new(SourceKind::Explicit, path.clone()));
        }

        Self::new(sources).with_exclude(settings.excluded_names())
    }

    pub fn discover(&self) -> Discovery {
        let mut discovery = Discovery::default();

        for source in &self.sources {
            if !source.path.exists() {
                debug!("Provider config not present: {}", source.path.display());
                continue;
            }

            let document = match read_document(&source.path) {
                Ok(document) => document,
                Err(e) => {
                    warn!("Skipping provider config {}: {}", source.path.display(), e);
                    discovery.diagnostics.push(e);
                    continue;
                }
            };

            let found = self.apply_document(source, &document, &mut discovery);
            info!(
                "Loaded {} provider definitions from {} ({:?})",
                found,
                source.path.display(),
                source.kind
            );
        }

        discovery
    }

    /// Merge one parsed file into `discovery`. Returns how many entries it
    /// contributed.
    fn apply_document(
        &self,
        source: &ConfigSource,
        document: &Value,
        discovery: &mut Discovery,
    ) -> usize {
        let source_name = source.path.display().to_string();

        let servers = match document.get("mcpServers") {
            None | Some(Value::Null) => return 0,
            Some(Value::Object(servers)) => servers,
            Some(_) => {
                discovery.diagnostics.push(HubError::ConfigParse {
                    source_name,
                    message: "'mcpServers' must be a mapping".to_string(),
                });
                return 0;
            }
        };

        let mut count = 0;
        for (name, raw) in servers {
            if self.exclude.iter().any(|excluded| excluded == name) {
                debug!("Skipping excluded provider '{}'", name);
                continue;
            }

            match parse_entry(name, raw.clone(), source.kind) {
                Ok(Some(definition)) => {
                    upsert(&mut discovery.providers, definition);
                    count += 1;
                }
                Ok(None) => {
                    let before = discovery.providers.len();
                    discovery.providers.retain(|p| &p.name != name);
                    if discovery.providers.len() < before {
                        info!("Provider '{}' disabled by {:?} override", name, source.kind);
                    } else {
                        debug!("Provider '{}' is disabled", name);
                    }
                }
                Err(message) => {
                    warn!("Skipping provider '{}' in {}: {}", name, source_name, message);
                    discovery.diagnostics.push(HubError::ConfigParse {
                        source_name: format!("{}#{}", source_name, name),
                        message,
                    });
                }
            }
        }
        count
    }
}

fn read_document(path: &Path) -> Result<Value, HubError> {
    let source_name = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| HubError::ConfigParse {
        source_name: source_name.clone(),
        message: format!("Failed to read file: {}", e),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed = if is_yaml {
        serde_yaml::from_str::<Value>(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<Value>(&content).map_err(|e| e.to_string())
    };

    parsed.map_err(|message| HubError::ConfigParse { source_name, message })
}

/// `Ok(None)` means the entry is valid but disabled.
fn parse_entry(
    name: &str,
    raw: Value,
    source: SourceKind,
) -> Result<Option<ProviderDefinition>, String> {
    let entry: ProviderEntry =
        serde_json::from_value(raw).map_err(|e| format!("invalid entry: {}", e))?;

    if entry.disabled {
        return Ok(None);
    }

    let (command, args) = match entry.command {
        Some(CommandField::Line(line)) => {
            if line.trim().contains(char::is_whitespace) && entry.args.is_empty() {
                let mut parts = line.split_whitespace().map(str::to_string);
                let command = parts.next().unwrap_or_default();
                (command, parts.collect())
            } else {
                (line.trim().to_string(), entry.args)
            }
        }
        Some(CommandField::Argv(mut argv)) => {
            if argv.is_empty() {
                return Err("'command' list is empty".to_string());
            }
            let command = argv.remove(0);
            argv.extend(entry.args);
            (command, argv)
        }
        None if entry.url.is_some() => {
            return Err("URL-based providers are not supported; a 'command' is required".into());
        }
        None => return Err("missing 'command'".to_string()),
    };

    if command.is_empty() {
        return Err("'command' is empty".to_string());
    }

    let prefix = match entry.prefix {
        Some(prefix) => slugify(&prefix),
        None => slugify(name),
    };
    if prefix.is_empty() {
        return Err(format!("cannot derive a namespace prefix from '{}'", name));
    }

    Ok(Some(ProviderDefinition {
        name: name.to_string(),
        prefix,
        launch: LaunchSpec {
            command,
            args,
            env: entry.env,
            cwd: entry.cwd,
        },
        call_timeout: entry.timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
        source,
    }))
}

/// Later definitions replace earlier ones but keep their original position.
fn upsert(providers: &mut Vec<ProviderDefinition>, definition: ProviderDefinition) {
    match providers.iter_mut().find(|p| p.name == definition.name) {
        Some(existing) => {
            debug!(
                "Provider '{}' from {:?} overrides {:?}",
                definition.name, definition.source, existing.source
            );
            *existing = definition;
        }
        None => providers.push(definition),
    }
}

/// Namespace prefix derived from a provider name: `AWS-Docs` -> `aws_docs`.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    NON_ALNUM
        .replace_all(&lowered, "_")
        .trim_matches('_')
        .to_string()
}
