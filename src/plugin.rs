//! User plugins discovered from a directory.
//!
//! Plugin code cannot be loaded from source at runtime, so a file in the
//! plugin directory is resolved one of two ways:
//!
//! * its stem names a [`PluginFactory`] compiled into the agent
//!   (e.g. `TcpCheck.plugin` activates the built-in `TcpCheck`), or
//! * it is an executable, run once per cycle. Its stdout must be a JSON
//!   object; empty output, `false` or `null` means "no data".
//!
//! Either way the plugin is constructed once, on the first cycle, and cached
//! for the life of the process. Its `[plugins.<name>]` config table is
//! handed over at construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::collector::guarded;
use crate::command;
use crate::config::Config;
use crate::error::AgentError;
use crate::types::{CollectorResult, MetricSet};

/// Environment variable carrying an executable plugin's config table as JSON
pub const PLUGIN_CONFIG_ENV: &str = "CHECK_AGENT_PLUGIN_CONFIG";

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// One poll; same contract as a collector
    async fn run(&mut self) -> Result<CollectorResult>;
}

/// What a plugin is given at construction
#[derive(Debug, Clone)]
pub struct PluginContext<'a> {
    pub name: &'a str,
    pub path: &'a Path,
    pub config: &'a Config,
    /// The `[plugins.<name>]` table, if any
    pub raw_config: Option<&'a toml::Value>,
    pub timeout: Duration,
}

pub type PluginFactory = fn(&PluginContext<'_>) -> Result<Box<dyn Plugin>>;

/// Discovers plugins once and runs every cached instance each cycle
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
    plugins: Vec<Box<dyn Plugin>>,
    discovered: bool,
    timeout: Duration,
}

impl PluginRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            factories: BTreeMap::new(),
            plugins: Vec::new(),
            discovered: false,
            timeout,
        }
    }

    /// Registry with the plugins compiled into the agent
    pub fn with_builtins(timeout: Duration) -> Self {
        let mut registry = Self::new(timeout);
        registry.register_factory("TcpCheck", TcpCheckPlugin::create);
        registry
    }

    pub fn register_factory(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Add an already-built plugin
    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Scan `dir` once. Files that fail to load are logged and skipped;
    /// calls after the first do nothing. Returns the number of plugins loaded
    /// by this call.
    pub fn discover(&mut self, dir: &Path, config: &Config) -> usize {
        if self.discovered {
            return 0;
        }
        self.discovered = true;

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot read plugin directory");
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                !p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(true)
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            // results are keyed by name, so the first file with a given stem wins
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if self.plugins.iter().any(|p| p.name() == stem) {
                    tracing::warn!(plugin = stem, path = %path.display(), "Duplicate plugin name, skipping");
                    continue;
                }
            }

            match self.load(&path, config) {
                Ok(plugin) => {
                    tracing::info!(plugin = plugin.name(), path = %path.display(), "Loaded plugin");
                    self.plugins.push(plugin);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to load plugin");
                }
            }
        }

        tracing::info!(count = loaded, dir = %dir.display(), "Plugin discovery finished");
        loaded
    }

    fn load(&self, path: &Path, config: &Config) -> Result<Box<dyn Plugin>, AgentError> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| AgentError::PluginLoad {
                path: path.to_path_buf(),
                details: "file name is not valid UTF-8".into(),
            })?;

        let ctx = PluginContext {
            name,
            path,
            config,
            raw_config: config.plugin_section(name),
            timeout: self.timeout,
        };

        if let Some(factory) = self.factories.get(name) {
            return factory(&ctx).map_err(|e| AgentError::PluginLoad {
                path: path.to_path_buf(),
                details: format!("{:#}", e),
            });
        }

        if !is_executable(path) {
            return Err(AgentError::PluginLoad {
                path: path.to_path_buf(),
                details: "not executable and no built-in plugin has this name".into(),
            });
        }

        ExecPlugin::create(&ctx).map_err(|e| AgentError::PluginLoad {
            path: path.to_path_buf(),
            details: format!("{:#}", e),
        })
    }

    /// Run every cached plugin. A plugin that errors, panics, times out or
    /// has nothing to report is simply missing from the result.
    pub async fn run_all(&mut self) -> MetricSet {
        let mut results = MetricSet::new();

        for plugin in self.plugins.iter_mut() {
            let name = plugin.name().to_string();
            match guarded(&name, self.timeout, plugin.run()).await {
                Ok(CollectorResult::Data(set)) => {
                    results.insert(name, Value::Object(set));
                }
                Ok(CollectorResult::NoData) => {
                    tracing::debug!(plugin = %name, "Plugin returned no data");
                }
                Err(e) => {
                    tracing::error!(plugin = %name, error = %format!("{:#}", e), "Plugin failed");
                }
            }
        }

        results
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension().map(|e| e == "exe").unwrap_or(false)
}

/// Runs an external program and reads a JSON object from its stdout
pub struct ExecPlugin {
    name: String,
    path: PathBuf,
    config_json: String,
    timeout: Duration,
}

impl ExecPlugin {
    pub fn create(ctx: &PluginContext<'_>) -> Result<Box<dyn Plugin>> {
        let config_json = match ctx.raw_config {
            Some(raw) => serde_json::to_string(raw)?,
            None => "{}".to_string(),
        };
        Ok(Box::new(Self {
            name: ctx.name.to_string(),
            path: ctx.path.to_path_buf(),
            config_json,
            timeout: ctx.timeout,
        }))
    }
}

/// Interpret an executable plugin's stdout
pub fn parse_plugin_output(name: &str, stdout: &str) -> Result<CollectorResult, AgentError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(CollectorResult::NoData);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(CollectorResult::from_set(map)),
        Ok(Value::Null) | Ok(Value::Bool(false)) => Ok(CollectorResult::NoData),
        Ok(other) => Err(AgentError::PluginOutput {
            name: name.to_string(),
            details: format!("expected a JSON object, got {}", other),
        }),
        Err(e) => Err(AgentError::PluginOutput { name: name.to_string(), details: e.to_string() }),
    }
}

#[async_trait]
impl Plugin for ExecPlugin {
    fn name(&self) -> &str { &self.name }

    async fn run(&mut self) -> Result<CollectorResult> {
        let program = self.path.to_string_lossy().into_owned();
        let out = command::run_with_env(
            &program,
            &[],
            &[(PLUGIN_CONFIG_ENV, self.config_json.as_str())],
            self.timeout,
        )
        .await?;
        Ok(parse_plugin_output(&self.name, &out.stdout)?)
    }
}

#[derive(Debug, Deserialize)]
struct TcpCheckConfig {
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 { 3000 }

/// Built-in plugin: TCP connect check against a list of `host:port` targets
pub struct TcpCheckPlugin {
    targets: Vec<String>,
    connect_timeout: Duration,
}

impl TcpCheckPlugin {
    pub fn create(ctx: &PluginContext<'_>) -> Result<Box<dyn Plugin>> {
        let config: TcpCheckConfig = match ctx.raw_config {
            Some(raw) => raw.clone().try_into()?,
            None => anyhow::bail!("TcpCheck needs a [plugins.TcpCheck] section with targets"),
        };
        if config.targets.is_empty() {
            anyhow::bail!("TcpCheck has no targets");
        }
        Ok(Box::new(Self {
            targets: config.targets,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }))
    }
}

#[async_trait]
impl Plugin for TcpCheckPlugin {
    fn name(&self) -> &str { "TcpCheck" }

    async fn run(&mut self) -> Result<CollectorResult> {
        let mut set = Map::new();
        for target in &self.targets {
            let start = Instant::now();
            let connect = tokio::net::TcpStream::connect(target.as_str());
            let entry = match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_)) => json!({ "up": true, "latencyMs": start.elapsed().as_millis() as u64 }),
                Ok(Err(e)) => json!({ "up": false, "error": e.to_string() }),
                Err(_) => json!({ "up": false, "error": "timeout" }),
            };
            set.insert(target.clone(), entry);
        }
        Ok(CollectorResult::from_set(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_parsing() {
        assert_eq!(parse_plugin_output("p", "").unwrap(), CollectorResult::NoData);
        assert_eq!(parse_plugin_output("p", "false\n").unwrap(), CollectorResult::NoData);
        assert_eq!(parse_plugin_output("p", "null").unwrap(), CollectorResult::NoData);
        assert_eq!(parse_plugin_output("p", "{}").unwrap(), CollectorResult::NoData);

        let data = parse_plugin_output("p", "{\"hits\": 3}").unwrap();
        assert_eq!(data.into_set().unwrap()["hits"], json!(3));

        assert!(parse_plugin_output("p", "[1,2]").is_err());
        assert!(parse_plugin_output("p", "not json").is_err());
    }

    struct Fixed(&'static str, Option<i64>);

    #[async_trait]
    impl Plugin for Fixed {
        fn name(&self) -> &str { self.0 }

        async fn run(&mut self) -> Result<CollectorResult> {
            match self.1 {
                Some(v) => {
                    let mut set = Map::new();
                    set.insert("value".into(), json!(v));
                    Ok(CollectorResult::Data(set))
                }
                None => anyhow::bail!("boom"),
            }
        }
    }

    #[tokio::test]
    async fn failing_plugin_only_loses_its_own_key() {
        let mut registry = PluginRegistry::new(Duration::from_secs(5));
        registry.add(Box::new(Fixed("Alpha", Some(1))));
        registry.add(Box::new(Fixed("Broken", None)));
        registry.add(Box::new(Fixed("Gamma", Some(3))));

        let results = registry.run_all().await;
        let keys: Vec<&String> = results.keys().collect();
        assert_eq!(keys, vec!["Alpha", "Gamma"]);
        assert_eq!(results["Gamma"]["value"], json!(3));
    }

    #[cfg(unix)]
    #[test]
    fn same_stem_loads_once() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        for file in ["Foo", "Foo.sh", "Bar.sh"] {
            let path = dir.path().join(file);
            std::fs::write(&path, "#!/bin/sh\necho '{}'\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let config = Config::from_toml("[agent]\nagent_key = \"k\"\nsd_url = \"https://example.com\"\n").unwrap();

        let mut registry = PluginRegistry::new(Duration::from_secs(5));
        assert_eq!(registry.discover(dir.path(), &config), 2);
        assert_eq!(registry.plugin_names(), vec!["Bar", "Foo"]);
        assert_eq!(registry.discover(dir.path(), &config), 0);
    }

    #[tokio::test]
    async fn tcp_check_reports_open_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let mut plugin = TcpCheckPlugin {
            targets: vec![open.clone()],
            connect_timeout: Duration::from_secs(2),
        };
        let set = plugin.run().await.unwrap().into_set().unwrap();
        assert_eq!(set[&open]["up"], json!(true));
    }
}
