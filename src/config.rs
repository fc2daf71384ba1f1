use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::AgentError;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    /// Free-form `[plugins.<name>]` tables, handed to the matching plugin
    #[serde(default)]
    pub plugins: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub agent_key: String,
    pub sd_url: String,
    #[serde(default = "default_check_freq")]
    pub check_freq_secs: u64,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
    pub pid_file: Option<String>,
    pub plugin_directory: Option<String>,
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_secs: u64,
    #[serde(default = "default_collector_timeout")]
    pub collector_timeout_secs: u64,
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
    #[serde(default = "default_max_section_bytes")]
    pub max_section_bytes: usize,
}

impl AgentConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_freq_secs)
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Full URL the payload is posted to
    pub fn postback_url(&self) -> String {
        format!("{}/postback/", self.sd_url.trim_end_matches('/'))
    }
}

/// Optional third-party services. A missing section means the collector
/// is never registered.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServicesConfig {
    #[serde(default)]
    pub apache: Option<ApacheConfig>,
    #[serde(default)]
    pub nginx: Option<NginxConfig>,
    #[serde(default)]
    pub mysql: Option<MysqlConfig>,
    #[serde(default)]
    pub mongodb: Option<MongoConfig>,
    #[serde(default)]
    pub rabbitmq: Option<RabbitMqConfig>,
    #[serde(default)]
    pub couchdb: Option<CouchDbConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApacheConfig {
    pub status_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    pub status_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MysqlConfig {
    pub server: String,
    pub user: String,
    #[serde(default)]
    pub pass: String,
    pub port: Option<u16>,
    pub socket: Option<String>,
    #[serde(default = "default_mysql_bin")]
    pub binary: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MongoConfig {
    pub uri: String,
    #[serde(default = "default_mongo_bin")]
    pub binary: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RabbitMqConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CouchDbConfig {
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let agent = &self.agent;
        if agent.agent_key.trim().is_empty() {
            return Err(AgentError::config("agent.agent_key must not be empty"));
        }
        if !(agent.sd_url.starts_with("http://") || agent.sd_url.starts_with("https://")) {
            return Err(AgentError::config(format!(
                "agent.sd_url must be an http(s) URL, got `{}`",
                agent.sd_url
            )));
        }
        if agent.check_freq_secs == 0 {
            return Err(AgentError::config("agent.check_freq_secs must be greater than zero"));
        }
        if agent.subprocess_timeout_secs == 0 || agent.collector_timeout_secs == 0 {
            return Err(AgentError::config("timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Raw `[plugins.<name>]` table for a plugin, if present
    pub fn plugin_section(&self, name: &str) -> Option<&toml::Value> {
        self.plugins.get(name)
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_check_freq() -> u64 { 60 }
fn default_subprocess_timeout() -> u64 { 30 }
fn default_collector_timeout() -> u64 { 60 }
fn default_socket_timeout() -> u64 { 15 }
fn default_max_section_bytes() -> usize { 4 * 1024 * 1024 }
fn default_mysql_bin() -> String { "mysql".to_string() }
fn default_mongo_bin() -> String { "mongosh".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [agent]
        agent_key = "abc123"
        sd_url = "https://example.serverdensity.io/"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.agent.check_freq_secs, 60);
        assert_eq!(config.agent.socket_timeout_secs, 15);
        assert_eq!(config.agent.max_section_bytes, 4 * 1024 * 1024);
        assert!(config.services.mysql.is_none());
        assert!(config.plugins.is_empty());
        assert_eq!(
            config.agent.postback_url(),
            "https://example.serverdensity.io/postback/"
        );
    }

    #[test]
    fn empty_agent_key_is_rejected() {
        let text = r#"
            [agent]
            agent_key = "  "
            sd_url = "https://example.com"
        "#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("agent_key"));
    }

    #[test]
    fn non_http_url_is_rejected() {
        let text = r#"
            [agent]
            agent_key = "k"
            sd_url = "ftp://example.com"
        "#;
        assert!(Config::from_toml(text).is_err());
    }

    #[test]
    fn env_vars_are_expanded() {
        std::env::set_var("CHECK_AGENT_TEST_KEY", "from-env");
        let text = r#"
            [agent]
            agent_key = "${CHECK_AGENT_TEST_KEY}"
            sd_url = "https://example.com"
        "#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.agent.agent_key, "from-env");
    }

    #[test]
    fn service_and_plugin_sections_parse() {
        let text = r#"
            [agent]
            agent_key = "k"
            sd_url = "https://example.com"

            [services.mysql]
            server = "db.local"
            user = "monitor"
            pass = "secret"

            [services.nginx]
            status_url = "http://localhost/nginx_status"

            [plugins.Redis]
            port = 6379
        "#;
        let config = Config::from_toml(text).unwrap();
        let mysql = config.services.mysql.as_ref().unwrap();
        assert_eq!(mysql.binary, "mysql");
        assert!(mysql.port.is_none());
        assert!(config.services.nginx.is_some());
        assert!(config.services.apache.is_none());
        let section = config.plugin_section("Redis").unwrap();
        assert_eq!(section.get("port").and_then(|v| v.as_integer()), Some(6379));
    }
}
