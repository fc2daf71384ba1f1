pub mod cpu;
pub mod disk;
pub mod io;
pub mod load;
pub mod memory;
pub mod network;
pub mod process;

pub mod apache;
pub mod couchdb;
pub mod mongodb;
pub mod mysql;
pub mod nginx;
pub mod rabbitmq;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::counter::CounterStore;
use crate::error::AgentError;
use crate::types::{CollectorResult, Platform};

/// Trait for all metric collectors.
///
/// A collector is polled once per cycle and either returns the payload keys
/// it is responsible for or `CollectorResult::NoData`. Expected failures
/// (service down, tool missing) should come back as `NoData`; anything
/// returned as `Err` is logged by the orchestrator and also treated as
/// absent data.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable name for this collector (e.g., "cpu", "mysql")
    fn name(&self) -> &str;

    /// Whether this collector attempts any work on `platform`
    fn is_supported(&self, _platform: Platform) -> bool {
        true
    }

    /// Collect metrics for one cycle. Rates are derived through `counters`.
    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult>;
}

/// Settings shared by every collector, bound at construction
#[derive(Debug, Clone)]
pub struct CollectorEnv {
    pub platform: Platform,
    pub interval_secs: f64,
    pub subprocess_timeout: Duration,
    pub http: reqwest::Client,
}

impl CollectorEnv {
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.agent.socket_timeout())
            .user_agent(concat!("check-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            platform: Platform::current(),
            interval_secs: config.agent.check_freq_secs as f64,
            subprocess_timeout: config.agent.subprocess_timeout(),
            http,
        })
    }
}

/// Create the built-in collectors in their fixed polling order.
///
/// OS collectors are always present; a service collector is only created
/// when its config section exists.
pub fn create_collectors(config: &Config, env: &CollectorEnv) -> Result<Vec<Box<dyn Collector>>> {
    let mut collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(disk::DiskCollector::new(env)),
        Box::new(io::IoCollector::new(env)),
        Box::new(load::LoadCollector::new(env)?),
        Box::new(memory::MemoryCollector::new(env)),
        Box::new(network::NetworkCollector::new(env)),
        Box::new(process::ProcessCollector::new(env)),
        Box::new(cpu::CpuCollector::new(env)),
    ];

    let services = &config.services;

    if let Some(ref c) = services.apache {
        collectors.push(Box::new(apache::ApacheCollector::new(c, env)));
    } else {
        tracing::debug!("Apache status not configured");
    }

    if let Some(ref c) = services.nginx {
        collectors.push(Box::new(nginx::NginxCollector::new(c, env)));
    } else {
        tracing::debug!("Nginx status not configured");
    }

    if let Some(ref c) = services.mysql {
        collectors.push(Box::new(mysql::MysqlCollector::new(c, env)));
    } else {
        tracing::debug!("MySQL not configured");
    }

    if let Some(ref c) = services.mongodb {
        collectors.push(Box::new(mongodb::MongoCollector::new(c, env)));
    } else {
        tracing::debug!("MongoDB not configured");
    }

    if let Some(ref c) = services.rabbitmq {
        collectors.push(Box::new(rabbitmq::RabbitMqCollector::new(c, env)));
    } else {
        tracing::debug!("RabbitMQ not configured");
    }

    if let Some(ref c) = services.couchdb {
        collectors.push(Box::new(couchdb::CouchDbCollector::new(c, env)));
    } else {
        tracing::debug!("CouchDB not configured");
    }

    tracing::info!(count = collectors.len(), "Initialized collectors");
    Ok(collectors)
}

/// Await one collector or plugin run, turning a timeout or a panic into an
/// error so a single misbehaving unit cannot take the cycle down
pub async fn guarded<F>(name: &str, timeout: Duration, fut: F) -> Result<CollectorResult>
where
    F: std::future::Future<Output = Result<CollectorResult>> + Send,
{
    use futures_util::FutureExt;

    let caught = std::panic::AssertUnwindSafe(fut).catch_unwind();
    match tokio::time::timeout(timeout, caught).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("{} panicked: {}", name, msg))
        }
        Err(_) => Err(AgentError::CollectorTimeout { name: name.to_string(), timeout }.into()),
    }
}

/// Round to two decimals, the precision the payload reports percentages in
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fetch a URL and return the body, or `None` for any HTTP/transport failure
pub(crate) async fn fetch_text(
    http: &reqwest::Client,
    url: &str,
    auth: Option<(&str, Option<&str>)>,
) -> Option<String> {
    let mut req = http.get(url);
    if let Some((user, pass)) = auth {
        req = req.basic_auth(user, pass);
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(url, error = %e, "Status request failed");
            return None;
        }
    };

    if !resp.status().is_success() {
        tracing::debug!(url, status = resp.status().as_u16(), "Status request rejected");
        return None;
    }

    match resp.text().await {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::debug!(url, error = %e, "Failed to read status body");
            None
        }
    }
}
