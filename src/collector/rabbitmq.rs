use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::RabbitMqConfig;
use crate::counter::CounterStore;
use crate::types::{CollectorResult, MetricSet};
use super::{fetch_text, Collector, CollectorEnv};

/// Polls the RabbitMQ management API
pub struct RabbitMqCollector {
    base_url: String,
    user: String,
    pass: String,
    http: reqwest::Client,
}

impl RabbitMqCollector {
    pub fn new(config: &RabbitMqConfig, env: &CollectorEnv) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            http: env.http.clone(),
        }
    }

    async fn get_json(&self, path: &str) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);
        let body = fetch_text(&self.http, &url, Some((self.user.as_str(), Some(self.pass.as_str())))).await?;
        match serde_json::from_str(&body) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "RabbitMQ response was not JSON");
                None
            }
        }
    }
}

/// Build the `rabbitMQ` section from `/api/overview` and `/api/nodes`
pub fn summarize(overview: &Value, nodes: Option<&Value>) -> Value {
    let mut section = Map::new();

    if let Some(totals) = overview.get("queue_totals") {
        section.insert(
            "queue_totals".into(),
            json!({
                "messages": totals.get("messages").and_then(Value::as_u64).unwrap_or(0),
                "messages_ready": totals.get("messages_ready").and_then(Value::as_u64).unwrap_or(0),
                "messages_unacknowledged": totals
                    .get("messages_unacknowledged")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }),
        );
    }
    if let Some(totals) = overview.get("object_totals") {
        section.insert("object_totals".into(), totals.clone());
    }
    if let Some(version) = overview.get("rabbitmq_version") {
        section.insert("version".into(), version.clone());
    }

    if let Some(Value::Array(nodes)) = nodes {
        let summary: Vec<Value> = nodes
            .iter()
            .map(|n| {
                json!({
                    "name": n.get("name"),
                    "running": n.get("running"),
                    "mem_used": n.get("mem_used"),
                    "fd_used": n.get("fd_used"),
                    "sockets_used": n.get("sockets_used"),
                    "proc_used": n.get("proc_used"),
                })
            })
            .collect();
        section.insert("nodes".into(), Value::Array(summary));
    }

    Value::Object(section)
}

#[async_trait]
impl Collector for RabbitMqCollector {
    fn name(&self) -> &str { "rabbitmq" }

    async fn collect(&mut self, _counters: &mut CounterStore) -> Result<CollectorResult> {
        let Some(overview) = self.get_json("/api/overview").await else {
            return Ok(CollectorResult::NoData);
        };
        let nodes = self.get_json("/api/nodes").await;

        let mut set = MetricSet::new();
        set.insert("rabbitMQ".into(), summarize(&overview, nodes.as_ref()));
        Ok(CollectorResult::Data(set))
    }
}
