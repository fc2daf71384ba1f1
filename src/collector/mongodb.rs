use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::command;
use crate::config::MongoConfig;
use crate::counter::{CounterStore, ResetPolicy};
use crate::types::{CollectorResult, MetricSet};
use super::{Collector, CollectorEnv};

/// Environment variable the shell script reads the connection URI from
const URI_ENV: &str = "CHECK_AGENT_MONGO_URI";
const SERVER_STATUS_EVAL: &str =
    "EJSON.stringify(connect(process.env.CHECK_AGENT_MONGO_URI).serverStatus(), {relaxed: true})";
const OPCOUNTERS: [&str; 6] = ["insert", "query", "update", "delete", "getmore", "command"];

/// Reads `serverStatus` through the mongo shell
pub struct MongoCollector {
    config: MongoConfig,
    interval_secs: f64,
    timeout: Duration,
}

impl MongoCollector {
    pub fn new(config: &MongoConfig, env: &CollectorEnv) -> Self {
        Self {
            config: config.clone(),
            interval_secs: env.interval_secs,
            timeout: env.subprocess_timeout,
        }
    }

    /// Shell arguments. The URI may carry credentials, so it travels in
    /// the environment rather than on the command line.
    fn args() -> [&'static str; 4] {
        ["--nodb", "--quiet", "--eval", SERVER_STATUS_EVAL]
    }

    /// Reduce a serverStatus document to the `mongoDB` payload section
    pub fn summarize(&self, status: &Value, counters: &mut CounterStore) -> Option<Value> {
        let mut section = Map::new();

        if let Some(version) = status.get("version").and_then(Value::as_str) {
            section.insert("version".into(), json!(version));
        }
        if let Some(uptime) = status.get("uptime").and_then(Value::as_f64) {
            section.insert("uptime".into(), json!(uptime));
        }
        if let Some(conns) = status.get("connections") {
            section.insert(
                "connections".into(),
                json!({
                    "current": conns.get("current").and_then(Value::as_u64),
                    "available": conns.get("available").and_then(Value::as_u64),
                }),
            );
        }
        if let Some(ops) = status.get("opcounters") {
            let mut rates = Map::new();
            for op in OPCOUNTERS {
                if let Some(raw) = ops.get(op).and_then(Value::as_f64) {
                    let rate = counters.rate(
                        &format!("mongo.opcounters.{}", op),
                        raw,
                        self.interval_secs,
                        ResetPolicy::ClampToZero,
                    );
                    rates.insert(format!("{}PS", op), json!(rate));
                }
            }
            section.insert("opcounters".into(), Value::Object(rates));
        }
        if let Some(mem) = status.get("mem") {
            section.insert(
                "mem".into(),
                json!({
                    "resident": mem.get("resident").and_then(Value::as_u64),
                    "virtual": mem.get("virtual").and_then(Value::as_u64),
                }),
            );
        }

        if section.is_empty() {
            None
        } else {
            Some(Value::Object(section))
        }
    }
}

#[async_trait]
impl Collector for MongoCollector {
    fn name(&self) -> &str { "mongodb" }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let args = Self::args();
        let envs = [(URI_ENV, self.config.uri.as_str())];
        let output = match command::run_with_env(&self.config.binary, &args, &envs, self.timeout).await {
            Ok(out) => out.stdout,
            Err(e) => {
                tracing::debug!(error = %e, "MongoDB serverStatus failed");
                return Ok(CollectorResult::NoData);
            }
        };

        let status: Value = match serde_json::from_str(output.trim()) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "MongoDB serverStatus was not JSON");
                return Ok(CollectorResult::NoData);
            }
        };

        let mut set = MetricSet::new();
        if let Some(section) = self.summarize(&status, counters) {
            set.insert("mongoDB".into(), section);
        }
        Ok(CollectorResult::from_set(set))
    }
}
