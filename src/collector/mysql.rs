use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::command;
use crate::config::MysqlConfig;
use crate::counter::{CounterStore, ResetPolicy};
use crate::types::{CollectorResult, MetricSet};
use super::{Collector, CollectorEnv};

/// Status counters reported as per-second rates: (status variable, payload key)
const RATE_VARS: [(&str, &str); 4] = [
    ("Connections", "mysqlConnections"),
    ("Created_tmp_disk_tables", "mysqlCreatedTmpDiskTables"),
    ("Slow_queries", "mysqlSlowQueries"),
    ("Table_locks_waited", "mysqlTableLocksWaited"),
];

/// Status gauges reported as-is
const GAUGE_VARS: [(&str, &str); 3] = [
    ("Max_used_connections", "mysqlMaxUsedConnections"),
    ("Open_files", "mysqlOpenFiles"),
    ("Threads_connected", "mysqlThreadsConnected"),
];

/// Reads `SHOW GLOBAL STATUS` through the mysql command-line client
pub struct MysqlCollector {
    config: MysqlConfig,
    interval_secs: f64,
    timeout: Duration,
}

impl MysqlCollector {
    pub fn new(config: &MysqlConfig, env: &CollectorEnv) -> Self {
        Self {
            config: config.clone(),
            interval_secs: env.interval_secs,
            timeout: env.subprocess_timeout,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--batch".to_string(),
            "--skip-column-names".to_string(),
            "-h".to_string(),
            self.config.server.clone(),
            "-u".to_string(),
            self.config.user.clone(),
        ];
        if let Some(port) = self.config.port {
            args.push("-P".into());
            args.push(port.to_string());
        }
        if let Some(ref socket) = self.config.socket {
            args.push("-S".into());
            args.push(socket.clone());
        }
        args.push("-e".into());
        args.push("SHOW GLOBAL STATUS".into());
        args
    }

    pub fn to_set(&self, status: &HashMap<String, f64>, counters: &mut CounterStore) -> MetricSet {
        let mut set = MetricSet::new();

        for (var, key) in RATE_VARS {
            if let Some(raw) = status.get(var) {
                let rate = counters.rate(key, *raw, self.interval_secs, ResetPolicy::ClampToZero);
                set.insert(key.to_string(), json!(rate));
            }
        }
        for (var, key) in GAUGE_VARS {
            if let Some(raw) = status.get(var) {
                set.insert(key.to_string(), json!(*raw as u64));
            }
        }

        set
    }
}

/// Parse tab-separated `Variable_name  Value` rows, keeping numeric values
pub fn parse_global_status(content: &str) -> HashMap<String, f64> {
    content
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once('\t')?;
            Some((name.trim().to_string(), value.trim().parse().ok()?))
        })
        .collect()
}

#[async_trait]
impl Collector for MysqlCollector {
    fn name(&self) -> &str { "mysql" }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let args = self.args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let envs = [("MYSQL_PWD", self.config.pass.as_str())];

        let output = match command::run_with_env(&self.config.binary, &args, &envs, self.timeout).await {
            Ok(out) => out.stdout,
            Err(e) => {
                tracing::debug!(server = %self.config.server, error = %e, "MySQL status query failed");
                return Ok(CollectorResult::NoData);
            }
        };

        let status = parse_global_status(&output);
        Ok(CollectorResult::from_set(self.to_set(&status, counters)))
    }
}
