use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::command;
use crate::counter::CounterStore;
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{Collector, CollectorEnv};

/// Collects filesystem usage from `df -k`
pub struct DiskCollector {
    timeout: Duration,
}

impl DiskCollector {
    pub fn new(env: &CollectorEnv) -> Self {
        Self { timeout: env.subprocess_timeout }
    }
}

/// Parse `df -k` output into `[filesystem, blocks, used, available, capacity, mount]` rows.
///
/// Long device names make `df` wrap a row onto two lines; those are joined
/// back together.
pub fn parse_df(content: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut pending: Option<String> = None;

    for line in content.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let joined = match pending.take() {
            Some(prefix) => format!("{} {}", prefix, line),
            None => line.to_string(),
        };

        let fields: Vec<&str> = joined.split_whitespace().collect();
        if fields.len() == 1 {
            pending = Some(joined);
            continue;
        }
        if fields.len() < 6 {
            continue;
        }

        // macOS adds iused/ifree/%iused columns before the mount point
        let mount = fields[fields.len() - 1];
        let mut row: Vec<String> = fields[..5].iter().map(|s| s.to_string()).collect();
        if !row[1].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        row.push(mount.to_string());
        rows.push(row);
    }

    rows
}

#[async_trait]
impl Collector for DiskCollector {
    fn name(&self) -> &str { "disk" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform != Platform::Other
    }

    async fn collect(&mut self, _counters: &mut CounterStore) -> Result<CollectorResult> {
        let output = match command::run("df", &["-k"], self.timeout).await {
            Ok(out) => out,
            Err(e) if e.is_missing_binary() => {
                tracing::debug!("df not available");
                return Ok(CollectorResult::NoData);
            }
            Err(e) => return Err(e.into()),
        };

        let rows = parse_df(&output);
        if rows.is_empty() {
            return Ok(CollectorResult::NoData);
        }

        let mut set = MetricSet::new();
        set.insert("diskUsage".into(), Value::Array(rows.into_iter().map(|r| json!(r)).collect()));
        Ok(CollectorResult::Data(set))
    }
}
