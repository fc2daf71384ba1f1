use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::command;
use crate::counter::CounterStore;
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{Collector, CollectorEnv};

/// Number of whitespace-separated columns in `ps aux`; the last one (the
/// command line) may itself contain spaces
const PS_COLUMNS: usize = 11;

/// Collects the process table from `ps auxww`
pub struct ProcessCollector {
    timeout: Duration,
}

impl ProcessCollector {
    pub fn new(env: &CollectorEnv) -> Self {
        Self { timeout: env.subprocess_timeout }
    }
}

/// Split `ps auxww` output into rows of 11 columns, header removed
pub fn parse_ps(content: &str) -> Vec<Vec<String>> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut row: Vec<String> = Vec::with_capacity(PS_COLUMNS);
            let mut rest = line.trim_start();
            for _ in 0..PS_COLUMNS - 1 {
                let end = rest.find(char::is_whitespace)?;
                row.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            if rest.is_empty() {
                return None;
            }
            row.push(rest.trim_end().to_string());
            Some(row)
        })
        .collect()
}

#[async_trait]
impl Collector for ProcessCollector {
    fn name(&self) -> &str { "processes" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform != Platform::Other
    }

    async fn collect(&mut self, _counters: &mut CounterStore) -> Result<CollectorResult> {
        let output = command::run("ps", &["auxww"], self.timeout).await?;
        let rows = parse_ps(&output);
        if rows.is_empty() {
            return Ok(CollectorResult::NoData);
        }

        tracing::trace!(count = rows.len(), "Collected process table");
        let mut set = MetricSet::new();
        set.insert(
            "processes".into(),
            Value::Array(rows.into_iter().map(|r| json!(r)).collect()),
        );
        Ok(CollectorResult::Data(set))
    }
}
