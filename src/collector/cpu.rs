use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::command;
use crate::counter::{CounterStore, Observation, ResetPolicy};
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{round2, Collector, CollectorEnv};

/// Field names of the /proc/stat cpu lines, in column order
const STAT_FIELDS: [&str; 8] = ["user", "nice", "system", "idle", "iowait", "irq", "soft", "steal"];

/// Collects CPU time percentages: from /proc/stat deltas on Linux, from
/// `iostat -C` on the BSDs
pub struct CpuCollector {
    platform: Platform,
    timeout: Duration,
}

/// One `cpu`/`cpuN` line of /proc/stat
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTimes {
    pub label: String,
    pub ticks: Vec<u64>,
}

impl CpuCollector {
    pub fn new(env: &CollectorEnv) -> Self {
        Self { platform: env.platform, timeout: env.subprocess_timeout }
    }

    /// Percent of elapsed ticks spent in each state since the last cycle.
    ///
    /// Nothing is reported for a CPU until it has a baseline.
    pub fn percentages(times: &[CpuTimes], counters: &mut CounterStore) -> Map<String, Value> {
        let mut stats = Map::new();

        for cpu in times {
            let deltas: Vec<Option<f64>> = cpu
                .ticks
                .iter()
                .zip(STAT_FIELDS)
                .map(|(ticks, field)| {
                    counters
                        .observe(&format!("cpu.{}.{}", cpu.label, field), *ticks as f64, ResetPolicy::ClampToZero)
                        .delta()
                })
                .collect();

            if deltas.iter().any(Option::is_none) {
                continue;
            }
            let deltas: Vec<f64> = deltas.into_iter().flatten().collect();
            let total: f64 = deltas.iter().sum();
            if total <= 0.0 {
                continue;
            }

            let mut entry = Map::new();
            for (field, delta) in STAT_FIELDS.iter().zip(&deltas) {
                entry.insert((*field).to_string(), Value::from(round2(100.0 * delta / total)));
            }
            stats.insert(cpu.label.clone(), Value::Object(entry));
        }

        stats
    }

    async fn collect_iostat(&self) -> Result<Map<String, Value>> {
        // second sample covers the last second rather than time since boot
        let output = command::run("iostat", &["-C", "-c", "2", "-w", "1"], self.timeout).await?;
        Ok(parse_iostat_cpu(&output).unwrap_or_default())
    }
}

/// Parse the cpu lines of /proc/stat. The aggregate line is labelled `ALL`,
/// per-core lines `CPU0`, `CPU1`, ...
pub fn parse_proc_stat(content: &str) -> Vec<CpuTimes> {
    let mut result = Vec::new();

    for line in content.lines() {
        if !line.starts_with("cpu") { continue; }

        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { continue };
        let ticks: Vec<u64> = parts
            .take(STAT_FIELDS.len())
            .filter_map(|f| f.parse().ok())
            .collect();
        if ticks.len() < 7 { continue; }

        let mut ticks = ticks;
        ticks.resize(STAT_FIELDS.len(), 0);

        let label = match name.strip_prefix("cpu") {
            Some("") => "ALL".to_string(),
            Some(idx) => format!("CPU{}", idx),
            None => continue,
        };
        result.push(CpuTimes { label, ticks });
    }

    result
}

/// Parse the last sample of `iostat -C`, whose header names the cpu columns
/// (`us`, `ni`, `sy`, `in`, `id` depending on platform)
pub fn parse_iostat_cpu(content: &str) -> Option<Map<String, Value>> {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let header_idx = lines.iter().position(|l| {
        let cols: Vec<&str> = l.split_whitespace().collect();
        cols.contains(&"us") && cols.contains(&"id")
    })?;
    let header: Vec<&str> = lines[header_idx].split_whitespace().collect();
    let last: Vec<&str> = lines.last()?.split_whitespace().collect();
    if lines.len() - 1 == header_idx || last.len() != header.len() {
        return None;
    }

    let mut entry = Map::new();
    for (col, name) in [("us", "user"), ("ni", "nice"), ("sy", "system"), ("in", "irq"), ("id", "idle")] {
        if let Some(i) = header.iter().position(|h| *h == col) {
            if let Ok(v) = last[i].parse::<f64>() {
                entry.insert(name.to_string(), Value::from(v));
            }
        }
    }

    let mut stats = Map::new();
    stats.insert("ALL".into(), Value::Object(entry));
    Some(stats)
}

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &str { "cpu" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform != Platform::Other
    }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let stats = if self.platform == Platform::Linux {
            let content = tokio::fs::read_to_string("/proc/stat").await?;
            Self::percentages(&parse_proc_stat(&content), counters)
        } else {
            self.collect_iostat().await?
        };

        if stats.is_empty() {
            return Ok(CollectorResult::NoData);
        }

        let mut set = MetricSet::new();
        set.insert("cpuStats".into(), Value::Object(stats));
        Ok(CollectorResult::Data(set))
    }
}
