use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::command;
use crate::counter::{CounterStore, Observation, ResetPolicy};
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{Collector, CollectorEnv};

/// Collects per-interface traffic deltas
pub struct NetworkCollector {
    platform: Platform,
    timeout: Duration,
    exclude_interfaces: Vec<String>,
}

/// Cumulative byte counters for one interface
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceCounters {
    pub name: String,
    pub recv_bytes: u64,
    pub trans_bytes: u64,
}

impl NetworkCollector {
    pub fn new(env: &CollectorEnv) -> Self {
        Self {
            platform: env.platform,
            timeout: env.subprocess_timeout,
            exclude_interfaces: vec!["lo".into(), "lo0".into()],
        }
    }

    /// Bytes moved since the previous cycle, per interface.
    ///
    /// An interface seen for the first time only primes the store and is
    /// left out. A counter that went backwards (interface reset) reports its
    /// new raw value.
    pub fn traffic(&self, interfaces: &[InterfaceCounters], counters: &mut CounterStore) -> Map<String, Value> {
        let mut traffic = Map::new();
        let policy = ResetPolicy::ResyncToRaw;

        for iface in interfaces {
            if self.exclude_interfaces.iter().any(|e| e == &iface.name) { continue; }

            let recv = counters.observe(
                &format!("net.{}.recv_bytes", iface.name),
                iface.recv_bytes as f64,
                policy,
            );
            let trans = counters.observe(
                &format!("net.{}.trans_bytes", iface.name),
                iface.trans_bytes as f64,
                policy,
            );

            if let (Observation::Delta(rx), Observation::Delta(tx)) = (recv, trans) {
                traffic.insert(
                    iface.name.clone(),
                    json!({ "recv_bytes": rx as u64, "trans_bytes": tx as u64 }),
                );
            }
        }

        traffic
    }
}

/// Parse /proc/net/dev
pub fn parse_proc_net_dev(content: &str) -> Vec<InterfaceCounters> {
    let mut result = Vec::new();

    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else { continue };
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 16 { continue; }

        result.push(InterfaceCounters {
            name: name.trim().to_string(),
            recv_bytes: parts[0].parse().unwrap_or(0),
            trans_bytes: parts[8].parse().unwrap_or(0),
        });
    }

    result
}

/// Parse `netstat -ibn`, taking the link-level row of each interface
pub fn parse_netstat_ib(content: &str) -> Vec<InterfaceCounters> {
    let mut lines = content.lines();
    let Some(header) = lines.next() else { return Vec::new() };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let (Some(ibytes), Some(obytes)) = (
        columns.iter().position(|c| *c == "Ibytes"),
        columns.iter().position(|c| *c == "Obytes"),
    ) else {
        return Vec::new();
    };

    let mut result: Vec<InterfaceCounters> = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() <= ibytes.max(obytes) { continue; }
        // Only the <Link#N> row carries the full interface counters
        if !parts.get(2).map(|n| n.starts_with("<Link")).unwrap_or(false) { continue; }

        let name = parts[0].trim_end_matches('*').to_string();
        if result.iter().any(|r| r.name == name) { continue; }

        // Link rows without an address have one column fewer
        let shift = if parts.len() < columns.len() { 1 } else { 0 };
        let field = |i: usize| parts.get(i - shift).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        result.push(InterfaceCounters {
            name,
            recv_bytes: field(ibytes),
            trans_bytes: field(obytes),
        });
    }

    result
}

#[async_trait]
impl Collector for NetworkCollector {
    fn name(&self) -> &str { "network" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform != Platform::Other
    }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let interfaces = if self.platform == Platform::Linux {
            let content = tokio::fs::read_to_string("/proc/net/dev").await?;
            parse_proc_net_dev(&content)
        } else {
            let output = command::run("netstat", &["-ibn"], self.timeout).await?;
            parse_netstat_ib(&output)
        };

        let traffic = self.traffic(&interfaces, counters);
        if traffic.is_empty() {
            tracing::debug!("No primed interfaces yet");
            return Ok(CollectorResult::NoData);
        }

        let mut set = MetricSet::new();
        set.insert("networkTraffic".into(), Value::Object(traffic));
        Ok(CollectorResult::Data(set))
    }
}
