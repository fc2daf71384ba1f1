use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::counter::{CounterStore, ResetPolicy};
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{round2, Collector, CollectorEnv};

/// Collects per-device I/O rates from /proc/diskstats
pub struct IoCollector {
    interval_secs: f64,
}

/// Cumulative counters for one block device
#[derive(Debug, Clone, PartialEq)]
pub struct DiskStat {
    pub device: String,
    pub reads: u64,
    pub sectors_read: u64,
    pub writes: u64,
    pub sectors_written: u64,
    pub io_ms: u64,
}

impl IoCollector {
    pub fn new(env: &CollectorEnv) -> Self {
        Self { interval_secs: env.interval_secs }
    }

    /// Turn raw device counters into per-second rates keyed by device
    pub fn rates(&self, stats: &[DiskStat], counters: &mut CounterStore) -> Map<String, Value> {
        let mut devices = Map::new();
        let policy = ResetPolicy::ClampToZero;
        let interval = self.interval_secs;

        for stat in stats {
            let key = |field: &str| format!("io.{}.{}", stat.device, field);
            let rs = counters.rate(&key("reads"), stat.reads as f64, interval, policy);
            let ws = counters.rate(&key("writes"), stat.writes as f64, interval, policy);
            // sectors are 512 bytes
            let rkb = counters.rate(&key("sectors_read"), stat.sectors_read as f64, interval, policy) / 2.0;
            let wkb = counters.rate(&key("sectors_written"), stat.sectors_written as f64, interval, policy) / 2.0;
            let busy_ms = counters
                .observe(&key("io_ms"), stat.io_ms as f64, policy)
                .value_or_neutral();
            let util = if interval > 0.0 {
                (100.0 * busy_ms / (interval * 1000.0)).min(100.0)
            } else {
                0.0
            };

            devices.insert(
                stat.device.clone(),
                json!({
                    "r/s": rs,
                    "w/s": ws,
                    "rkB/s": rkb,
                    "wkB/s": wkb,
                    "%util": round2(util),
                }),
            );
        }

        devices
    }
}

/// Parse /proc/diskstats, skipping loop and ram devices
pub fn parse_diskstats(content: &str) -> Vec<DiskStat> {
    let mut stats = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 { continue; }

        let device = parts[2];
        if device.starts_with("loop") || device.starts_with("ram") { continue; }

        let field = |i: usize| parts[i].parse::<u64>().unwrap_or(0);
        stats.push(DiskStat {
            device: device.to_string(),
            reads: field(3),
            sectors_read: field(5),
            writes: field(7),
            sectors_written: field(9),
            io_ms: field(12),
        });
    }

    stats
}

#[async_trait]
impl Collector for IoCollector {
    fn name(&self) -> &str { "io" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform == Platform::Linux
    }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let content = tokio::fs::read_to_string("/proc/diskstats").await?;
        let stats = parse_diskstats(&content);
        let devices = self.rates(&stats, counters);
        if devices.is_empty() {
            return Ok(CollectorResult::NoData);
        }

        let mut set = MetricSet::new();
        set.insert("ioStats".into(), Value::Object(devices));
        Ok(CollectorResult::Data(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
   7       0 loop0 48 0 2118 14 0 0 0 0 0 28 14 0 0 0 0
   8       0 sda 1000 20 8000 500 2000 30 16000 900 0 1200 1400 0 0 0 0
   8       1 sda1 900 20 7000 450 1900 30 15000 850 0 1100 1300 0 0 0 0
";

    fn collector() -> IoCollector {
        IoCollector { interval_secs: 60.0 }
    }

    #[test]
    fn parse_skips_loop_devices() {
        let stats = parse_diskstats(SAMPLE);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].device, "sda");
        assert_eq!(stats[0].reads, 1000);
        assert_eq!(stats[0].sectors_written, 16000);
        assert_eq!(stats[0].io_ms, 1200);
    }

    #[test]
    fn first_cycle_reports_zero_rates() {
        let mut counters = CounterStore::new();
        let stats = parse_diskstats(SAMPLE);
        let devices = collector().rates(&stats, &mut counters);
        assert_eq!(devices["sda"]["r/s"], json!(0.0));
        assert_eq!(devices["sda"]["%util"], json!(0.0));
    }

    #[test]
    fn second_cycle_reports_per_second_rates() {
        let mut counters = CounterStore::new();
        let c = collector();
        let first = vec![DiskStat {
            device: "sda".into(),
            reads: 1000,
            sectors_read: 8000,
            writes: 2000,
            sectors_written: 16000,
            io_ms: 1200,
        }];
        c.rates(&first, &mut counters);

        let second = vec![DiskStat {
            device: "sda".into(),
            reads: 1600,
            sectors_read: 20000,
            writes: 2120,
            sectors_written: 16000,
            io_ms: 7200,
        }];
        let devices = c.rates(&second, &mut counters);
        assert_eq!(devices["sda"]["r/s"], json!(10.0));
        assert_eq!(devices["sda"]["w/s"], json!(2.0));
        assert_eq!(devices["sda"]["rkB/s"], json!(100.0));
        assert_eq!(devices["sda"]["wkB/s"], json!(0.0));
        assert_eq!(devices["sda"]["%util"], json!(10.0));
    }
}
