use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::command;
use crate::counter::CounterStore;
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{Collector, CollectorEnv};

/// Collects physical and swap memory usage, reported in MB
pub struct MemoryCollector {
    platform: Platform,
    timeout: Duration,
}

/// Memory figures in megabytes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    pub phys_used: u64,
    pub phys_free: u64,
    pub phys_usable: u64,
    pub cached: u64,
    pub buffers: u64,
    pub shared: u64,
    pub swap_used: u64,
    pub swap_free: u64,
}

impl MemorySnapshot {
    pub fn to_set(&self) -> MetricSet {
        let mut set = MetricSet::new();
        set.insert("memPhysUsed".into(), json!(self.phys_used));
        set.insert("memPhysFree".into(), json!(self.phys_free));
        set.insert("memPhysUsable".into(), json!(self.phys_usable));
        set.insert("memCached".into(), json!(self.cached));
        set.insert("memBuffers".into(), json!(self.buffers));
        set.insert("memShared".into(), json!(self.shared));
        set.insert("memSwapUsed".into(), json!(self.swap_used));
        set.insert("memSwapFree".into(), json!(self.swap_free));
        set
    }
}

impl MemoryCollector {
    pub fn new(env: &CollectorEnv) -> Self {
        Self { platform: env.platform, timeout: env.subprocess_timeout }
    }

    async fn collect_macos(&self) -> Result<Option<MemorySnapshot>> {
        let memsize = command::run("sysctl", &["-n", "hw.memsize"], self.timeout).await?;
        let vm_stat = command::run("vm_stat", &[], self.timeout).await?;
        let swap = command::run("sysctl", &["-n", "vm.swapusage"], self.timeout).await?;

        let total_bytes: u64 = memsize.trim().parse().context("hw.memsize")?;
        Ok(parse_vm_stat(total_bytes, &vm_stat, &swap))
    }

    async fn collect_freebsd(&self) -> Result<Option<MemorySnapshot>> {
        let sysctl = command::run(
            "sysctl",
            &[
                "-n",
                "hw.physmem",
                "hw.pagesize",
                "vm.stats.vm.v_free_count",
                "vm.stats.vm.v_inactive_count",
                "vm.stats.vm.v_cache_count",
            ],
            self.timeout,
        )
        .await?;
        let swapinfo = command::run("swapinfo", &["-k"], self.timeout).await.unwrap_or_default();
        Ok(parse_freebsd(&sysctl, &swapinfo))
    }
}

/// Parse /proc/meminfo
pub fn parse_meminfo(content: &str) -> Option<MemorySnapshot> {
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    let mut free_kb = 0u64;
    let mut buffers_kb = 0u64;
    let mut cached_kb = 0u64;
    let mut shared_kb = 0u64;
    let mut swap_total_kb = 0u64;
    let mut swap_free_kb = 0u64;
    let mut has_available = false;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 { continue; }
        let val: u64 = parts[1].parse().unwrap_or(0);
        match parts[0] {
            "MemTotal:" => total_kb = val,
            "MemAvailable:" => { available_kb = val; has_available = true; }
            "MemFree:" => free_kb = val,
            "Buffers:" => buffers_kb = val,
            "Cached:" => cached_kb = val,
            "Shmem:" => shared_kb = val,
            "SwapTotal:" => swap_total_kb = val,
            "SwapFree:" => swap_free_kb = val,
            _ => {}
        }
    }

    if total_kb == 0 {
        return None;
    }

    // Fallback for kernels without MemAvailable
    if !has_available {
        available_kb = free_kb + buffers_kb + cached_kb;
    }

    Some(MemorySnapshot {
        phys_used: total_kb.saturating_sub(free_kb) / 1024,
        phys_free: free_kb / 1024,
        phys_usable: available_kb / 1024,
        cached: cached_kb / 1024,
        buffers: buffers_kb / 1024,
        shared: shared_kb / 1024,
        swap_used: swap_total_kb.saturating_sub(swap_free_kb) / 1024,
        swap_free: swap_free_kb / 1024,
    })
}

/// Parse macOS `vm_stat` plus `sysctl vm.swapusage`
pub fn parse_vm_stat(total_bytes: u64, vm_stat: &str, swapusage: &str) -> Option<MemorySnapshot> {
    let mut page_size = 4096u64;
    let mut free = 0u64;
    let mut inactive = 0u64;
    let mut speculative = 0u64;
    let mut file_backed = 0u64;

    for line in vm_stat.lines() {
        if let Some(rest) = line.split("page size of ").nth(1) {
            page_size = rest.split_whitespace().next()?.parse().unwrap_or(4096);
            continue;
        }
        let Some((key, value)) = line.split_once(':') else { continue };
        let pages: u64 = value.trim().trim_end_matches('.').parse().unwrap_or(0);
        match key.trim() {
            "Pages free" => free = pages,
            "Pages inactive" => inactive = pages,
            "Pages speculative" => speculative = pages,
            "File-backed pages" => file_backed = pages,
            _ => {}
        }
    }

    if total_bytes == 0 {
        return None;
    }

    let mb = |pages: u64| pages * page_size / 1024 / 1024;
    let phys_free = mb(free + speculative);
    let (swap_used, swap_free) = parse_swapusage(swapusage);

    Some(MemorySnapshot {
        phys_used: (total_bytes / 1024 / 1024).saturating_sub(phys_free),
        phys_free,
        phys_usable: mb(free + inactive + speculative),
        cached: mb(file_backed),
        buffers: 0,
        shared: 0,
        swap_used,
        swap_free,
    })
}

/// "total = 2048.00M  used = 1024.50M  free = 1023.50M  (encrypted)"
fn parse_swapusage(content: &str) -> (u64, u64) {
    let mut used = 0u64;
    let mut free = 0u64;
    let tokens: Vec<&str> = content.split_whitespace().collect();
    for window in tokens.windows(3) {
        if window[1] != "=" { continue; }
        let value = window[2].trim_end_matches('M').parse::<f64>().unwrap_or(0.0) as u64;
        match window[0] {
            "used" => used = value,
            "free" => free = value,
            _ => {}
        }
    }
    (used, free)
}

/// Parse FreeBSD `sysctl -n` values (physmem, pagesize, free, inactive, cache
/// counts, one per line) plus `swapinfo -k`
pub fn parse_freebsd(sysctl: &str, swapinfo: &str) -> Option<MemorySnapshot> {
    let values: Vec<u64> = sysctl
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    if values.len() < 5 {
        return None;
    }
    let (physmem, page_size) = (values[0], values[1]);
    let mb = |pages: u64| pages * page_size / 1024 / 1024;

    let phys_free = mb(values[2]);
    let cached = mb(values[4]);

    let (swap_used, swap_free) = swapinfo
        .lines()
        .last()
        .map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let kb = |i: usize| parts.get(i).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
            (kb(2) / 1024, kb(3) / 1024)
        })
        .unwrap_or((0, 0));

    Some(MemorySnapshot {
        phys_used: (physmem / 1024 / 1024).saturating_sub(phys_free),
        phys_free,
        phys_usable: mb(values[2] + values[3] + values[4]),
        cached,
        buffers: 0,
        shared: 0,
        swap_used,
        swap_free,
    })
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str { "memory" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform != Platform::Other
    }

    async fn collect(&mut self, _counters: &mut CounterStore) -> Result<CollectorResult> {
        let snapshot = match self.platform {
            Platform::Linux => {
                let content = tokio::fs::read_to_string("/proc/meminfo").await?;
                parse_meminfo(&content)
            }
            Platform::MacOs => self.collect_macos().await?,
            Platform::FreeBsd => self.collect_freebsd().await?,
            Platform::Other => None,
        };

        Ok(snapshot.map(|s| s.to_set()).into())
    }
}
