use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::time::Duration;

use crate::command;
use crate::counter::CounterStore;
use crate::types::{CollectorResult, MetricSet, Platform};
use super::{Collector, CollectorEnv};

/// Collects the 1-minute load average
pub struct LoadCollector {
    platform: Platform,
    timeout: Duration,
    uptime_re: Regex,
}

impl LoadCollector {
    pub fn new(env: &CollectorEnv) -> Result<Self> {
        Ok(Self {
            platform: env.platform,
            timeout: env.subprocess_timeout,
            uptime_re: uptime_regex()?,
        })
    }
}

fn uptime_regex() -> Result<Regex, regex::Error> {
    // "load average: 0.10, 0.20, 0.30" on Linux, "load averages:" on the
    // BSDs, where macOS also drops the commas
    Regex::new(r"load averages?:\s*([\d.]+),?\s+([\d.]+),?\s+([\d.]+)")
}

/// First field of /proc/loadavg
pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// 1-minute average from `uptime` output
pub fn parse_uptime(re: &Regex, content: &str) -> Option<f64> {
    re.captures(content)?.get(1)?.as_str().parse().ok()
}

#[async_trait]
impl Collector for LoadCollector {
    fn name(&self) -> &str { "load" }

    fn is_supported(&self, platform: Platform) -> bool {
        platform != Platform::Other
    }

    async fn collect(&mut self, _counters: &mut CounterStore) -> Result<CollectorResult> {
        let load = if self.platform == Platform::Linux {
            let content = tokio::fs::read_to_string("/proc/loadavg").await?;
            parse_loadavg(&content)
        } else {
            let output = command::run("uptime", &[], self.timeout).await?;
            parse_uptime(&self.uptime_re, &output)
        };

        let mut set = MetricSet::new();
        if let Some(v) = load {
            set.insert("loadAvrg".into(), json!(v));
        } else {
            tracing::debug!("Could not parse load average");
        }
        Ok(CollectorResult::from_set(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadavg_first_field() {
        assert_eq!(parse_loadavg("0.42 0.30 0.12 1/234 5678\n"), Some(0.42));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn builds_with_uptime_pattern() {
        let env = CollectorEnv {
            platform: Platform::FreeBsd,
            interval_secs: 60.0,
            subprocess_timeout: Duration::from_secs(1),
            http: reqwest::Client::new(),
        };
        let c = LoadCollector::new(&env).unwrap();
        assert_eq!(parse_uptime(&c.uptime_re, "load averages: 0.50, 0.40, 0.30"), Some(0.5));
    }

    #[test]
    fn uptime_variants() {
        let re = uptime_regex().unwrap();
        let bsd = "10:01AM  up 3 days, 2 users, load averages: 1.25, 1.10, 0.90";
        let mac = "10:01  up 3 days,  2:13, 2 users, load averages: 2.17 1.98 1.80";
        let linux = " 10:01:02 up 3 days,  2:13,  2 users,  load average: 0.05, 0.10, 0.15";
        assert_eq!(parse_uptime(&re, bsd), Some(1.25));
        assert_eq!(parse_uptime(&re, mac), Some(2.17));
        assert_eq!(parse_uptime(&re, linux), Some(0.05));
        assert_eq!(parse_uptime(&re, "garbage"), None);
    }
}
