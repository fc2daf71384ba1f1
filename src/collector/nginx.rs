use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::config::NginxConfig;
use crate::counter::{CounterStore, ResetPolicy};
use crate::types::{CollectorResult, MetricSet};
use super::{fetch_text, Collector, CollectorEnv};

/// Polls the nginx stub_status page
pub struct NginxCollector {
    url: String,
    interval_secs: f64,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StubStatus {
    pub active: u64,
    pub requests: u64,
}

impl NginxCollector {
    pub fn new(config: &NginxConfig, env: &CollectorEnv) -> Self {
        Self {
            url: config.status_url.clone(),
            interval_secs: env.interval_secs,
            http: env.http.clone(),
        }
    }

    pub fn to_set(&self, status: StubStatus, counters: &mut CounterStore) -> MetricSet {
        let rps = counters.rate(
            "nginxRequests",
            status.requests as f64,
            self.interval_secs,
            ResetPolicy::ClampToZero,
        );

        let mut set = MetricSet::new();
        set.insert("nginxConnections".into(), json!(status.active));
        set.insert("nginxReqPerSec".into(), json!(rps));
        set
    }
}

/// Parse stub_status:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
pub fn parse_stub_status(body: &str) -> Option<StubStatus> {
    let mut lines = body.lines();
    let active = lines
        .next()?
        .strip_prefix("Active connections:")?
        .trim()
        .parse()
        .ok()?;

    lines.next()?;
    let counts: Vec<u64> = lines
        .next()?
        .split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect();
    let requests = *counts.get(2)?;

    Some(StubStatus { active, requests })
}

#[async_trait]
impl Collector for NginxCollector {
    fn name(&self) -> &str { "nginx" }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let Some(body) = fetch_text(&self.http, &self.url, None).await else {
            return Ok(CollectorResult::NoData);
        };

        match parse_stub_status(&body) {
            Some(status) => Ok(CollectorResult::Data(self.to_set(status, counters))),
            None => {
                tracing::debug!(url = %self.url, "Unrecognised nginx status page");
                Ok(CollectorResult::NoData)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use std::time::Duration;

    fn page(requests: u64) -> String {
        format!(
            "Active connections: 291 \nserver accepts handled requests\n 16630948 16630948 {} \nReading: 6 Writing: 179 Waiting: 106 \n",
            requests
        )
    }

    fn collector() -> NginxCollector {
        let env = CollectorEnv {
            platform: Platform::Linux,
            interval_secs: 60.0,
            subprocess_timeout: Duration::from_secs(1),
            http: reqwest::Client::new(),
        };
        NginxCollector::new(&NginxConfig { status_url: "http://localhost/nginx_status".into() }, &env)
    }

    #[test]
    fn parses_page() {
        let status = parse_stub_status(&page(31070465)).unwrap();
        assert_eq!(status, StubStatus { active: 291, requests: 31070465 });
        assert!(parse_stub_status("<html>not found</html>").is_none());
    }

    #[test]
    fn request_rate_is_clamped_after_restart() {
        let c = collector();
        let mut counters = CounterStore::new();

        let first = c.to_set(parse_stub_status(&page(6000)).unwrap(), &mut counters);
        assert_eq!(first["nginxReqPerSec"], json!(0.0));
        assert_eq!(first["nginxConnections"], json!(291));

        let second = c.to_set(parse_stub_status(&page(12000)).unwrap(), &mut counters);
        assert_eq!(second["nginxReqPerSec"], json!(100.0));

        let restarted = c.to_set(parse_stub_status(&page(10)).unwrap(), &mut counters);
        assert_eq!(restarted["nginxReqPerSec"], json!(0.0));
    }
}
