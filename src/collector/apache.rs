use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::config::ApacheConfig;
use crate::counter::{CounterStore, ResetPolicy};
use crate::types::{CollectorResult, MetricSet};
use super::{fetch_text, Collector, CollectorEnv};

/// Polls Apache mod_status in machine-readable (`?auto`) form
pub struct ApacheCollector {
    url: String,
    interval_secs: f64,
    http: reqwest::Client,
}

/// Fields of interest from the `?auto` status page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApacheStatus {
    pub total_accesses: Option<f64>,
    pub req_per_sec: Option<f64>,
    pub busy_workers: Option<u64>,
    pub idle_workers: Option<u64>,
}

impl ApacheCollector {
    pub fn new(config: &ApacheConfig, env: &CollectorEnv) -> Self {
        Self { url: auto_url(&config.status_url), interval_secs: env.interval_secs, http: env.http.clone() }
    }

    /// Build payload keys; the request rate comes from the `Total Accesses`
    /// counter when present, otherwise from Apache's own lifetime average
    pub fn to_set(&self, status: &ApacheStatus, counters: &mut CounterStore) -> MetricSet {
        let mut set = MetricSet::new();

        let req_per_sec = match status.total_accesses {
            Some(total) => Some(counters.rate(
                "apacheTotalAccesses",
                total,
                self.interval_secs,
                ResetPolicy::ClampToZero,
            )),
            None => status.req_per_sec,
        };

        if let Some(rps) = req_per_sec {
            set.insert("apacheReqPerSec".into(), json!(rps));
        }
        if let Some(busy) = status.busy_workers {
            set.insert("apacheBusyWorkers".into(), json!(busy));
        }
        if let Some(idle) = status.idle_workers {
            set.insert("apacheIdleWorkers".into(), json!(idle));
        }
        set
    }
}

/// Add the `auto` flag to the status URL's query, keeping any existing
/// parameters. An unparseable URL is returned unchanged and fails at fetch.
pub fn auto_url(status_url: &str) -> String {
    let mut url = match reqwest::Url::parse(status_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(url = status_url, error = %e, "Invalid Apache status URL");
            return status_url.to_string();
        }
    };
    if !url.query_pairs().any(|(k, _)| k == "auto") {
        url.query_pairs_mut().append_key_only("auto");
    }
    url.to_string()
}

pub fn parse_status(body: &str) -> ApacheStatus {
    let mut status = ApacheStatus::default();

    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "Total Accesses" => status.total_accesses = value.parse().ok(),
            "ReqPerSec" => status.req_per_sec = value.parse().ok(),
            "BusyWorkers" => status.busy_workers = value.parse().ok(),
            "IdleWorkers" => status.idle_workers = value.parse().ok(),
            _ => {}
        }
    }

    status
}

#[async_trait]
impl Collector for ApacheCollector {
    fn name(&self) -> &str { "apache" }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        let Some(body) = fetch_text(&self.http, &self.url, None).await else {
            return Ok(CollectorResult::NoData);
        };

        let status = parse_status(&body);
        if status == ApacheStatus::default() {
            tracing::debug!(url = %self.url, "Apache status page had no recognised fields");
            return Ok(CollectorResult::NoData);
        }

        Ok(CollectorResult::from_set(self.to_set(&status, counters)))
    }
}
