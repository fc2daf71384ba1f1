use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::CouchDbConfig;
use crate::counter::CounterStore;
use crate::types::{CollectorResult, MetricSet};
use super::{fetch_text, Collector, CollectorEnv};

/// Polls CouchDB server stats and per-database info
pub struct CouchDbCollector {
    base_url: String,
    user: Option<String>,
    pass: Option<String>,
    http: reqwest::Client,
}

impl CouchDbCollector {
    pub fn new(config: &CouchDbConfig, env: &CollectorEnv) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            http: env.http.clone(),
        }
    }

    async fn get_json(&self, path: &str) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);
        let auth = self.user.as_deref().map(|u| (u, self.pass.as_deref()));
        let body = fetch_text(&self.http, &url, auth).await?;
        serde_json::from_str(&body).ok()
    }
}

/// Path of a database's info document. Names may contain `/` and `+`,
/// so the whole name is encoded as one segment.
pub fn database_path(name: &str) -> String {
    format!("/{}", urlencoding::encode(name))
}

/// Per-database fields worth reporting from `GET /<db>`
pub fn database_summary(info: &Value) -> Value {
    json!({
        "doc_count": info.get("doc_count"),
        "doc_del_count": info.get("doc_del_count"),
        "disk_size": info.get("disk_size").or_else(|| info.pointer("/sizes/file")),
        "data_size": info.get("data_size").or_else(|| info.pointer("/sizes/active")),
    })
}

#[async_trait]
impl Collector for CouchDbCollector {
    fn name(&self) -> &str { "couchdb" }

    async fn collect(&mut self, _counters: &mut CounterStore) -> Result<CollectorResult> {
        // CouchDB 1.x serves /_stats; 2.x+ moved it under the local node
        let stats = match self.get_json("/_stats").await {
            Some(stats) => Some(stats),
            None => self.get_json("/_node/_local/_stats").await,
        };
        let Some(stats) = stats else {
            return Ok(CollectorResult::NoData);
        };

        let mut databases = Map::new();
        if let Some(Value::Array(names)) = self.get_json("/_all_dbs").await {
            for name in names.iter().filter_map(Value::as_str) {
                if let Some(info) = self.get_json(&database_path(name)).await {
                    databases.insert(name.to_string(), database_summary(&info));
                }
            }
        }

        let mut set = MetricSet::new();
        set.insert(
            "couchDB".into(),
            json!({ "server": stats, "databases": Value::Object(databases) }),
        );
        Ok(CollectorResult::Data(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_summary_handles_both_layouts() {
        let v1 = json!({ "doc_count": 5, "doc_del_count": 1, "disk_size": 4096, "data_size": 2048 });
        let v2 = json!({ "doc_count": 5, "doc_del_count": 0, "sizes": { "file": 8192, "active": 1024 } });
        assert_eq!(database_summary(&v1)["disk_size"], json!(4096));
        assert_eq!(database_summary(&v2)["disk_size"], json!(8192));
        assert_eq!(database_summary(&v2)["data_size"], json!(1024));
    }

    #[test]
    fn database_names_are_one_path_segment() {
        assert_eq!(database_path("metrics"), "/metrics");
        assert_eq!(database_path("team/a+b"), "/team%2Fa%2Bb");
    }
}
