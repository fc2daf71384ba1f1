use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::command;
use crate::types::{CollectorResult, MetricSet, Platform};

/// Identity fields present in every payload
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_key: String,
    pub agent_version: String,
    pub platform: Platform,
    pub internal_hostname: String,
}

/// One-time host snapshot embedded in the first cycle's payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemFacts {
    pub os: String,
    pub cpu_cores: usize,
    pub platform: String,
    pub arch: String,
    pub kernel: Option<String>,
    pub os_version: Option<String>,
    pub hostname: String,
    pub agent_version: String,
}

impl SystemFacts {
    /// Probe the host. Every probe is best-effort; missing tools leave the
    /// field empty.
    pub async fn detect(platform: Platform, hostname: &str, timeout: Duration) -> Self {
        let kernel = command::run("uname", &["-r"], timeout)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let os_version = match platform {
            Platform::Linux => read_os_release(),
            Platform::MacOs => command::run("sw_vers", &["-productVersion"], timeout)
                .await
                .ok()
                .map(|s| format!("macOS {}", s.trim())),
            Platform::FreeBsd => kernel.clone().map(|k| format!("FreeBSD {}", k)),
            Platform::Other => None,
        };

        Self {
            os: platform.payload_name().to_string(),
            cpu_cores: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            arch: std::env::consts::ARCH.to_string(),
            kernel,
            os_version,
            hostname: hostname.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// The `systemStats` object, with the OS version repeated under the
    /// platform-specific key (`nixV`, `macV` or `fbsdV`) when known
    pub fn to_value(&self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        let detail_key = match self.os.as_str() {
            "linux" => Some("nixV"),
            "mac" => Some("macV"),
            "freebsd" => Some("fbsdV"),
            _ => None,
        };
        if let (Some(key), Some(version), Value::Object(map)) = (detail_key, &self.os_version, &mut value) {
            map.insert(key.to_string(), json!(version));
        }
        Ok(value)
    }
}

fn read_os_release() -> Option<String> {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find_map(|line| line.strip_prefix("PRETTY_NAME="))
                .map(|v| v.trim_matches('"').to_string())
        })
}

/// The document posted for one cycle. Key order is insertion order, so
/// serialising the same payload twice yields the same string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckPayload(Map<String, Value>);

impl CheckPayload {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Merges one cycle's collector outputs into a [`CheckPayload`]
#[derive(Debug, Clone)]
pub struct PayloadAssembler {
    identity: AgentIdentity,
    max_section_bytes: usize,
}

impl PayloadAssembler {
    pub fn new(identity: AgentIdentity, max_section_bytes: usize) -> Self {
        Self { identity, max_section_bytes }
    }

    /// Build a fresh payload.
    ///
    /// `outputs` are `(collector name, result)` in collection order; `NoData`
    /// contributes no keys. `plugins` become a single `plugins` section.
    /// Any section larger than the cap once serialised is dropped.
    pub fn assemble(
        &self,
        outputs: Vec<(String, CollectorResult)>,
        plugins: MetricSet,
        is_first_cycle: bool,
        facts: &SystemFacts,
    ) -> CheckPayload {
        let mut doc = Map::new();
        doc.insert("os".into(), json!(self.identity.platform.payload_name()));
        doc.insert("agentKey".into(), json!(self.identity.agent_key));
        doc.insert("agentVersion".into(), json!(self.identity.agent_version));
        doc.insert("internalHostname".into(), json!(self.identity.internal_hostname));

        if is_first_cycle {
            match facts.to_value() {
                Ok(v) => {
                    doc.insert("systemStats".into(), v);
                }
                Err(e) => tracing::warn!(error = %e, "Could not serialise system facts"),
            }
        }

        for (collector, result) in outputs {
            let Some(set) = result.into_set() else { continue };
            for (key, value) in set {
                self.insert_section(&mut doc, &collector, key, value);
            }
        }

        if !plugins.is_empty() {
            self.insert_section(&mut doc, "plugins", "plugins".into(), Value::Object(plugins));
        }

        CheckPayload(doc)
    }

    fn insert_section(&self, doc: &mut Map<String, Value>, source: &str, key: String, value: Value) {
        let size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > self.max_section_bytes {
            tracing::warn!(
                collector = source,
                section = %key,
                size,
                limit = self.max_section_bytes,
                "Dropping oversized payload section"
            );
            return;
        }
        if doc.contains_key(&key) {
            tracing::warn!(collector = source, section = %key, "Duplicate payload section, keeping the first");
            return;
        }
        doc.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            agent_key: "key123".into(),
            agent_version: "0.1.0".into(),
            platform: Platform::Linux,
            internal_hostname: "web-01".into(),
        }
    }

    fn facts() -> SystemFacts {
        SystemFacts {
            os: "linux".into(),
            cpu_cores: 4,
            platform: "linux-x86_64".into(),
            arch: "x86_64".into(),
            kernel: Some("6.1.0".into()),
            os_version: None,
            hostname: "web-01".into(),
            agent_version: "0.1.0".into(),
        }
    }

    fn set(pairs: &[(&str, Value)]) -> CollectorResult {
        let mut s = MetricSet::new();
        for (k, v) in pairs {
            s.insert((*k).to_string(), v.clone());
        }
        CollectorResult::Data(s)
    }

    #[test]
    fn identity_first_then_sections_in_order() {
        let assembler = PayloadAssembler::new(identity(), 1024);
        let payload = assembler.assemble(
            vec![
                ("load".into(), set(&[("loadAvrg", json!(0.5))])),
                ("mysql".into(), CollectorResult::NoData),
                ("memory".into(), set(&[("memPhysUsed", json!(100)), ("memPhysFree", json!(50))])),
            ],
            MetricSet::new(),
            false,
            &facts(),
        );

        let keys: Vec<&String> = payload.keys().collect();
        assert_eq!(
            keys,
            vec!["os", "agentKey", "agentVersion", "internalHostname", "loadAvrg", "memPhysUsed", "memPhysFree"]
        );
        assert!(!payload.contains_key("systemStats"));
        assert!(!payload.contains_key("plugins"));
    }

    #[test]
    fn system_stats_only_on_first_cycle() {
        let assembler = PayloadAssembler::new(identity(), 1024);
        let first = assembler.assemble(vec![], MetricSet::new(), true, &facts());
        assert_eq!(first.get("systemStats").unwrap()["cpuCores"], json!(4));
        assert_eq!(first.get("systemStats").unwrap()["osVersion"], Value::Null);
        assert!(first.get("systemStats").unwrap().get("nixV").is_none());
        let later = assembler.assemble(vec![], MetricSet::new(), false, &facts());
        assert!(!later.contains_key("systemStats"));
    }

    #[test]
    fn os_version_detail_key_follows_platform() {
        let mut mac = facts();
        mac.os = "mac".into();
        mac.os_version = Some("macOS 14.4".into());
        let value = mac.to_value().unwrap();
        assert_eq!(value["macV"], json!("macOS 14.4"));
        assert!(value.get("nixV").is_none());
    }

    #[test]
    fn oversized_section_is_dropped_not_fatal() {
        let assembler = PayloadAssembler::new(identity(), 64);
        let big: Vec<String> = (0..100).map(|i| format!("process-{}", i)).collect();
        let payload = assembler.assemble(
            vec![
                ("processes".into(), set(&[("processes", json!(big))])),
                ("load".into(), set(&[("loadAvrg", json!(1.0))])),
            ],
            MetricSet::new(),
            false,
            &facts(),
        );
        assert!(!payload.contains_key("processes"));
        assert_eq!(payload.get("loadAvrg"), Some(&json!(1.0)));
    }

    #[test]
    fn plugins_are_nested() {
        let assembler = PayloadAssembler::new(identity(), 1024);
        let mut plugins = MetricSet::new();
        plugins.insert("Redis".into(), json!({"connected_clients": 3}));
        let payload = assembler.assemble(vec![], plugins, false, &facts());
        assert_eq!(payload.get("plugins").unwrap()["Redis"]["connected_clients"], json!(3));
    }

    #[test]
    fn serialisation_is_stable() {
        let assembler = PayloadAssembler::new(identity(), 1024);
        let payload = assembler.assemble(
            vec![("load".into(), set(&[("loadAvrg", json!(0.25))]))],
            MetricSet::new(),
            true,
            &facts(),
        );
        let a = payload.to_json().unwrap();
        let b = payload.clone().to_json().unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("{\"os\":\"linux\",\"agentKey\":\"key123\""));
    }
}
