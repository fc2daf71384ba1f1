//! End-to-end check cycles against a local HTTP endpoint.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use check_agent::collector::Collector;
use check_agent::config::Config;
use check_agent::counter::{CounterStore, ResetPolicy};
use check_agent::orchestrator::Orchestrator;
use check_agent::payload::SystemFacts;
use check_agent::plugin::PluginRegistry;
use check_agent::postback::{md5_hex, HttpTransport, PostbackClient, PostbackOutcome};
use check_agent::types::{CollectorResult, MetricSet, Platform};

struct Captured {
    request_line: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Captured {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn form(&self) -> Vec<(String, String)> {
        serde_urlencoded::from_str(&self.body).unwrap()
    }
}

/// Accept one connection per status, answer with it, and hand back what was sent
async fn serve(listener: TcpListener, statuses: Vec<u16>) -> Vec<Captured> {
    let mut captured = Vec::new();
    for status in statuses {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            let n = sock.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
        let request_line = lines.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse().unwrap())
            .unwrap_or(0);

        while buf.len() < header_end + length {
            let n = sock.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[header_end..header_end + length]).to_string();

        let response = format!(
            "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        sock.shutdown().await.ok();

        captured.push(Captured { request_line, headers, body });
    }
    captured
}

struct CountingCollector {
    raw: f64,
}

#[async_trait]
impl Collector for CountingCollector {
    fn name(&self) -> &str {
        "nginx"
    }

    async fn collect(&mut self, counters: &mut CounterStore) -> Result<CollectorResult> {
        self.raw += 300.0;
        let mut set = MetricSet::new();
        set.insert("nginxConnections".into(), json!(4));
        set.insert(
            "nginxReqPerSec".into(),
            json!(counters.rate("nginxRequests", self.raw, 60.0, ResetPolicy::ClampToZero)),
        );
        Ok(CollectorResult::Data(set))
    }
}

fn facts() -> SystemFacts {
    SystemFacts {
        os: "linux".into(),
        cpu_cores: 8,
        platform: "linux-x86_64".into(),
        arch: "x86_64".into(),
        kernel: Some("6.1.0".into()),
        os_version: Some("Debian GNU/Linux 12 (bookworm)".into()),
        hostname: "db-02".into(),
        agent_version: env!("CARGO_PKG_VERSION").into(),
    }
}

fn orchestrator(config: Config) -> Orchestrator {
    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    let postback = PostbackClient::new(
        config.agent.postback_url(),
        Box::new(transport),
        Duration::from_secs(1),
    );
    let plugins = PluginRegistry::with_builtins(Duration::from_secs(10));
    let collectors: Vec<Box<dyn Collector>> = vec![Box::new(CountingCollector { raw: 0.0 })];
    Orchestrator::new(config, Platform::Linux, collectors, plugins, postback).with_facts(facts())
}

#[tokio::test]
async fn first_cycle_retries_and_posts_signed_form() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve(listener, vec![503, 200]));

    let config = Config::from_toml(&format!(
        "[agent]\nagent_key = \"abc123\"\nsd_url = \"http://{}/\"\nhostname = \"db-02\"\n",
        addr
    ))
    .unwrap();
    let mut orch = orchestrator(config);

    let report = orch.run_cycle().await;
    assert_eq!(report.postback, PostbackOutcome::Delivered { attempts: 2 });
    assert!(report.failed.is_empty());

    let requests = server.await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);

    let req = &requests[1];
    assert_eq!(req.request_line, "POST /postback/ HTTP/1.1");
    assert_eq!(req.header("content-type"), Some("application/x-www-form-urlencoded"));
    assert_eq!(req.header("accept"), Some("text/html, */*"));
    assert!(req.header("user-agent").unwrap().starts_with("check-agent/"));

    let form = req.form();
    assert_eq!(form[0].0, "payload");
    assert_eq!(form[1].0, "hash");
    assert_eq!(form[1].1, md5_hex(&form[0].1));

    let payload: Value = serde_json::from_str(&form[0].1).unwrap();
    let keys: Vec<&String> = payload.as_object().unwrap().keys().collect();
    assert_eq!(
        keys,
        vec![
            "os",
            "agentKey",
            "agentVersion",
            "internalHostname",
            "systemStats",
            "nginxConnections",
            "nginxReqPerSec"
        ]
    );
    assert_eq!(payload["agentKey"], json!("abc123"));
    assert_eq!(payload["systemStats"]["cpuCores"], json!(8));
    assert_eq!(payload["nginxReqPerSec"], json!(0.0));
}

#[cfg(unix)]
#[tokio::test]
async fn plugins_are_discovered_once_and_reported() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("Echo");
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf '{\"hits\": 3, \"config\": %s}' \"$CHECK_AGENT_PLUGIN_CONFIG\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::write(dir.path().join("TcpCheck.plugin"), "").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();

    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let probe_addr = probe.local_addr().unwrap().to_string();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve(listener, vec![200, 200]));

    let config = Config::from_toml(&format!(
        "[agent]\nagent_key = \"abc123\"\nsd_url = \"http://{}\"\nhostname = \"db-02\"\n\
         plugin_directory = \"{}\"\n\
         [plugins.Echo]\ngreeting = \"hi\"\n\
         [plugins.TcpCheck]\ntargets = [\"{}\"]\n",
        addr,
        dir.path().display(),
        probe_addr
    ))
    .unwrap();
    let mut orch = orchestrator(config);

    let first = orch.run_cycle().await;
    let second = orch.run_cycle().await;
    assert!(first.postback.is_delivered());
    assert!(second.postback.is_delivered());
    assert!(first.sections.contains(&"plugins".to_string()));
    assert!(!second.sections.contains(&"systemStats".to_string()));

    let requests = server.await.unwrap();
    let payload: Value = serde_json::from_str(&requests[1].form()[0].1).unwrap();
    let plugins = payload["plugins"].as_object().unwrap();
    let names: Vec<&String> = plugins.keys().collect();
    assert_eq!(names, vec!["Echo", "TcpCheck"]);
    assert_eq!(plugins["Echo"]["hits"], json!(3));
    assert_eq!(plugins["Echo"]["config"]["greeting"], json!("hi"));
    assert_eq!(plugins["TcpCheck"][probe_addr.as_str()]["up"], json!(true));
    assert_eq!(payload["nginxReqPerSec"], json!(5.0));
}
