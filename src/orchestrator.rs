use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use crate::collector::{self, guarded, Collector, CollectorEnv};
use crate::config::Config;
use crate::counter::CounterStore;
use crate::payload::{AgentIdentity, PayloadAssembler, SystemFacts};
use crate::plugin::PluginRegistry;
use crate::postback::{HttpTransport, PostbackClient, PostbackOutcome};
use crate::types::{CollectorResult, Platform};

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    /// Top-level payload keys, identity fields included
    pub sections: Vec<String>,
    /// Collectors that errored, panicked or timed out
    pub failed: Vec<String>,
    pub postback: PostbackOutcome,
}

/// Drives the collect → assemble → post loop
pub struct Orchestrator {
    config: Config,
    platform: Platform,
    collectors: Vec<Box<dyn Collector>>,
    counters: CounterStore,
    plugins: PluginRegistry,
    plugin_dir: Option<PathBuf>,
    assembler: PayloadAssembler,
    postback: PostbackClient,
    facts: Option<SystemFacts>,
    interval: Duration,
    collector_timeout: Duration,
    cycles: u64,
}

impl Orchestrator {
    /// Wire up the production collectors, plugin registry and HTTP postback
    pub fn from_config(config: Config) -> Result<Self> {
        let env = CollectorEnv::from_config(&config)?;
        let collectors = collector::create_collectors(&config, &env)?;
        let plugins = PluginRegistry::with_builtins(config.agent.subprocess_timeout());
        let transport = HttpTransport::new(config.agent.socket_timeout())?;
        let postback = PostbackClient::new(
            config.agent.postback_url(),
            Box::new(transport),
            config.agent.subprocess_timeout(),
        );
        Ok(Self::new(config, env.platform, collectors, plugins, postback))
    }

    pub fn new(
        config: Config,
        platform: Platform,
        collectors: Vec<Box<dyn Collector>>,
        plugins: PluginRegistry,
        postback: PostbackClient,
    ) -> Self {
        let identity = AgentIdentity {
            agent_key: config.agent.agent_key.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            platform,
            internal_hostname: config.agent.hostname.clone(),
        };

        Self {
            platform,
            collectors,
            counters: CounterStore::new(),
            plugins,
            plugin_dir: config.agent.plugin_directory.as_ref().map(PathBuf::from),
            assembler: PayloadAssembler::new(identity, config.agent.max_section_bytes),
            postback,
            facts: None,
            interval: config.agent.check_interval(),
            collector_timeout: config.agent.collector_timeout(),
            cycles: 0,
            config,
        }
    }

    /// Use pre-computed host facts instead of probing the host on the first cycle
    pub fn with_facts(mut self, facts: SystemFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run cycles forever. The first cycle starts immediately; a cycle that
    /// overruns the interval pushes the next one back instead of stacking.
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            tracing::info!(
                cycle = report.cycle,
                sections = report.sections.len(),
                failed = report.failed.len(),
                delivered = report.postback.is_delivered(),
                "Check cycle finished"
            );
        }
    }

    /// One full cycle: collectors, plugins, assembly, postback
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let cycle = self.cycles;
        let started_at = Utc::now();
        let first = cycle == 1;
        tracing::debug!(cycle, "Starting check cycle");

        if first {
            self.discover_plugins();
        }

        let mut outputs = Vec::with_capacity(self.collectors.len());
        let mut failed = Vec::new();

        for c in self.collectors.iter_mut() {
            let name = c.name().to_string();
            if !c.is_supported(self.platform) {
                tracing::debug!(collector = %name, platform = %self.platform, "Collector not supported here");
                continue;
            }

            let result = guarded(&name, self.collector_timeout, c.collect(&mut self.counters)).await;
            match result {
                Ok(r) => {
                    if !r.is_data() {
                        tracing::debug!(collector = %name, "No data this cycle");
                    }
                    outputs.push((name, r));
                }
                Err(e) => {
                    tracing::error!(collector = %name, error = %format!("{:#}", e), "Collector failed");
                    outputs.push((name.clone(), CollectorResult::NoData));
                    failed.push(name);
                }
            }
        }

        let plugin_data = self.plugins.run_all().await;

        let facts = match self.facts.take() {
            Some(f) => f,
            None => {
                SystemFacts::detect(
                    self.platform,
                    &self.config.agent.hostname,
                    self.config.agent.subprocess_timeout(),
                )
                .await
            }
        };
        let payload = self.assembler.assemble(outputs, plugin_data, first, &facts);
        self.facts = Some(facts);

        let sections = payload.keys().cloned().collect();
        let postback = self.postback.send(&payload).await;

        CycleReport { cycle, started_at, sections, failed, postback }
    }

    fn discover_plugins(&mut self) {
        match self.plugin_dir.clone() {
            Some(dir) => {
                self.plugins.discover(&dir, &self.config);
            }
            None => tracing::debug!("No plugin directory configured"),
        }
    }
}
