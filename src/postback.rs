use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Serialize;

use crate::command;
use crate::error::AgentError;
use crate::payload::CheckPayload;

/// Attempts per cycle: the original send plus one retry
pub const MAX_ATTEMPTS: u32 = 2;

const CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const ACCEPT: &str = "text/html, */*";

/// Form body of one postback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostbackEnvelope {
    pub payload: String,
    pub hash: String,
}

impl PostbackEnvelope {
    pub fn from_payload(payload: &CheckPayload) -> serde_json::Result<Self> {
        let json = payload.to_json()?;
        let hash = md5_hex(&json);
        Ok(Self { payload: json, hash })
    }

    /// `payload=...&hash=...`
    pub fn encode(&self) -> Result<String, serde_urlencoded::ser::Error> {
        serde_urlencoded::to_string(self)
    }
}

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// How a cycle's postback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostbackOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32 },
}

impl PostbackOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PostbackOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PostbackOutcome::Delivered { attempts } | PostbackOutcome::Failed { attempts } => *attempts,
        }
    }
}

/// Moves an encoded form body to the endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST the form body. Transport errors and non-2xx answers are both `Err`.
    async fn post_form(&mut self, url: &str, body: String) -> Result<()>;

    /// Drop cached connections and resolve `url`'s host again before a retry
    async fn refresh(&mut self, url: &str);
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self { client: Self::build_client(timeout)?, timeout })
    }

    fn build_client(timeout: Duration) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("check-agent/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_form(&mut self, url: &str, body: String) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::HttpStatus { status: status.as_u16() }.into());
        }
        Ok(())
    }

    async fn refresh(&mut self, url: &str) {
        if let Some((host, port)) = host_and_port(url) {
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    let addrs: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
                    tracing::debug!(host = %host, addrs = ?addrs, "Re-resolved postback host");
                }
                Err(e) => tracing::warn!(host = %host, error = %e, "DNS re-resolution failed"),
            }
        }

        // a fresh client has an empty connection pool, so the retry connects
        // from scratch instead of reusing a socket to a stale address
        match Self::build_client(self.timeout) {
            Ok(client) => self.client = client,
            Err(e) => tracing::warn!(error = %e, "Could not rebuild HTTP client"),
        }
    }
}

fn host_and_port(url: &str) -> Option<(String, u16)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default()?;
    Some((host, port))
}

/// Signs and ships payloads with one retry
pub struct PostbackClient {
    url: String,
    transport: Box<dyn Transport>,
    diagnostic_timeout: Duration,
}

impl PostbackClient {
    pub fn new(url: String, transport: Box<dyn Transport>, diagnostic_timeout: Duration) -> Self {
        Self { url, transport, diagnostic_timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver one payload. Never fails; the outcome is for reporting only.
    pub async fn send(&mut self, payload: &CheckPayload) -> PostbackOutcome {
        let mut attempts = 0;

        while attempts < MAX_ATTEMPTS {
            attempts += 1;

            let body = match PostbackEnvelope::from_payload(payload)
                .map_err(anyhow::Error::from)
                .and_then(|env| env.encode().map_err(anyhow::Error::from))
            {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(error = %e, "Could not encode payload");
                    return PostbackOutcome::Failed { attempts: attempts - 1 };
                }
            };

            match self.transport.post_form(&self.url, body).await {
                Ok(()) => {
                    tracing::debug!(url = %self.url, attempts, "Payload delivered");
                    return PostbackOutcome::Delivered { attempts };
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt = attempts, error = %format!("{:#}", e), "Postback failed");
                    if attempts < MAX_ATTEMPTS {
                        self.transport.refresh(&self.url).await;
                    }
                }
            }
        }

        tracing::error!(url = %self.url, attempts, "Giving up on this cycle's payload");
        self.trace_route().await;
        PostbackOutcome::Failed { attempts }
    }

    /// Log a route trace to the endpoint, only when debug logging is on
    async fn trace_route(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let Some((host, _)) = host_and_port(&self.url) else { return };

        match command::run("traceroute", &[host.as_str()], self.diagnostic_timeout).await {
            Ok(out) => tracing::debug!(host = %host, trace = %out, "Route to postback host"),
            Err(e) => tracing::debug!(host = %host, error = %e, "traceroute unavailable"),
        }
    }
}
