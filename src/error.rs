//! Typed failures raised inside the agent.
//!
//! None of these cross a component boundary in steady state: collectors,
//! plugins and the postback client turn them into "no data" plus a log line.
//! Only `Config` is allowed to stop the process, and only at startup.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {details}")]
    Config { details: String },

    #[error("command `{program}` could not be started: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{program}` timed out after {timeout:?}")]
    CommandTimeout { program: String, timeout: Duration },

    #[error("command `{program}` exited with status {code:?}")]
    CommandFailed { program: String, code: Option<i32> },

    #[error("plugin {path} could not be loaded: {details}")]
    PluginLoad { path: PathBuf, details: String },

    #[error("plugin `{name}` produced invalid output: {details}")]
    PluginOutput { name: String, details: String },

    #[error("collector `{name}` timed out after {timeout:?}")]
    CollectorTimeout { name: String, timeout: Duration },

    #[error("endpoint answered with HTTP {status}")]
    HttpStatus { status: u16 },
}

impl AgentError {
    pub fn config(details: impl Into<String>) -> Self {
        AgentError::Config { details: details.into() }
    }

    /// True for failures where the tool simply is not installed
    pub fn is_missing_binary(&self) -> bool {
        matches!(
            self,
            AgentError::CommandSpawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
