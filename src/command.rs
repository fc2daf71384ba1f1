use std::time::Duration;

use tokio::process::Command;

use crate::error::AgentError;

/// Captured output of an external tool
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

/// Run `program` with `args`, bounded by `timeout`.
///
/// The child is killed if the timeout fires. A non-zero exit is reported as
/// `CommandFailed`.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<String, AgentError> {
    run_with_env(program, args, &[], timeout).await.map(|out| out.stdout)
}

pub async fn run_with_env(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<CommandOutput, AgentError> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    for (k, v) in envs {
        cmd.env(k, v);
    }

    let result = tokio::time::timeout(timeout, cmd.output()).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(AgentError::CommandSpawn { program: program.to_string(), source });
        }
        Err(_) => {
            return Err(AgentError::CommandTimeout { program: program.to_string(), timeout });
        }
    };

    if !output.status.success() {
        tracing::debug!(
            program,
            code = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Command exited unsuccessfully"
        );
        return Err(AgentError::CommandFailed {
            program: program.to_string(),
            code: output.status.code(),
        });
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run("sh", &["-c", "echo hello"], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = run("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_missing_binary());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run("sh", &["-c", "sleep 5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let err = run("sh", &["-c", "exit 3"], Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AgentError::CommandFailed { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let out = run_with_env(
            "sh",
            &["-c", "printf %s \"$CHECK_AGENT_X\""],
            &[("CHECK_AGENT_X", "42")],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "42");
    }
}
