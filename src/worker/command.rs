//! Shell-command executor.
//!
//! Runs `payload.command` through `sh -c` (or the configured shell). Extra
//! environment comes from `payload.env`; the task id, worker id and attempt
//! are exported as `CONDUCTOR_TASK_ID`, `CONDUCTOR_WORKER_ID` and
//! `CONDUCTOR_ATTEMPT`. A non-zero exit is a failure. The child is killed
//! on cancellation.

use super::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default shell used to interpret commands.
pub const DEFAULT_SHELL: &str = "sh";

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            working_dir: None,
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    fn build_command(&self, request: &ExecutionRequest, script: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("CONDUCTOR_TASK_ID", &request.task.id)
            .env("CONDUCTOR_WORKER_ID", &request.worker_id)
            .env("CONDUCTOR_ATTEMPT", request.attempt.to_string());

        if let Some(env) = request.task.payload.get("env").and_then(|e| e.as_object()) {
            for (key, value) in env {
                match value.as_str() {
                    Some(s) => cmd.env(key, s),
                    None => cmd.env(key, value.to_string()),
                };
            }
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let Some(script) = request
            .task
            .payload
            .get("command")
            .and_then(|c| c.as_str())
            .map(str::to_owned)
        else {
            return ExecutionOutcome::failure("task payload has no 'command' string");
        };

        let child = match self.build_command(&request, &script).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failure(format!(
                    "failed to spawn {}: {}",
                    self.shell, e
                ));
            }
        };

        debug!(task = %request.task.id, worker = %request.worker_id, "Command started");

        // Dropping the wait future drops the child, which kill_on_drop terminates
        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancel.cancelled() => return ExecutionOutcome::failure("cancelled"),
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return ExecutionOutcome::failure(format!("failed to wait on command: {e}")),
        };

        let payload = serde_json::json!({
            "exit_code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        });

        if output.status.success() {
            ExecutionOutcome::success(payload)
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            ExecutionOutcome::failure(format!("command exited with {code}")).with_output(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::time::{Duration, Instant};

    fn request(payload: serde_json::Value) -> ExecutionRequest {
        ExecutionRequest {
            task: Task::new("build", "shell").with_payload(payload),
            worker_id: "w1".into(),
            attempt: 2,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let outcome = CommandExecutor::new()
            .execute(
                request(serde_json::json!({"command": "echo hello"})),
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.output["stdout"], "hello\n");
        assert_eq!(outcome.output["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_exports_task_environment() {
        let outcome = CommandExecutor::new()
            .execute(
                request(serde_json::json!({
                    "command": "echo $CONDUCTOR_TASK_ID:$CONDUCTOR_WORKER_ID:$CONDUCTOR_ATTEMPT:$GREETING",
                    "env": {"GREETING": "hi"}
                })),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.output["stdout"], "build:w1:2:hi\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let outcome = CommandExecutor::new()
            .execute(
                request(serde_json::json!({"command": "exit 3"})),
                CancellationToken::new(),
            )
            .await;
        assert!(!outcome.is_success());
        assert!(outcome.error.unwrap().contains('3'));
        assert_eq!(outcome.output["exit_code"], 3);
    }

    #[tokio::test]
    async fn test_missing_command_is_failure() {
        let outcome = CommandExecutor::new()
            .execute(request(serde_json::json!({})), CancellationToken::new())
            .await;
        assert!(outcome.error.unwrap().contains("command"));
    }

    #[tokio::test]
    async fn test_configured_shell_runs_command() {
        let outcome = CommandExecutor::new()
            .with_shell("/bin/sh")
            .execute(
                request(serde_json::json!({"command": "echo via-configured-shell"})),
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.output["stdout"], "via-configured-shell\n");
    }

    #[tokio::test]
    async fn test_unknown_shell_is_failure() {
        let outcome = CommandExecutor::new()
            .with_shell("/nonexistent/conductor-shell")
            .execute(
                request(serde_json::json!({"command": "true"})),
                CancellationToken::new(),
            )
            .await;
        assert!(!outcome.is_success());
        assert!(outcome.error.unwrap().contains("/nonexistent/conductor-shell"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = CommandExecutor::new()
            .execute(request(serde_json::json!({"command": "sleep 10"})), token)
            .await;
        assert!(!outcome.is_success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
