//! Scoped command runner.
//!
//! Spawns the approved program directly (no shell), so the argument vector
//! that was approved is the one that runs:
//! - Environment cleared, then rebuilt without secret variables
//! - Fixed working directory
//! - Timeout with kill on drop
//! - Truncated stdout/stderr capture

use crate::outcome::OperationOutcome;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use warden_common::util::truncate_output;

/// Default command timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default cap on captured stdout/stderr, per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 8 * 1024;

/// Environment variables to always filter out.
const FILTERED_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GOOGLE_API_KEY",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_ACCESS_KEY_ID",
    "AWS_SESSION_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
];

/// Name fragments that mark a variable as secret.
const SECRET_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "PASSWD", "API_KEY", "PRIVATE_KEY"];

fn is_secret_var(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    FILTERED_ENV_VARS.contains(&upper.as_str()) || SECRET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Runner for command-class steps.
#[derive(Debug, Clone)]
pub struct ScopedShell {
    timeout: Duration,
    max_output_bytes: usize,
    env_overrides: HashMap<String, String>,
}

impl Default for ScopedShell {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            env_overrides: HashMap::new(),
        }
    }
}

impl ScopedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Add an environment variable passed to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a filtered environment for command execution.
    fn build_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| !is_secret_var(k))
            .collect();
        env.extend(self.env_overrides.clone());
        env
    }

    /// Run `program args...` in `cwd` and wait for it, bounded by the timeout.
    pub async fn run(&self, program: &str, args: &[String], cwd: &Path) -> OperationOutcome {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(self.build_env())
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = std::time::Instant::now();
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                // Killed by a signal on unix.
                let exit_code = output.status.code().unwrap_or(-1);
                tracing::debug!(
                    program,
                    exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Command finished"
                );
                OperationOutcome::Ran {
                    exit_code,
                    stdout: truncate_output(&output.stdout, self.max_output_bytes),
                    stderr: truncate_output(&output.stderr, self.max_output_bytes),
                }
            }
            Ok(Err(e)) => OperationOutcome::failed(format!("Failed to execute {program}: {e}")),
            Err(_) => {
                tracing::warn!(program, timeout_secs = self.timeout.as_secs(), "Command timed out");
                OperationOutcome::TimedOut {
                    after_secs: self.timeout.as_secs(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn secret_vars_are_filtered() {
        assert!(is_secret_var("OPENAI_API_KEY"));
        assert!(is_secret_var("github_token"));
        assert!(is_secret_var("DB_PASSWORD"));
        assert!(!is_secret_var("PATH"));
        assert!(!is_secret_var("HOME"));
    }

    #[test]
    fn with_env_adds_vars() {
        let shell = ScopedShell::new().with_env("MY_VAR", "my_value");
        let env = shell.build_env();
        assert_eq!(env.get("MY_VAR"), Some(&"my_value".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_program_with_args() {
        let tmp = TempDir::new().unwrap();
        let outcome = ScopedShell::new()
            .run("echo", &args(&["hello", "world"]), tmp.path())
            .await;
        match outcome {
            OperationOutcome::Ran {
                exit_code, stdout, ..
            } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout.trim(), "hello world");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        let tmp = TempDir::new().unwrap();
        let outcome = ScopedShell::new()
            .run("echo", &args(&["$HOME; rm -rf /"]), tmp.path())
            .await;
        match outcome {
            OperationOutcome::Ran { stdout, .. } => assert_eq!(stdout.trim(), "$HOME; rm -rf /"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_given_cwd() {
        let tmp = TempDir::new().unwrap();
        let cwd = tmp.path().canonicalize().unwrap();
        let outcome = ScopedShell::new().run("pwd", &[], &cwd).await;
        match outcome {
            OperationOutcome::Ran { stdout, .. } => {
                assert_eq!(stdout.trim(), cwd.display().to_string())
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let tmp = TempDir::new().unwrap();
        let outcome = ScopedShell::new().run("false", &[], tmp.path()).await;
        assert!(matches!(outcome, OperationOutcome::Ran { exit_code, .. } if exit_code != 0));
        assert!(!outcome.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_handling() {
        let tmp = TempDir::new().unwrap();
        let shell = ScopedShell::new().with_timeout(Duration::from_millis(100));
        let outcome = shell.run("sleep", &args(&["10"]), tmp.path()).await;
        assert!(matches!(outcome, OperationOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let tmp = TempDir::new().unwrap();
        let outcome = ScopedShell::new()
            .run("definitely-not-a-real-program-xyz", &[], tmp.path())
            .await;
        assert!(matches!(outcome, OperationOutcome::Failed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let long = "x".repeat(100);
        let shell = ScopedShell::new().with_max_output_bytes(10);
        let outcome = shell.run("echo", &args(&[long.as_str()]), tmp.path()).await;
        match outcome {
            OperationOutcome::Ran { stdout, .. } => assert!(stdout.contains("[truncated")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
