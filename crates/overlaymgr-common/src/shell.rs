//! Shell command execution utilities.
//!
//! Every kernel and firewall mutation issued by the managers goes through
//! this module, either directly via [`exec`] / [`exec_or_throw`] or through a
//! [`CommandRunner`] so adapters can be driven by a scripted runner in tests.
//!
//! # Example
//!
//! ```ignore
//! use overlaymgr_common::shell::{self, IP_CMD, shellquote};
//!
//! let link = "gre-1a2b3c4d";
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(link));
//! let result = shell::exec(&cmd).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{OverlayError, OverlayResult};

/// Path to the `ip` command for links, addresses and routes.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `bridge` command for forwarding-database entries.
pub const BRIDGE_CMD: &str = "/sbin/bridge";

/// Path to the `iptables` command for NAT/forward rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and `$`, `` ` ``, `"`, `\` and
/// newline are escaped.
///
/// # Example
///
/// ```
/// use overlaymgr_common::shell::shellquote;
///
/// assert_eq!(shellquote("gre-1"), "\"gre-1\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Builds a successful result carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Builds a failed result carrying `stderr`.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty stdout and stderr joined by a newline, for error reports.
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Returns true if stderr contains any of the given needles.
    pub fn stderr_contains_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.stderr.contains(n))
    }

    /// Converts a non-zero exit into [`OverlayError::ShellCommandFailed`].
    pub fn into_stdout(self, cmd: &str) -> OverlayResult<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(OverlayError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

/// Executes a shell command asynchronously.
///
/// The command runs through `/bin/sh -c`. A non-zero exit is not an error
/// here; inspect [`ExecResult::success`].
pub async fn exec(cmd: &str) -> OverlayResult<ExecResult> {
    tracing::debug!(cmd, "exec");

    let output = Command::new("/bin/sh")
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| OverlayError::ShellExec {
            command: cmd.to_owned(),
            source,
        })?;

    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_owned();
    let result = ExecResult {
        // Killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: text(&output.stdout),
        stderr: text(&output.stderr),
    };

    if !result.success() {
        tracing::warn!(cmd, exit_code = result.exit_code, stderr = %result.stderr, "exec failed");
    }
    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> OverlayResult<String> {
    exec(cmd).await?.into_stdout(cmd)
}

/// Runs commands on behalf of the kernel and firewall adapters.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` and returns its result; only spawn failures are errors.
    async fn run(&self, cmd: &str) -> OverlayResult<ExecResult>;
}

/// [`CommandRunner`] backed by `/bin/sh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> OverlayResult<ExecResult> {
        exec(cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("gre-1a2b"), "\"gre-1a2b\"");
        assert_eq!(shellquote("10.244.1.0/24"), "\"10.244.1.0/24\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
    }

    #[test]
    fn test_shellquote_empty() {
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_exec_result_helpers() {
        let ok = ExecResult::ok("output");
        assert!(ok.success());
        assert_eq!(ok.combined_output(), "output");

        let failed = ExecResult::failed(1, "Cannot find device \"gre-1\"");
        assert!(!failed.success());
        assert!(failed.stderr_contains_any(&["No such process", "Cannot find device"]));
        assert!(!failed.stderr_contains_any(&["File exists"]));
    }

    #[test]
    fn test_into_stdout_failure() {
        let err = ExecResult::failed(2, "RTNETLINK answers: File exists")
            .into_stdout("ip route add 10.0.0.0/24 dev gre-1")
            .unwrap_err();
        match err {
            OverlayError::ShellCommandFailed { exit_code, output, .. } => {
                assert_eq!(exit_code, 2);
                assert!(output.contains("File exists"));
            }
            other => panic!("Expected ShellCommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        let result = exec_or_throw("exit 3").await;
        match result {
            Err(OverlayError::ShellCommandFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            _ => panic!("Expected ShellCommandFailed error"),
        }
    }

    #[tokio::test]
    async fn test_shell_runner() {
        let result = ShellRunner.run("echo runner").await.unwrap();
        assert_eq!(result.stdout, "runner");
    }
}
