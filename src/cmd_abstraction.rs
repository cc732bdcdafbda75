//! External command execution behind a trait, so callers can be tested
//! without spawning processes.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command exited with code 0
    pub success: bool,
    /// The exit code, if the process was not killed by a signal
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Last non-empty stderr line, for error messages
    pub fn stderr_summary(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

/// Runs a program to completion.
///
/// `args` is `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetime.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` with `args`, feeding `stdin` to it when given.
    fn run(&self, cmd: &str, args: &[String], stdin: Option<String>) -> Result<CommandOutput>;
}

/// Spawns real processes
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn run(&self, cmd: &str, args: &[String], stdin: Option<String>) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", cmd))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data.as_bytes())
                .with_context(|| format!("Failed to write stdin of {}", cmd))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Convert a slice of &str to the owned form the trait takes
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
