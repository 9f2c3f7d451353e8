//! Bounded external command execution.
//!
//! Every external call the daemon makes (fence tool, block-store CLI,
//! interface plumbing, packet-filter reload) goes through a [`Commander`]
//! with an explicit timeout. The mock variant records invocations and
//! serves canned outputs, which is what lets the whole control plane run
//! under test without touching the host.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Executor for external commands.
#[derive(Clone)]
pub enum Commander {
    /// Runs real processes on the host.
    System,

    /// Records calls and serves canned outputs.
    Mock(Arc<MockCommander>),
}

impl Commander {
    pub fn mock() -> (Self, Arc<MockCommander>) {
        let mock = Arc::new(MockCommander::default());
        (Self::Mock(Arc::clone(&mock)), mock)
    }

    /// Runs `argv` and waits at most `timeout`. A nonzero exit is returned
    /// in the output, not as an error; only spawn failures and timeouts
    /// error.
    pub async fn run(&self, argv: &[&str], timeout: Duration) -> Result<CommandOutput> {
        match self {
            Self::System => Self::run_system(argv, timeout, None).await,
            Self::Mock(mock) => Ok(mock.record(argv)),
        }
    }

    /// Like [`Commander::run`], feeding `input` to the child's stdin.
    pub async fn run_with_stdin(
        &self,
        argv: &[&str],
        input: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        match self {
            Self::System => Self::run_system(argv, timeout, Some(input)).await,
            Self::Mock(mock) => Ok(mock.record(argv)),
        }
    }

    async fn run_system(
        argv: &[&str],
        timeout: Duration,
        input: Option<&str>,
    ) -> Result<CommandOutput> {
        let command_line = argv.join(" ");
        debug!(command = %command_line, "running external command");

        let (program, args) = argv.split_first().ok_or_else(|| Error::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command_line.clone(),
                source,
            })?;

        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(text.as_bytes()).await;
            }
        }

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match waited {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(Error::Spawn {
                command: command_line,
                source,
            }),
            Err(_) => Err(Error::Timeout {
                command: command_line,
                seconds: timeout.as_secs(),
            }),
        }
    }
}

/// Recording mock for [`Commander`].
///
/// Responses are matched by the longest configured prefix of the command
/// line; unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockCommander {
    calls: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
}

impl MockCommander {
    /// Configure the output served for command lines starting with
    /// `prefix`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(prefix.to_string(), output);
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether any recorded command line starts with `prefix`.
    pub fn saw(&self, prefix: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with(prefix))
    }

    fn record(&self, argv: &[&str]) -> CommandOutput {
        let line = argv.join(" ");
        self.calls.lock().unwrap().push(line.clone());

        let responses = self.responses.lock().unwrap();
        let mut best: Option<(&String, &CommandOutput)> = None;
        for (prefix, output) in responses.iter() {
            if line.starts_with(prefix.as_str())
                && best.map_or(true, |(b, _)| prefix.len() > b.len())
            {
                best = Some((prefix, output));
            }
        }
        best.map(|(_, o)| o.clone()).unwrap_or_default()
    }
}
