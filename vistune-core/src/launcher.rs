//! Subprocess launching for the external trainer and merge utility.
//!
//! Stages run with inherited stdio so the trainer's own progress output
//! reaches the terminal. The child is killed when the runner gives up on it
//! (timeout, Ctrl-C, or the future being dropped).

use crate::error::VistuneError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Value following `flag` in the argument list, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Render as a copy-pasteable shell line, environment first.
    pub fn shell_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote a word for POSIX shells when it contains anything beyond a safe set.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Result of a successful stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: i32,
    pub duration: Duration,
}

/// Something that can execute a [`LaunchCommand`] to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the command; any non-success outcome is an error.
    async fn run(&self, command: &LaunchCommand) -> Result<ExitReport, VistuneError>;
}

/// Runs commands as tokio child processes.
#[derive(Debug, Clone, Default)]
pub struct TokioRunner {
    timeout: Option<Duration>,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Interrupted,
    TimedOut,
}

impl TokioRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Run `command`, stopping it when `interrupt` resolves first.
    pub async fn run_until<F>(
        &self,
        command: &LaunchCommand,
        interrupt: F,
    ) -> Result<ExitReport, VistuneError>
    where
        F: Future<Output = ()> + Send,
    {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        info!(command = %command, "Launching");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| VistuneError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        match supervise(&mut child, interrupt, self.timeout).await? {
            Outcome::Exited(status) if status.success() => {
                let duration = started.elapsed();
                info!(
                    program = %command.program,
                    elapsed_secs = duration.as_secs(),
                    "Stage finished"
                );
                Ok(ExitReport {
                    code: status.code().unwrap_or(0),
                    duration,
                })
            }
            Outcome::Exited(status) => Err(VistuneError::ProcessFailed {
                program: command.program.clone(),
                code: status.code(),
            }),
            Outcome::Interrupted => {
                warn!(program = %command.program, "Interrupted, stopping child");
                let _ = child.kill().await;
                Err(VistuneError::Cancelled(format!(
                    "'{}' interrupted",
                    command.program
                )))
            }
            Outcome::TimedOut => {
                let _ = child.kill().await;
                Err(VistuneError::Timeout(format!(
                    "'{}' did not finish within {}s",
                    command.program,
                    self.timeout.map(|t| t.as_secs()).unwrap_or_default()
                )))
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(&self, command: &LaunchCommand) -> Result<ExitReport, VistuneError> {
        // A failed handler install must not read as an interrupt.
        let interrupt = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        self.run_until(command, interrupt).await
    }
}

/// Wait for the child, an interrupt, or the deadline, whichever comes first.
async fn supervise<F>(
    child: &mut Child,
    interrupt: F,
    timeout: Option<Duration>,
) -> std::io::Result<Outcome>
where
    F: Future<Output = ()>,
{
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    Ok(tokio::select! {
        status = child.wait() => Outcome::Exited(status?),
        _ = interrupt => Outcome::Interrupted,
        _ = deadline => Outcome::TimedOut,
    })
}
