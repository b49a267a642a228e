//! External command execution.
//!
//! `Cmd` is a small builder around [`std::process::Command`] that resolves
//! the program on PATH first (a missing tool is reported as
//! [`AssemblyError::ToolUnavailable`] instead of a spawn error), captures
//! output, and can bound the run time.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::AssemblyError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for an external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    timeout: Option<Duration>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            timeout: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prefixed to the error when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Kill the command if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Return a non-zero exit as a [`CommandResult`] instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn run(&self) -> Result<CommandResult> {
        let program = ensure_exists(&self.program)?;
        debug!(command = %self.display(), "running");

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {}", program.display()))?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for {}", self.program))?
            {
                break status;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "{} timed out after {}s",
                    self.display(),
                    self.timeout.unwrap_or_default().as_secs()
                );
            }
            thread::sleep(POLL_INTERVAL);
        };

        let result = CommandResult {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("{} failed", self.program));
            bail!("{msg} ({}): {}", result.status, result.stderr.trim());
        }
        Ok(result)
    }
}

/// Resolve `tool` on PATH.
pub fn ensure_exists(tool: &str) -> Result<PathBuf> {
    which::which(tool).map_err(|_| {
        AssemblyError::ToolUnavailable {
            tool: tool.to_string(),
        }
        .into()
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
