//! Typed invocation of external host tools.
//!
//! Every tool the pipeline drives (`hostname`, `ip`, `cp`, `qemu-img`,
//! `genisoimage`, `virt-install`) is described by a [`ToolCommand`]: a
//! program plus an argument vector. Nothing is ever composed into a shell
//! string, so user-supplied values such as the VM name cannot change the
//! shape of a command line.
//!
//! Commands are executed through the [`ToolRunner`] trait. [`HostRunner`]
//! is the real implementation; tests substitute a recording fake.

use std::fmt;
use std::io::{Read, Seek};
use std::process::{Command, Stdio};

use color_eyre::eyre::{Context, Result};

/// An external program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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
}

/// Renders a shell-quoted form, for logs and error messages only.
impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(self.args.iter());
        for (i, word) in words.enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match shlex::try_quote(word) {
                Ok(quoted) => f.write_str(&quoted)?,
                Err(_) => f.write_str(word)?,
            }
        }
        Ok(())
    }
}

/// Captured result of a successful tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
}

/// A tool exited unsuccessfully. The tool's own diagnostic is kept verbatim.
#[derive(Debug, thiserror::Error)]
#[error("`{command}` failed ({status})\n{stderr}")]
pub struct ToolError {
    pub command: String,
    pub status: String,
    pub stderr: String,
}

/// Executes [`ToolCommand`]s. A non-zero exit status is an error.
pub trait ToolRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput>;
}

impl dyn ToolRunner + '_ {
    /// Run the command and parse its stdout as JSON.
    pub fn run_and_parse_json<T: serde::de::DeserializeOwned>(
        &self,
        cmd: &ToolCommand,
    ) -> Result<T> {
        let output = self.run(cmd)?;
        serde_json::from_str(&output.stdout)
            .with_context(|| format!("Parsing JSON output of `{cmd}`"))
    }
}

/// Runs tools as child processes of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl ToolRunner for HostRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        let mut stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;
        tracing::debug!("exec: {cmd}");
        let status = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?)
            .status()
            .with_context(|| format!("Failed to execute {}", cmd.program))?;
        if !status.success() {
            return Err(ToolError {
                command: cmd.to_string(),
                status: status.to_string(),
                stderr: stderr_tail(stderr),
            }
            .into());
        }
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut out = String::new();
        stdout
            .read_to_string(&mut out)
            .with_context(|| format!("Reading output of {}", cmd.program))?;
        Ok(ToolOutput { stdout: out })
    }
}

/// Trailing bytes of a tool's stderr kept in a [`ToolError`].
const STDERR_TAIL_BYTES: u64 = 1024;

/// The last [`STDERR_TAIL_BYTES`] of `f`, lossily decoded and trimmed.
fn stderr_tail(mut f: std::fs::File) -> String {
    let len = match f.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            tracing::warn!("Unable to stat captured stderr: {e}");
            0
        }
    };
    let start = len.saturating_sub(STDERR_TAIL_BYTES);
    let mut tail = Vec::new();
    if let Err(e) = f
        .seek(std::io::SeekFrom::Start(start))
        .and_then(|_| f.read_to_end(&mut tail))
    {
        tracing::warn!("Unable to read captured stderr: {e}");
        return "<failed to read stderr>".to_owned();
    }
    String::from_utf8_lossy(&tail).trim_end().to_owned()
}
