//! External command execution
//!
//! Every process the pipeline starts goes through [`CommandRunner`]. The
//! production [`ProcessRunner`] connects stdout and stderr to one pipe so the
//! captured text keeps the order the process wrote it in, runs the child as
//! the leader of its own process group, and kills the whole group when the
//! timeout expires.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long to keep reading after a timed-out process group was killed
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8 * 1024;

/// Captured output kept per command; older bytes are dropped first
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `None` runs in the service's own working directory
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    ExitedZero,

    /// Non-zero exit, killed by a signal, or the program could not be launched
    ExitedNonZero { code: Option<i32> },

    TimedOut { after: Duration },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::ExitedZero)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::ExitedZero => write!(f, "exited successfully"),
            CommandOutcome::ExitedNonZero { code: Some(code) } => {
                write!(f, "exited with status {}", code)
            }
            CommandOutcome::ExitedNonZero { code: None } => {
                write!(f, "exited without a status code")
            }
            CommandOutcome::TimedOut { after } => write!(f, "timed out after {:?}", after),
        }
    }
}

/// Captured combined output and outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub outcome: CommandOutcome,
}

impl CommandOutput {
    pub fn new(output: impl Into<String>, outcome: CommandOutcome) -> Self {
        Self {
            output: output.into(),
            outcome,
        }
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion or until its timeout
    async fn run(&self, spec: &CommandSpec) -> CommandOutput;

    /// Kill every command still running. Returns how many were signalled.
    fn terminate_all(&self) -> usize {
        0
    }
}

/// Runs commands as local child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Process groups of the commands currently running
    groups: Arc<Mutex<HashSet<u32>>>,
    output_limit: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashSet::new())),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Keep at most `limit` bytes of each command's output
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Number of commands currently running
    pub fn running(&self) -> usize {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Registers a running process group for the lifetime of the guard
struct GroupGuard<'a> {
    groups: &'a Mutex<HashSet<u32>>,
    pgid: Option<u32>,
}

impl<'a> GroupGuard<'a> {
    fn register(groups: &'a Mutex<HashSet<u32>>, pgid: Option<u32>) -> Self {
        if let Some(pgid) = pgid {
            groups.lock().unwrap_or_else(|e| e.into_inner()).insert(pgid);
        }
        Self { groups, pgid }
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            self.groups
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&pgid);
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> CommandOutput {
        let started = Instant::now();
        debug!("Running `{}` (timeout {:?})", spec.display(), spec.timeout);

        let (child, reader) = match spawn(spec) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Failed to launch `{}`: {}", spec.display(), e);
                return CommandOutput::new(
                    format!("failed to launch {}: {}\n", spec.program, e),
                    CommandOutcome::ExitedNonZero { code: None },
                );
            }
        };

        let guard = GroupGuard::register(&self.groups, child.id());
        let mut output = CapturedOutput::new(self.output_limit);
        let outcome = supervise(child, reader, spec.timeout, &mut output).await;
        drop(guard);

        info!(
            "`{}` {} in {:?}",
            spec.display(),
            outcome,
            started.elapsed()
        );

        CommandOutput::new(output.into_string(), outcome)
    }

    fn terminate_all(&self) -> usize {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        for pgid in groups.iter() {
            warn!("Killing process group {}", pgid);
            kill_group(*pgid);
        }
        groups.len()
    }
}

/// Tail of a command's output, bounded by a byte limit
struct CapturedOutput {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl CapturedOutput {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        // Trim in batches to avoid shifting the buffer on every chunk
        if self.bytes.len() > self.limit.saturating_mul(2).max(READ_CHUNK) {
            self.trim();
        }
    }

    fn trim(&mut self) {
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    fn into_string(mut self) -> String {
        self.trim();
        let text = String::from_utf8_lossy(&self.bytes);
        if self.dropped == 0 {
            text.into_owned()
        } else {
            format!(
                "[output truncated: {} earlier bytes dropped]\n{}",
                self.dropped, text
            )
        }
    }
}

fn spawn(spec: &CommandSpec) -> io::Result<(Child, pipe::Receiver)> {
    let (reader, writer) = io::pipe()?;
    let stderr_writer = writer.try_clone()?;

    let mut std_command = std::process::Command::new(&spec.program);
    std_command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(stderr_writer))
        .process_group(0);

    if let Some(dir) = spec
        .working_dir
        .as_ref()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        std_command.current_dir(dir);
    }

    let mut command = Command::from(std_command);
    command.kill_on_drop(true);

    let child = command.spawn()?;

    // The command still owns the parent's write ends; EOF only arrives once they are closed.
    drop(command);

    let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((child, reader))
}

async fn supervise(
    mut child: Child,
    mut reader: pipe::Receiver,
    timeout: Duration,
    output: &mut CapturedOutput,
) -> CommandOutcome {
    let finished = tokio::time::timeout(timeout, async {
        read_until_eof(&mut reader, output).await?;
        child.wait().await
    })
    .await;

    match finished {
        Ok(Ok(status)) => classify(status),
        Ok(Err(e)) => {
            warn!("Lost track of child process: {}", e);
            terminate(&mut child).await;
            output.push(format!("\nfailed to collect process output: {}\n", e).as_bytes());
            CommandOutcome::ExitedNonZero { code: None }
        }
        Err(_) => {
            warn!("Command timed out after {:?}, killing process group", timeout);
            terminate(&mut child).await;
            let _ = tokio::time::timeout(DRAIN_GRACE, read_until_eof(&mut reader, output)).await;
            CommandOutcome::TimedOut { after: timeout }
        }
    }
}

/// Reads in chunks so bytes already read survive cancellation.
async fn read_until_eof(
    reader: &mut pipe::Receiver,
    output: &mut CapturedOutput,
) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        output.push(&chunk[..n]);
    }
}

fn kill_group(pgid: u32) {
    // SAFETY: killpg only sends a signal; the group id is the child's pid
    // because it was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "killpg({}) failed: {}",
            pgid,
            io::Error::last_os_error()
        );
    }
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }

    if let Err(e) = child.kill().await {
        debug!("Child already gone: {}", e);
    }
}

fn classify(status: ExitStatus) -> CommandOutcome {
    if status.success() {
        CommandOutcome::ExitedZero
    } else {
        CommandOutcome::ExitedNonZero {
            code: status.code(),
        }
    }
}
