//! Child-process plumbing shared by the relay, capture, probe and remux paths.
//!
//! External tools are configured as a program plus optional leading
//! arguments (`RELAY_BIN="stdbuf -oL srt-live-transmit"`). Long-lived
//! children are spawned with their output piped into a line channel so a
//! single observation task can consume stdout and stderr together.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::AgentError;

/// Lines retained per process for crash reports.
pub const OUTPUT_BUFFER_LINES: usize = 50;

/// Maximum length of the output tail copied into an error message.
pub const CRASH_TAIL_CHARS: usize = 500;

/// Capacity of the line channel between reader tasks and the observer.
const LINE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// ExternalTool
// ---------------------------------------------------------------------------

/// An external program the agent supervises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Parse a whitespace-separated command line such as `"ffmpeg -hide_banner"`.
    pub fn parse(value: &str) -> Result<Self, AgentError> {
        let mut parts = value.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| AgentError::Config("tool command must not be empty".into()))?;
        Ok(Self {
            program,
            leading_args: parts.collect(),
        })
    }

    /// A [`Command`] for this tool with the leading arguments applied.
    ///
    /// The child is killed if its handle is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Convert a spawn failure into a launch error naming this tool.
    pub fn launch_error(&self, e: &std::io::Error) -> AgentError {
        AgentError::ProcessLaunch {
            tool: self.program.clone(),
            reason: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputBuffer
// ---------------------------------------------------------------------------

/// Ring buffer of the most recent output lines of one process.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(OUTPUT_BUFFER_LINES)
    }
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The newest output joined by newlines, cut to the last `max_chars`.
    pub fn tail(&self, max_chars: usize) -> String {
        let joined = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let count = joined.chars().count();
        if count <= max_chars {
            return joined;
        }
        joined.chars().skip(count - max_chars).collect()
    }
}

// ---------------------------------------------------------------------------
// Spawning and termination
// ---------------------------------------------------------------------------

/// A spawned child whose output arrives line by line on `lines`.
///
/// `lines` closes once every piped stream has reached EOF.
pub struct ObservedChild {
    pub child: Child,
    pub pid: i32,
    pub lines: mpsc::Receiver<String>,
}

/// Where a spawned child's stdout goes.
pub enum Stdout<'a> {
    /// Piped into the line channel together with stderr.
    Observed,
    /// Written to a file; only stderr is observed.
    File(&'a Path),
}

/// Spawn `tool` with `args` and start forwarding its output lines.
pub async fn spawn_observed(
    tool: &ExternalTool,
    args: &[String],
    stdout: Stdout<'_>,
) -> Result<ObservedChild, AgentError> {
    let mut cmd = tool.command();
    cmd.args(args).stderr(Stdio::piped());
    match stdout {
        Stdout::Observed => {
            cmd.stdout(Stdio::piped());
        }
        Stdout::File(path) => {
            let file = tokio::fs::File::create(path).await?;
            cmd.stdout(file.into_std().await);
        }
    }

    let mut child = cmd.spawn().map_err(|e| tool.launch_error(&e))?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .ok_or_else(|| AgentError::ProcessLaunch {
            tool: tool.program.clone(),
            reason: "process exited before its pid could be read".into(),
        })?;

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    if let Some(out) = child.stdout.take() {
        tokio::spawn(forward_lines(out, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_lines(err, tx));
    }

    Ok(ObservedChild {
        child,
        pid,
        lines: rx,
    })
}

async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}

/// Ask `child` to exit with `signal`, escalating to SIGKILL after `grace`.
pub async fn terminate(
    child: &mut Child,
    pid: i32,
    signal: libc::c_int,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    // SAFETY: `pid` belongs to a child we have not reaped yet, so it cannot
    // have been recycled for another process.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "Signal delivery failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid, grace_secs = grace.as_secs(), "Process ignored termination signal, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Human-readable exit description: `exit code 1` or `signal 9`.
pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown exit status".to_string(),
    }
}

/// Crash message with the output tail appended when there is one.
pub fn crash_message(what: &str, status: &ExitStatus, output: &OutputBuffer) -> String {
    let tail = output.tail(CRASH_TAIL_CHARS);
    if tail.is_empty() {
        format!("{what} exited with {}", describe_exit(status))
    } else {
        format!("{what} exited with {}: {tail}", describe_exit(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_with_leading_args() {
        let tool = ExternalTool::parse("stdbuf -oL srt-live-transmit").unwrap();
        assert_eq!(tool.program, "stdbuf");
        assert_eq!(tool.leading_args, vec!["-oL", "srt-live-transmit"]);
        assert!(ExternalTool::parse("   ").is_err());
    }

    #[test]
    fn buffer_keeps_newest_lines() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.tail(1000), "line 2\nline 3\nline 4");
    }

    #[test]
    fn tail_is_cut_from_the_front() {
        let mut buf = OutputBuffer::default();
        buf.push("a".repeat(600));
        buf.push("end");
        let tail = buf.tail(CRASH_TAIL_CHARS);
        assert_eq!(tail.chars().count(), CRASH_TAIL_CHARS);
        assert!(tail.ends_with("\nend"));
    }

    #[tokio::test]
    async fn observed_child_forwards_both_streams() {
        let tool = ExternalTool::new("/bin/sh");
        let args = vec!["-c".to_string(), "echo out; echo err >&2".to_string()];
        let mut observed = spawn_observed(&tool, &args, Stdout::Observed).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = observed.lines.recv().await {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        assert!(observed.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let tool = ExternalTool::new("/nonexistent/srt-live-transmit");
        let result = spawn_observed(&tool, &[], Stdout::Observed).await;
        assert!(matches!(result, Err(AgentError::ProcessLaunch { .. })));
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let tool = ExternalTool::new("/bin/sh");
        let args = vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()];
        let mut observed = spawn_observed(&tool, &args, Stdout::Observed).await.unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = terminate(
            &mut observed.child,
            observed.pid,
            libc::SIGTERM,
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert!(!status.success());
    }
}
