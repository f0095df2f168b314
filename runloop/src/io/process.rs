//! Child process execution with bounded, concurrently drained output.
//!
//! [`ProcessRunner`] is the seam between adapters and the OS. Adapters only
//! build argv/env and interpret output; tests swap in a recording runner.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;
/// Bytes kept from the end of a stream that overflowed its limit.
pub const TAIL_BYTES: usize = 64 * 1024;
/// How long readers may stay open after the child exits.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
const CHUNK_BYTES: usize = 8192;

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Bytes of stdout (and separately stderr) kept in memory.
    pub output_limit_bytes: usize,
    /// Mirror output to the terminal while capturing it.
    pub echo: bool,
    /// Literals looked for across the whole of each stream, past the limit too.
    pub watch: Vec<String>,
}

impl ProcessRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            echo: false,
            watch: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Report whether `literal` shows up anywhere in stdout or stderr.
    #[must_use]
    pub fn with_watch(mut self, literal: impl Into<String>) -> Self {
        let literal = literal.into();
        if !self.watch.contains(&literal) {
            self.watch.push(literal);
        }
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    fn command(&self) -> Result<Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process exposed no exit code (killed by a signal or timeout).
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Last bytes of stdout past the kept head. Empty unless stdout was truncated.
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Watched literals that appeared anywhere in either stream.
    pub watched: BTreeSet<String>,
}

impl ProcessOutput {
    /// Output for a process that exited with `exit_code` and printed `stdout`.
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            success: exit_code == 0,
            timed_out: false,
            stdout_truncated: 0,
            stderr_truncated: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            watched: BTreeSet::new(),
        }
    }

    /// Whether `literal` was watched for and seen, including past the output limit.
    pub fn saw(&self, literal: &str) -> bool {
        self.watched.contains(literal)
    }
}

/// Executes external commands.
///
/// Non-zero exits are reported through [`ProcessOutput`], never as `Err`.
/// `Err` means the process could not be started or waited on at all.
pub trait ProcessRunner {
    /// Run to completion, capturing stdout and stderr.
    fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput>;

    /// Run attached to the current terminal and return the exit code.
    fn run_interactive(&self, request: &ProcessRequest) -> Result<i32>;
}

/// [`ProcessRunner`] backed by `std::process`.
///
/// Captured runs get their own process group. A timeout kills the whole
/// group, and so does output that stays open after the child has exited.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    #[instrument(skip_all, fields(program = %request.program(), timeout_secs = request.timeout.as_secs(), echo = request.echo))]
    fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput> {
        let mut cmd = request.command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {}", request.program()));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        spawn_reader(
            Stream::Stdout,
            stdout,
            StreamCapture::new(request.output_limit_bytes, &request.watch),
            request.echo.then(std::io::stdout),
            tx.clone(),
        );
        spawn_reader(
            Stream::Stderr,
            stderr,
            StreamCapture::new(request.output_limit_bytes, &request.watch),
            request.echo.then(std::io::stderr),
            tx,
        );

        let mut timed_out = false;
        let status = match child
            .wait_timeout(request.timeout)
            .context("wait for command")?
        {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = request.timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
                terminate(&mut child)?;
                child.wait().context("wait command after kill")?
            }
        };

        let (stdout, stderr) = collect_streams(&rx, child.id())?;
        if stdout.truncated > 0 || stderr.truncated > 0 {
            warn!(
                stdout_truncated = stdout.truncated,
                stderr_truncated = stderr.truncated,
                "output truncated"
            );
        }

        let exit_code = exit_code(status, timed_out);
        debug!(exit_code, timed_out, "command finished");
        let mut watched = stdout.seen;
        watched.extend(stderr.seen);
        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&stdout.head).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.head).into_owned(),
            exit_code,
            success: exit_code == 0,
            timed_out,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            stdout_tail: String::from_utf8_lossy(&stdout.tail).into_owned(),
            stderr_tail: String::from_utf8_lossy(&stderr.tail).into_owned(),
            watched,
        })
    }

    #[instrument(skip_all, fields(program = %request.program()))]
    fn run_interactive(&self, request: &ProcessRequest) -> Result<i32> {
        let mut cmd = request.command()?;
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        debug!("spawning interactive process");
        let status = cmd
            .status()
            .with_context(|| format!("run {}", request.program()))?;
        let code = exit_code(status, false);
        debug!(exit_code = code, "interactive process finished");
        Ok(code)
    }
}

fn exit_code(status: ExitStatus, timed_out: bool) -> i32 {
    if timed_out {
        return -1;
    }
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Kill the child's process group, falling back to the child alone.
fn terminate(child: &mut Child) -> Result<()> {
    if kill_process_group(child.id()) {
        return Ok(());
    }
    child.kill().context("kill command")
}

/// SIGKILL every process in group `pgid`. Returns `false` when nothing was signalled.
#[cfg(unix)]
fn kill_process_group(pgid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pgid, err = %err, "failed to kill process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) -> bool {
    false
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

type StreamMessage = (Stream, Result<CapturedStream>);

fn spawn_reader<R, W>(
    stream: Stream,
    reader: R,
    capture: StreamCapture,
    echo: Option<W>,
    tx: mpsc::Sender<StreamMessage>,
) where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let result = drain_stream(reader, capture, echo);
        // The receiver is gone only if `run` already bailed out.
        let _ = tx.send((stream, result));
    });
}

/// Wait for both readers. Once the child has exited, readers get
/// [`OUTPUT_GRACE`] to reach EOF before the rest of its group is killed.
fn collect_streams(
    rx: &mpsc::Receiver<StreamMessage>,
    pgid: u32,
) -> Result<(CapturedStream, CapturedStream)> {
    let deadline = Instant::now() + OUTPUT_GRACE;
    let mut stdout = None;
    let mut stderr = None;
    let mut group_killed = false;

    while stdout.is_none() || stderr.is_none() {
        let (stream, result) = if group_killed {
            rx.recv()
                .map_err(|_| anyhow!("output reader thread panicked"))?
        } else {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        grace_secs = OUTPUT_GRACE.as_secs(),
                        "output still open after exit, killing process group"
                    );
                    kill_process_group(pgid);
                    group_killed = true;
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => bail!("output reader thread panicked"),
            }
        };
        let captured = result.with_context(|| format!("read {}", stream.name()))?;
        match stream {
            Stream::Stdout => stdout = Some(captured),
            Stream::Stderr => stderr = Some(captured),
        }
    }

    match (stdout, stderr) {
        (Some(stdout), Some(stderr)) => Ok((stdout, stderr)),
        _ => bail!("output reader finished without a result"),
    }
}

/// What one reader kept from its stream.
#[derive(Debug, Default)]
struct CapturedStream {
    /// First `limit` bytes.
    head: Vec<u8>,
    /// Last [`TAIL_BYTES`] bytes past the head.
    tail: Vec<u8>,
    /// Bytes that did not fit in the head.
    truncated: usize,
    seen: BTreeSet<String>,
}

/// Incremental capture of one stream: a bounded head, a bounded tail, and a
/// scan for watched literals over every byte.
#[derive(Debug)]
struct StreamCapture {
    limit: usize,
    watch: Vec<String>,
    /// Bytes of the previous chunk kept so a literal split across reads still matches.
    overlap: usize,
    carry: Vec<u8>,
    captured: CapturedStream,
}

impl StreamCapture {
    fn new(limit: usize, watch: &[String]) -> Self {
        let overlap = watch
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .saturating_sub(1);
        Self {
            limit,
            watch: watch.to_vec(),
            overlap,
            carry: Vec::new(),
            captured: CapturedStream::default(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.scan(chunk);

        let captured = &mut self.captured;
        let keep = chunk.len().min(self.limit.saturating_sub(captured.head.len()));
        captured.head.extend_from_slice(&chunk[..keep]);
        let rest = &chunk[keep..];
        if rest.is_empty() {
            return;
        }
        captured.truncated += rest.len();
        captured.tail.extend_from_slice(rest);
        let excess = captured.tail.len().saturating_sub(TAIL_BYTES);
        captured.tail.drain(..excess);
    }

    fn scan(&mut self, chunk: &[u8]) {
        if self.watch.is_empty() {
            return;
        }
        self.carry.extend_from_slice(chunk);
        for literal in &self.watch {
            if self.captured.seen.contains(literal) {
                continue;
            }
            if contains_bytes(&self.carry, literal.as_bytes()) {
                self.captured.seen.insert(literal.clone());
            }
        }
        let excess = self.carry.len().saturating_sub(self.overlap);
        self.carry.drain(..excess);
    }

    fn finish(self) -> CapturedStream {
        self.captured
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Read `reader` to EOF chunk by chunk, mirroring each chunk to `echo`.
fn drain_stream<R: Read, W: Write>(
    reader: R,
    mut capture: StreamCapture,
    mut echo: Option<W>,
) -> Result<CapturedStream> {
    let mut reader = BufReader::with_capacity(CHUNK_BYTES, reader);
    loop {
        let chunk = match reader.fill_buf() {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };
        if let Some(sink) = echo.as_mut() {
            echo_chunk(sink, chunk);
        }
        capture.push(chunk);
        let n = chunk.len();
        reader.consume(n);
    }
    Ok(capture.finish())
}

fn echo_chunk<W: Write>(sink: &mut W, chunk: &[u8]) {
    if let Err(e) = sink.write_all(chunk).and_then(|()| sink.flush()) {
        warn!(err = %e, "failed to echo output");
    }
}
