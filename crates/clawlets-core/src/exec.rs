//! Bounded child process execution.
//!
//! Two entry points share one run loop and one failure model:
//!
//! - [`exec_capture_tail`] keeps the last N bytes of stdout and stderr.
//! - [`exec_capture_stdout`] needs the complete stdout and fails outright if
//!   it grows past the hard cap. Stderr is still tail-captured.
//!
//! A child that exceeds its time budget, overflows the stdout cap, or is
//! cancelled gets `SIGTERM`, then `SIGKILL` after [`KILL_GRACE`]. The call
//! settles exactly once, after the child has exited, so a termination error
//! always carries the child's final [`ExitInfo`]. A child that exits non-zero
//! on its own is a successful call with a non-zero `exit_code`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecError, ExitInfo};
use crate::tail::{CappedBuffer, TailBuffer};

/// Time between `SIGTERM` and `SIGKILL` for a child being terminated.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Default time budget for a child process.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default stdout budget (tail size or hard cap, depending on entry point).
pub const DEFAULT_MAX_STDOUT_BYTES: usize = 1024 * 1024;

/// Default stderr tail size.
pub const DEFAULT_MAX_STDERR_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8192;

/// How long to keep reading pipes after a terminated child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Stand-in for "never" when a budget does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + budget`, saturating to a far-future instant instead of
/// overflowing on huge budgets.
#[must_use]
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// What the child sees on its standard input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// `/dev/null`.
    #[default]
    Ignore,
    /// The runner's own stdin.
    Inherit,
}

/// Description of one child process run.
///
/// Built with chained setters:
///
/// ```rust,no_run
/// use std::time::Duration;
/// use clawlets_core::exec::{ExecSpec, exec_capture_tail};
///
/// # async fn example() -> Result<(), clawlets_core::error::ExecError> {
/// let spec = ExecSpec::new("journalctl")
///     .args(["-u", "app", "-n", "200"])
///     .timeout(Duration::from_secs(10))
///     .max_stdout_bytes(16 * 1024);
/// let result = exec_capture_tail(&spec).await?;
/// println!("{}", result.stdout_tail);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ExecSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    stdin: StdinMode,
    timeout: Duration,
    max_stdout_bytes: usize,
    max_stderr_bytes: usize,
    cancel: Option<CancellationToken>,
}

impl ExecSpec {
    /// Start a spec for `program` with default limits.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: None,
            stdin: StdinMode::default(),
            timeout: DEFAULT_TIMEOUT,
            max_stdout_bytes: DEFAULT_MAX_STDOUT_BYTES,
            max_stderr_bytes: DEFAULT_MAX_STDERR_BYTES,
            cancel: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory for the child.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set one environment variable.
    ///
    /// Once any variable is set, the child's environment is exactly the set
    /// variables; nothing is inherited from the runner.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set several environment variables. Same replacement rule as [`env`](Self::env).
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = self.env.get_or_insert_with(BTreeMap::new);
        for (key, value) in vars {
            env.insert(key.into(), value.into());
        }
        self
    }

    #[must_use]
    pub fn stdin(mut self, mode: StdinMode) -> Self {
        self.stdin = mode;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_stdout_bytes(mut self, max: usize) -> Self {
        self.max_stdout_bytes = max;
        self
    }

    #[must_use]
    pub fn max_stderr_bytes(mut self, max: usize) -> Self {
        self.max_stderr_bytes = max;
        self
    }

    /// Terminate the child when `token` is cancelled.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The program being run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(match self.stdin {
                StdinMode::Ignore => Stdio::null(),
                StdinMode::Inherit => Stdio::inherit(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }
        cmd
    }
}

impl fmt::Debug for ExecSpec {
    // Environment values usually carry secrets; only the names are shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field(
                "env_keys",
                &self.env.as_ref().map(|env| env.keys().collect::<Vec<_>>()),
            )
            .field("stdin", &self.stdin)
            .field("timeout", &self.timeout)
            .field("max_stdout_bytes", &self.max_stdout_bytes)
            .field("max_stderr_bytes", &self.max_stderr_bytes)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Result of [`exec_capture_tail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl TailOutput {
    #[must_use]
    pub fn exit_info(&self) -> ExitInfo {
        ExitInfo {
            exit_code: self.exit_code,
            signal: self.signal,
        }
    }

    /// Whether the child exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Result of [`exec_capture_stdout`]. `stdout_truncated` is always `false`;
/// overflowing stdout is an error instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StdoutOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr_tail: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl StdoutOutput {
    #[must_use]
    pub fn exit_info(&self) -> ExitInfo {
        ExitInfo {
            exit_code: self.exit_code,
            signal: self.signal,
        }
    }

    /// Whether the child exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command keeping only the tail of each output stream.
///
/// # Errors
///
/// - [`ExecError::Spawn`] if the program cannot be started.
/// - [`ExecError::Io`] if reading its output or waiting on it fails.
/// - [`ExecError::Timeout`] / [`ExecError::Cancelled`] if the child had to be
///   terminated; `cause` holds its final exit state.
pub async fn exec_capture_tail(spec: &ExecSpec) -> Result<TailOutput, ExecError> {
    let captured = run(spec, StdoutCapture::Tail(TailBuffer::new(spec.max_stdout_bytes))).await?;
    let (stdout, stdout_truncated) = captured.stdout.into_parts();

    Ok(TailOutput {
        exit_code: captured.exit.exit_code,
        signal: captured.exit.signal,
        duration_ms: captured.duration_ms,
        stdout_tail: String::from_utf8_lossy(&stdout).into_owned(),
        stderr_tail: captured.stderr.to_string_lossy(),
        stdout_truncated,
        stderr_truncated: captured.stderr.is_truncated(),
    })
}

/// Run a command whose complete stdout is needed.
///
/// # Errors
///
/// Same as [`exec_capture_tail`], plus [`ExecError::StdoutLimitExceeded`]
/// when stdout grows past `max_stdout_bytes`. The child is terminated in
/// that case and no partial stdout is returned.
pub async fn exec_capture_stdout(spec: &ExecSpec) -> Result<StdoutOutput, ExecError> {
    let captured = run(spec, StdoutCapture::Full(CappedBuffer::new(spec.max_stdout_bytes))).await?;
    let (stdout, stdout_truncated) = captured.stdout.into_parts();

    Ok(StdoutOutput {
        exit_code: captured.exit.exit_code,
        signal: captured.exit.signal,
        duration_ms: captured.duration_ms,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr_tail: captured.stderr.to_string_lossy(),
        stdout_truncated,
        stderr_truncated: captured.stderr.is_truncated(),
    })
}

enum StdoutCapture {
    Tail(TailBuffer),
    Full(CappedBuffer),
}

impl StdoutCapture {
    /// Returns `false` once a hard cap has been exceeded.
    fn push(&mut self, chunk: &[u8]) -> bool {
        match self {
            Self::Tail(tail) => {
                tail.push(chunk);
                true
            }
            Self::Full(buf) => buf.push(chunk).is_ok(),
        }
    }

    fn into_parts(self) -> (Vec<u8>, bool) {
        match self {
            Self::Tail(tail) => {
                let truncated = tail.is_truncated();
                (tail.to_vec(), truncated)
            }
            Self::Full(buf) => (buf.into_inner(), false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Timeout,
    StdoutOverflow,
    Cancelled,
}

struct Captured {
    exit: ExitInfo,
    duration_ms: u64,
    stdout: StdoutCapture,
    stderr: TailBuffer,
}

async fn run(spec: &ExecSpec, mut stdout_sink: StdoutCapture) -> Result<Captured, ExecError> {
    let started = Instant::now();
    let deadline = deadline_after(started, spec.timeout);

    let mut child = spec.command().spawn().map_err(|e| ExecError::Spawn {
        program: spec.program.clone(),
        reason: e.to_string(),
    })?;
    debug!(program = %spec.program, pid = ?child.id(), "child spawned");

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stderr_tail = TailBuffer::new(spec.max_stderr_bytes);
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    let mut exited: Option<ExitInfo> = None;
    let mut termination: Option<Termination> = None;
    let mut kill_at: Option<Instant> = None;

    let exit = loop {
        if let Some(info) = exited {
            // A terminated child settles on exit; a normal one waits for EOF
            // on both pipes so no trailing output is lost.
            if termination.is_some() || (stdout.is_none() && stderr.is_none()) {
                break info;
            }
        }

        let mut begin = None;
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => match read {
                Ok(0) => stdout = None,
                Ok(n) => {
                    if !stdout_sink.push(&out_buf[..n]) {
                        stdout = None;
                        begin = Some(Termination::StdoutOverflow);
                    }
                }
                Err(e) => return Err(io_error(spec, &e)),
            },
            read = read_chunk(&mut stderr, &mut err_buf) => match read {
                Ok(0) => stderr = None,
                Ok(n) => stderr_tail.push(&err_buf[..n]),
                Err(e) => return Err(io_error(spec, &e)),
            },
            status = child.wait(), if exited.is_none() => {
                let status = status.map_err(|e| io_error(spec, &e))?;
                exited = Some(exit_info(status));
            }
            () = sleep_until(deadline), if termination.is_none() => {
                begin = Some(Termination::Timeout);
            }
            () = cancelled(spec.cancel.as_ref()), if termination.is_none() => {
                begin = Some(Termination::Cancelled);
            }
            () = sleep_until(kill_at.unwrap_or(deadline)), if kill_at.is_some() && exited.is_none() => {
                warn!(program = %spec.program, "child survived SIGTERM, sending SIGKILL");
                if let Err(e) = child.start_kill() {
                    debug!(program = %spec.program, error = %e, "SIGKILL failed");
                }
                kill_at = None;
            }
        }

        if let (Some(reason), None) = (begin, termination) {
            termination = Some(reason);
            if exited.is_none() {
                debug!(program = %spec.program, reason = ?reason, "terminating child");
                if let Err(e) = send_sigterm(&mut child) {
                    debug!(program = %spec.program, error = %e, "SIGTERM failed");
                }
                kill_at = Some(Instant::now() + KILL_GRACE);
            }
        }
    };

    if termination.is_some()
        && timeout(
            DRAIN_TIMEOUT,
            drain(&mut stdout, &mut stderr, &mut stdout_sink, &mut stderr_tail),
        )
        .await
        .is_err()
    {
        debug!(program = %spec.program, "output pipes still open after exit");
    }

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let Some(reason) = termination else {
        debug!(
            program = %spec.program,
            exit_code = ?exit.exit_code,
            signal = ?exit.signal,
            duration_ms,
            "child exited"
        );
        return Ok(Captured {
            exit,
            duration_ms,
            stdout: stdout_sink,
            stderr: stderr_tail,
        });
    };

    warn!(
        program = %spec.program,
        reason = ?reason,
        exit_code = ?exit.exit_code,
        signal = ?exit.signal,
        duration_ms,
        "child terminated"
    );

    let program = spec.program.clone();
    Err(match reason {
        Termination::Timeout => ExecError::Timeout {
            program,
            timeout_ms: u64::try_from(spec.timeout.as_millis()).unwrap_or(u64::MAX),
            cause: exit,
        },
        Termination::StdoutOverflow => ExecError::StdoutLimitExceeded {
            program,
            max_bytes: spec.max_stdout_bytes,
            cause: exit,
        },
        Termination::Cancelled => ExecError::Cancelled {
            program,
            cause: exit,
        },
    })
}

/// Read from an optional pipe; a closed (`None`) pipe never resolves.
async fn read_chunk<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Collect whatever is left in the pipes of an exited child.
async fn drain<O, E>(
    stdout: &mut Option<O>,
    stderr: &mut Option<E>,
    stdout_sink: &mut StdoutCapture,
    stderr_tail: &mut TailBuffer,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(stdout, &mut out_buf) => match read {
                Ok(n) if n > 0 => {
                    if !stdout_sink.push(&out_buf[..n]) {
                        *stdout = None;
                    }
                }
                _ => *stdout = None,
            },
            read = read_chunk(stderr, &mut err_buf) => match read {
                Ok(n) if n > 0 => stderr_tail.push(&err_buf[..n]),
                _ => *stderr = None,
            },
        }
    }
}

fn io_error(spec: &ExecSpec, err: &std::io::Error) -> ExecError {
    ExecError::Io {
        program: spec.program.clone(),
        reason: err.to_string(),
    }
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        exit_code: status.code(),
        signal,
    }
}

/// Ask the child to exit. `child.id()` is `None` once the child has been
/// reaped, so a recycled pid is never signalled.
#[cfg(unix)]
fn send_sigterm(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;

    // SAFETY: `kill` takes two integers and touches no memory owned by this
    // process. `pid` is our own child, which has not been reaped yet.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };

    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const SIGTERM: i32 = 15;
    const SIGKILL: i32 = 9;

    fn sh(script: &str) -> ExecSpec {
        ExecSpec::new("/bin/sh")
            .args(["-c", script])
            .timeout(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn tail_captures_small_output() {
        let result = exec_capture_tail(&sh("printf hello; printf oops >&2"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.signal, None);
        assert_eq!(result.stdout_tail, "hello");
        assert_eq!(result.stderr_tail, "oops");
        assert!(!result.stdout_truncated);
        assert!(!result.stderr_truncated);
        assert!(result.success());
    }

    #[tokio::test]
    async fn tail_keeps_last_bytes_of_large_output() {
        let script = "i=0; while [ $i -lt 2000 ]; do printf '%04d\\n' $i; i=$((i+1)); done";
        let spec = sh(script).max_stdout_bytes(100);
        let result = exec_capture_tail(&spec).await.unwrap();

        let full: String = (0..2000).map(|i| format!("{i:04}\n")).collect();
        assert!(result.stdout_truncated);
        assert_eq!(result.stdout_tail, full[full.len() - 100..]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let result = exec_capture_tail(&sh("echo failing >&2; exit 3"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr_tail, "failing\n");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn timeout_sends_sigterm_and_reports_cause() {
        let spec = ExecSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();

        let err = exec_capture_tail(&spec).await.unwrap_err();

        match &err {
            ExecError::Timeout {
                timeout_ms, cause, ..
            } => {
                assert_eq!(*timeout_ms, 100);
                assert_eq!(cause.exit_code, None);
                assert_eq!(cause.signal, Some(SIGTERM));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_sigkill() {
        let spec = sh("trap '' TERM; exec sleep 5").timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();

        let err = exec_capture_tail(&spec).await.unwrap_err();

        assert_eq!(err.cause().and_then(|c| c.signal), Some(SIGKILL));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) + KILL_GRACE);
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_after_exit_uses_known_exit_code() {
        // The background sleep keeps the pipes open after the shell exits.
        let spec = sh("sleep 5 & echo started").timeout(Duration::from_millis(300));
        let started = std::time::Instant::now();

        let err = exec_capture_tail(&spec).await.unwrap_err();

        assert!(matches!(err, ExecError::Timeout { .. }));
        assert_eq!(err.cause().and_then(|c| c.exit_code), Some(0));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn capture_stdout_returns_full_payload() {
        let spec = sh("printf '{\"ok\":true}'").max_stdout_bytes(64);
        let result = exec_capture_stdout(&spec).await.unwrap();

        assert_eq!(result.stdout, "{\"ok\":true}");
        assert!(!result.stdout_truncated);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn capture_stdout_exact_cap_is_allowed() {
        let spec = sh("printf 0123456789").max_stdout_bytes(10);
        let result = exec_capture_stdout(&spec).await.unwrap();
        assert_eq!(result.stdout, "0123456789");
    }

    #[tokio::test]
    async fn capture_stdout_over_cap_kills_producer() {
        let spec = ExecSpec::new("yes").max_stdout_bytes(1024);
        let err = exec_capture_stdout(&spec).await.unwrap_err();

        match &err {
            ExecError::StdoutLimitExceeded {
                max_bytes, cause, ..
            } => {
                assert_eq!(*max_bytes, 1024);
                // SIGTERM, or SIGPIPE if the closed pipe got it first.
                assert_eq!(cause.exit_code, None);
                assert!(cause.signal.is_some());
            }
            other => panic!("expected stdout limit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_stdout_over_cap_after_exit_keeps_exit_code() {
        // The shell exits first; its background job keeps the pipe open and
        // overflows it later, so there is nothing left to signal.
        let spec = sh("(sleep 0.2; printf aaaaaaaaaaaaaaaaaaaa) & exit 7").max_stdout_bytes(10);
        let err = exec_capture_stdout(&spec).await.unwrap_err();

        match &err {
            ExecError::StdoutLimitExceeded {
                max_bytes, cause, ..
            } => {
                assert_eq!(*max_bytes, 10);
                assert_eq!(cause.exit_code, Some(7));
                assert_eq!(cause.signal, None);
            }
            other => panic!("expected stdout limit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow() {
        let result = exec_capture_tail(&ExecSpec::new("true").timeout(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));

        let now = Instant::now();
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(86_400 * 365));
        assert_eq!(
            deadline_after(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn zero_stdout_cap_fails_on_first_byte() {
        let err = exec_capture_stdout(&sh("printf x").max_stdout_bytes(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::StdoutLimitExceeded { max_bytes: 0, .. }));

        let ok = exec_capture_stdout(&sh("true").max_stdout_bytes(0))
            .await
            .unwrap();
        assert_eq!(ok.stdout, "");
    }

    #[tokio::test]
    async fn env_replaces_inherited_environment() {
        let spec = sh("printf '%s|%s' \"$JOB_TOKEN\" \"${HOME:-unset}\"").env("JOB_TOKEN", "t0k");
        let result = exec_capture_stdout(&spec).await.unwrap();
        assert_eq!(result.stdout, "t0k|unset");
    }

    #[tokio::test]
    async fn cwd_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let result = exec_capture_stdout(&sh("pwd").cwd(dir.path()))
            .await
            .unwrap();

        let reported = std::path::PathBuf::from(result.stdout.trim_end());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = exec_capture_tail(&ExecSpec::new("/nonexistent/clawlets-test-binary"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Spawn { .. }));
        assert!(err.cause().is_none());
    }

    #[tokio::test]
    async fn cancellation_terminates_child() {
        let token = CancellationToken::new();
        let spec = ExecSpec::new("sleep")
            .arg("5")
            .cancel_token(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = exec_capture_tail(&spec).await.unwrap_err();
        canceller.await.unwrap();

        match err {
            ExecError::Cancelled { cause, .. } => assert_eq!(cause.signal, Some(SIGTERM)),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_ignored_by_default() {
        let result = exec_capture_stdout(&ExecSpec::new("cat").timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.stdout, "");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn result_serializes_camel_case() {
        let result = exec_capture_tail(&sh("printf hi")).await.unwrap();
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["exitCode"], 0);
        assert!(json["signal"].is_null());
        assert_eq!(json["stdoutTail"], "hi");
        assert_eq!(json["stdoutTruncated"], false);
        assert!(json["durationMs"].is_u64());
    }

    #[test]
    fn debug_hides_env_values() {
        let spec = ExecSpec::new("deploy").env("API_TOKEN", "super-secret-value");
        let debug = format!("{spec:?}");
        assert!(debug.contains("API_TOKEN"));
        assert!(!debug.contains("super-secret-value"));
    }
}
