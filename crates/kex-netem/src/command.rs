//! External command execution.
//!
//! Every interaction with the host (namespace setup, `tc`, `ping`, the
//! handshake timer) goes through a [`CommandRunner`], so the experiment logic
//! can be driven against a scripted runner in tests.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often a child with a deadline is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long a timed-out process group gets after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("empty command line")]
    Empty,
    #[error("failed to run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error(
        "`{command}` exited with {} (expected {expected}){}",
        describe_status(.actual),
        describe_stderr(.stderr)
    )]
    Status {
        command: String,
        expected: i32,
        actual: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` did not finish within {after:?}")]
    TimedOut { command: String, after: Duration },
    #[error("`{command}` wrote non-UTF-8 output")]
    NonUtf8Output { command: String },
}

fn describe_status(actual: &Option<i32>) -> String {
    match actual {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// One external command to execute.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub argv: &'a [String],
    /// `None` runs in the current directory.
    pub working_dir: Option<&'a Path>,
    pub expected_status: i32,
    pub timeout: Option<Duration>,
}

impl<'a> Invocation<'a> {
    pub fn new(argv: &'a [String]) -> Self {
        Self {
            argv,
            working_dir: None,
            expected_status: 0,
            timeout: None,
        }
    }

    pub fn in_dir(mut self, dir: &'a Path) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn expect_status(mut self, status: i32) -> Self {
        self.expected_status = status;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The argv joined with spaces, for logs and error messages.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Executes an external command and returns its stdout.
///
/// Implementations must fail with [`CommandFailure::Status`] when the exit
/// status differs from [`Invocation::expected_status`]. Output on stderr is a
/// diagnostic only and never fails the call by itself.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation<'_>) -> Result<String, CommandFailure>;
}

/// [`CommandRunner`] backed by `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation<'_>) -> Result<String, CommandFailure> {
        let (program, args) = invocation.argv.split_first().ok_or(CommandFailure::Empty)?;
        let command = invocation.command_line();
        let io_failure = |source| CommandFailure::Io {
            command: command.clone(),
            source,
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = invocation.working_dir {
            cmd.current_dir(dir);
        }
        if invocation.timeout.is_some() {
            // Own process group, so a timeout can reach everything it started.
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(io_failure)?;

        let output = match invocation.timeout {
            None => child.wait_with_output().map_err(io_failure)?,
            Some(limit) => match wait_with_deadline(child, limit).map_err(io_failure)? {
                Some(output) => output,
                None => {
                    return Err(CommandFailure::TimedOut {
                        command,
                        after: limit,
                    })
                }
            },
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !stderr.is_empty() {
            tracing::warn!(command = %command, stderr = %stderr, "command wrote to stderr");
        }

        if output.status.code() != Some(invocation.expected_status) {
            return Err(CommandFailure::Status {
                command,
                expected: invocation.expected_status,
                actual: output.status.code(),
                stderr,
            });
        }

        String::from_utf8(output.stdout).map_err(|_| CommandFailure::NonUtf8Output { command })
    }
}

/// Waits for `child` up to `limit`, killing it once the deadline passes.
///
/// Returns `Ok(None)` on timeout. The pipe readers are detached in that case:
/// a grandchild (e.g. under `sudo`) may still hold the pipes open.
fn wait_with_deadline(mut child: Child, limit: Duration) -> io::Result<Option<Output>> {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let deadline = Instant::now() + limit;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                kill_group(&mut child);
                return Err(err);
            }
        }
        if Instant::now() >= deadline {
            kill_group(&mut child);
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let collect = |handle: Option<thread::JoinHandle<Vec<u8>>>| {
        handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    };
    Ok(Some(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    }))
}

/// Terminates the process group led by `child` and reaps it.
///
/// SIGTERM goes first: `sudo` relays it to the command it runs, while SIGKILL
/// would stop `sudo` alone. Whatever is left after [`KILL_GRACE`] is killed.
fn kill_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        let _ = child.wait();
        return;
    };
    // SAFETY: `pgid` is the id of the group our child leads (spawned with
    // `process_group(0)`). Signalling a group that is already gone only
    // returns ESRCH.
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }

    let grace = Instant::now() + KILL_GRACE;
    while Instant::now() < grace {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    // SAFETY: as above.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn captures_stdout() {
        let argv = sh("echo 1.5,2.5");
        let out = ProcessRunner.run(&Invocation::new(&argv)).unwrap();
        assert_eq!(out, "1.5,2.5\n");
    }

    #[test]
    fn stderr_alone_is_not_fatal() {
        let argv = sh("echo warning >&2; echo ok");
        let out = ProcessRunner.run(&Invocation::new(&argv)).unwrap();
        assert_eq!(out.trim(), "ok");
    }

    #[test]
    fn status_mismatch_fails() {
        let argv = sh("echo broken >&2; exit 3");
        let err = ProcessRunner.run(&Invocation::new(&argv)).unwrap_err();
        match err {
            CommandFailure::Status {
                expected,
                actual,
                stderr,
                ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn expected_nonzero_status_succeeds() {
        let argv = sh("exit 2");
        let out = ProcessRunner
            .run(&Invocation::new(&argv).expect_status(2))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn runs_in_working_dir() {
        let dir = std::env::temp_dir().canonicalize().unwrap();
        let argv = vec!["pwd".to_string()];
        let out = ProcessRunner
            .run(&Invocation::new(&argv).in_dir(&dir))
            .unwrap();
        assert_eq!(Path::new(out.trim()).canonicalize().unwrap(), dir);
    }

    #[test]
    fn deadline_kills_hung_command() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let started = Instant::now();
        let err = ProcessRunner
            .run(&Invocation::new(&argv).with_timeout(Some(Duration::from_millis(100))))
            .unwrap_err();
        assert!(matches!(err, CommandFailure::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn deadline_kills_background_children_too() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let argv = sh(&format!("sleep 30 & echo $! > {}; wait", pid_file.display()));

        let err = ProcessRunner
            .run(&Invocation::new(&argv).with_timeout(Some(Duration::from_millis(200))))
            .unwrap_err();
        assert!(matches!(err, CommandFailure::TimedOut { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let gone = |stat: &str| match std::fs::read_to_string(stat) {
            Err(_) => true,
            // Reparented and not yet reaped.
            Ok(line) => line.rsplit(") ").next().map_or(false, |rest| rest.starts_with('Z')),
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !gone(&stat) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(gone(&stat), "background sleep {} survived the timeout", pid.trim());
    }

    #[test]
    fn deadline_not_hit_returns_output() {
        let argv = sh("echo fast");
        let out = ProcessRunner
            .run(&Invocation::new(&argv).with_timeout(Some(Duration::from_secs(5))))
            .unwrap();
        assert_eq!(out.trim(), "fast");
    }

    #[test]
    fn empty_argv_is_rejected() {
        let argv: Vec<String> = Vec::new();
        assert!(matches!(
            ProcessRunner.run(&Invocation::new(&argv)),
            Err(CommandFailure::Empty)
        ));
    }

    #[test]
    fn missing_program_is_io_failure() {
        let argv = vec!["/nonexistent/kex-timer".to_string()];
        assert!(matches!(
            ProcessRunner.run(&Invocation::new(&argv)),
            Err(CommandFailure::Io { .. })
        ));
    }
}
