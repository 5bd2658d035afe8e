//! Sandbox runner: one child process per call.
//!
//! The child gets its own process group, a closed stdin and piped stdout and
//! stderr drained by reader threads, so a chatty program cannot fill a pipe
//! and stall. The runner never parses output beyond the exit-0-with-trace
//! check; everything else is the classifier's job.
//!
//! This is isolation from the loop, not a security boundary.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::domain::{RunOutcome, RunStatus};
use crate::traceback;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Conda messages meaning the named environment does not exist.
const CONDA_ENV_MISSING: &[&str] = &[
    "EnvironmentLocationNotFound",
    "Could not find conda environment",
    "environment does not exist",
];

// ── Commands ─────────────────────────────────────────────────────────

/// How the interpreter is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// `<interpreter> <program>`
    Direct { interpreter: String },
    /// `conda run --no-capture-output -n <env> <interpreter> <program>`
    Conda { env: String, interpreter: String },
}

impl Launcher {
    pub fn new(interpreter: impl Into<String>, env: Option<String>) -> Self {
        let interpreter = interpreter.into();
        match env {
            Some(env) if !env.trim().is_empty() => Launcher::Conda { env, interpreter },
            _ => Launcher::Direct { interpreter },
        }
    }

    fn argv(&self, program: &Path) -> (String, Vec<String>) {
        let program = program.to_string_lossy().into_owned();
        match self {
            Launcher::Direct { interpreter } => (interpreter.clone(), vec![program]),
            Launcher::Conda { env, interpreter } => (
                "conda".to_string(),
                vec![
                    "run".into(),
                    "--no-capture-output".into(),
                    "-n".into(),
                    env.clone(),
                    interpreter.clone(),
                    program,
                ],
            ),
        }
    }
}

/// Typed child command: argv, environment overlay, working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl SandboxCommand {
    /// The command as a shell-like string, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

// ── Runner ───────────────────────────────────────────────────────────

/// Executes programs under a fixed launcher and wall-clock timeout.
///
/// Holds no per-run state; concurrent `run` calls each own their child.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    launcher: Launcher,
    timeout: Duration,
    kill_grace: Duration,
    env: BTreeMap<String, String>,
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

impl SandboxRunner {
    pub fn new(launcher: Launcher, timeout: Duration) -> Self {
        let env = [("PYTHONUNBUFFERED", "1"), ("PYTHONDONTWRITEBYTECODE", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            launcher,
            timeout,
            kill_grace: Duration::from_secs(2),
            env,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    /// The command that would run `program`, with the program's directory
    /// as working directory. Relative paths are anchored at the current
    /// directory first, since the child starts elsewhere.
    pub fn command(&self, program: &Path) -> SandboxCommand {
        let program = if program.is_relative() {
            std::env::current_dir()
                .map(|dir| dir.join(program))
                .unwrap_or_else(|_| program.to_path_buf())
        } else {
            program.to_path_buf()
        };
        let program = program.as_path();
        let (exe, args) = self.launcher.argv(program);
        let cwd = program
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        SandboxCommand {
            program: exe,
            args,
            env: self.env.clone(),
            cwd,
        }
    }

    /// Run the program at `program`. Never fails: launch problems come
    /// back as `status = launcher_error`.
    pub fn run(&self, program: &Path, cancel: &CancelToken) -> RunOutcome {
        let command = self.command(program);
        self.execute(&command, cancel)
    }

    pub fn execute(&self, command: &SandboxCommand, cancel: &CancelToken) -> RunOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut child = match command.to_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %command.display(), error = %e, "failed to launch child");
                return RunOutcome::launcher_error(
                    format!("failed to launch `{}`: {e}", command.program),
                    started_at,
                );
            }
        };
        debug!(pid = child.id(), command = %command.display(), "child started");

        let mut stdout = drain(child.stdout.take());
        let mut stderr = drain(child.stderr.take());

        let ending = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ending::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = child.id(), error = %e, "wait failed; killing child");
                    terminate(&mut child, self.kill_grace);
                    break Ending::WaitFailed(e.to_string());
                }
            }
            if cancel.is_cancelled() {
                warn!(pid = child.id(), "cancel requested; killing child");
                terminate(&mut child, self.kill_grace);
                break Ending::Cancelled;
            }
            if clock.elapsed() >= self.timeout {
                warn!(
                    pid = child.id(),
                    timeout_s = self.timeout.as_secs_f64(),
                    "child exceeded wall-clock budget; killing"
                );
                terminate(&mut child, self.kill_grace);
                break Ending::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Background processes may still hold the pipes open.
        let pgid = child.id();
        sweep_group(pgid, false);
        let grace = Instant::now() + self.kill_grace;
        let budget = (clock + self.timeout).max(grace);
        let mut overran = !captured(&mut stdout, &mut stderr, grace);
        if overran {
            debug!(pgid, "pipes still open after exit; killing process group");
            sweep_group(pgid, true);
            overran = !captured(&mut stdout, &mut stderr, budget);
        }
        let ending = match ending {
            Ending::Exited(_) if overran => {
                warn!(pgid, "a detached process kept the output pipes open past the budget");
                Ending::TimedOut
            }
            other => other,
        };
        let stdout = stdout.take();
        let stderr = stderr.take();
        let wall_time = clock.elapsed().as_secs_f64();
        let ended_at = Utc::now();

        let mut stderr = stderr;
        let (status, exit_code, cancelled) = match ending {
            Ending::TimedOut => (RunStatus::Timeout, None, false),
            Ending::WaitFailed(e) => {
                stderr.push_str(&format!("\nfailed to wait for child: {e}\n"));
                (RunStatus::LauncherError, None, false)
            }
            Ending::Cancelled => (RunStatus::NonzeroExit, None, true),
            Ending::Exited(exit) => {
                let code = exit.code();
                let status = if self.environment_missing(code, &stderr) {
                    RunStatus::LauncherError
                } else if code == Some(0) && !traceback::has_trailing_exception(&stderr) {
                    RunStatus::Ok
                } else {
                    RunStatus::NonzeroExit
                };
                (status, code, false)
            }
        };

        debug!(status = %status, ?exit_code, wall_time, "child finished");
        RunOutcome {
            status,
            exit_code,
            stdout,
            stderr,
            wall_time,
            started_at,
            ended_at,
            cancelled,
        }
    }

    fn environment_missing(&self, code: Option<i32>, stderr: &str) -> bool {
        matches!(self.launcher, Launcher::Conda { .. })
            && code != Some(0)
            && CONDA_ENV_MISSING.iter().any(|m| stderr.contains(m))
    }
}

/// Output of one pipe, read on its own thread until every writer closes it.
struct Capture {
    rx: Option<Receiver<Vec<u8>>>,
    bytes: Option<Vec<u8>>,
}

impl Capture {
    /// Block until the pipe closes or `deadline` passes. True once the
    /// capture is complete.
    fn wait_until(&mut self, deadline: Instant) -> bool {
        let Some(rx) = &self.rx else {
            return true;
        };
        let wait = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(bytes) => {
                self.bytes = Some(bytes);
                self.rx = None;
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.rx = None;
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Whatever was captured. A reader still blocked is abandoned.
    fn take(self) -> String {
        self.bytes
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }
}

fn captured(stdout: &mut Capture, stderr: &mut Capture, deadline: Instant) -> bool {
    let out = stdout.wait_until(deadline);
    let err = stderr.wait_until(deadline);
    out && err
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Capture {
    let rx = pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            // A read error ends the capture; whatever arrived is kept.
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx
    });
    Capture { rx, bytes: None }
}

/// Signal whatever is left of the process group the child led: SIGTERM,
/// or SIGKILL when `hard`.
#[cfg(unix)]
fn sweep_group(pgid: u32, hard: bool) {
    let signal = if hard { libc::SIGKILL } else { libc::SIGTERM };
    // SAFETY: kill(2) with a negative pid signals a process group; an
    // empty group yields ESRCH and nothing else happens.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signal);
    }
}

#[cfg(not(unix))]
fn sweep_group(_pgid: u32, _hard: bool) {}

/// SIGTERM the child's process group, then SIGKILL once `grace` elapses.
#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid signals the process group the
    // child leads (spawned with process_group(0)); no memory is touched.
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }

    // SAFETY: as above.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_command_runs_in_program_directory() {
        let runner = SandboxRunner::new(Launcher::new("python3", None), Duration::from_secs(5));
        let cmd = runner.command(Path::new("/art/backtest/Sma/extracted_code.0.py"));
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["/art/backtest/Sma/extracted_code.0.py"]);
        assert_eq!(cmd.cwd, PathBuf::from("/art/backtest/Sma"));
        assert_eq!(cmd.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
    }

    #[test]
    fn relative_program_is_anchored_before_changing_directory() {
        let runner = SandboxRunner::new(Launcher::new("python3", None), Duration::from_secs(5));
        let cmd = runner.command(Path::new("artifacts/backtest/Sma/extracted_code.0.py"));
        let arg = PathBuf::from(&cmd.args[0]);
        assert!(arg.is_absolute());
        assert!(arg.ends_with("artifacts/backtest/Sma/extracted_code.0.py"));
        assert!(cmd.cwd.ends_with("artifacts/backtest/Sma"));
    }

    #[test]
    fn conda_command_is_an_argv_list() {
        let launcher = Launcher::new("python", Some("tflow".into()));
        let runner = SandboxRunner::new(launcher, Duration::from_secs(5));
        let cmd = runner.command(Path::new("/p/bt.py"));
        assert_eq!(cmd.program, "conda");
        assert_eq!(
            cmd.args,
            vec!["run", "--no-capture-output", "-n", "tflow", "python", "/p/bt.py"]
        );
    }

    #[test]
    fn blank_env_name_means_direct() {
        assert_eq!(
            Launcher::new("python", Some("  ".into())),
            Launcher::Direct {
                interpreter: "python".into()
            }
        );
    }

    #[test]
    fn missing_conda_env_is_a_launcher_problem() {
        let runner = SandboxRunner::new(
            Launcher::new("python", Some("nope".into())),
            Duration::from_secs(1),
        );
        assert!(runner.environment_missing(
            Some(1),
            "EnvironmentLocationNotFound: Not a conda environment: /opt/conda/envs/nope"
        ));
        assert!(!runner.environment_missing(Some(0), "EnvironmentLocationNotFound"));
    }
}
