//! External process supervision.
//!
//! A `Supervisor` owns at most one child process together with the files capturing its output
//! streams. Clean starts wipe the working directory and open fresh capture files, warm starts keep
//! both and append to whatever was captured before.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{ClusterError, ClusterResult};

/// The name of the file capturing a supervised process's stdout.
pub const STDOUT_FILE: &str = "stdout.out";
/// The name of the file capturing a supervised process's stderr.
pub const STDERR_FILE: &str = "stderr.out";

/// The signal used to ask a supervised process to exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful shutdown, as if an operator pressed ctrl-c.
    Interrupt,
    /// Forced shutdown.
    Terminate,
    /// Immediate, uncatchable shutdown.
    Kill,
}

impl StopSignal {
    fn as_nix(self) -> Signal {
        match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

impl FromStr for StopSignal {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().trim_start_matches("SIG") {
            "INT" => Ok(Self::Interrupt),
            "TERM" => Ok(Self::Terminate),
            "KILL" => Ok(Self::Kill),
            other => Err(ClusterError::InvalidInput(format!("unsupported stop signal {}", other))),
        }
    }
}

/// A supervisor of a single external worker process.
pub struct Supervisor {
    /// A human readable name used in logs and errors.
    name: String,
    /// The program to execute.
    program: PathBuf,
    /// The directory owned by this supervisor, which also holds the capture files.
    working_dir: PathBuf,
    /// How long to wait after a successful spawn before returning.
    settle: Duration,
    /// How long a stopped process may take to exit, unbounded when `None`.
    grace: Option<Duration>,

    /// The currently running child, if any.
    child: Option<Child>,
    /// The open stdout capture file.
    stdout: Option<File>,
    /// The open stderr capture file.
    stderr: Option<File>,
}

impl Supervisor {
    /// Create a new instance.
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, settle: Duration, grace: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            working_dir: working_dir.into(),
            settle,
            grace,
            child: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The OS pid of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    /// Check whether the supervised process is alive, reaping it if it has exited.
    ///
    /// A process whose status cannot be determined is killed and no longer tracked.
    pub fn is_running(&mut self) -> bool {
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return false,
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(name = %self.name, ?status, "supervised process exited on its own");
                self.child = None;
                false
            }
            // The status is unknowable, so the process is killed and forgotten rather than
            // leaving a handle behind which a later start would overwrite.
            Err(err) => {
                tracing::warn!(name = %self.name, error = ?err, "error checking supervised process status, killing it");
                if let Err(err) = child.start_kill() {
                    tracing::debug!(name = %self.name, error = ?err, "error killing process of unknown status");
                }
                self.child = None;
                false
            }
        }
    }

    /// Start the supervised process with the given arguments.
    ///
    /// When `clean` is set the working directory is wiped and recreated, and fresh capture files
    /// are opened, before the process is spawned. Otherwise any existing state is preserved and
    /// output is appended to the existing capture files. Returns the pid of the new process.
    #[tracing::instrument(level = "debug", skip(self, args), fields(name = %self.name))]
    pub async fn start(&mut self, args: &[String], clean: bool) -> ClusterResult<u32> {
        if self.is_running() {
            return Err(ClusterError::Launch(format!("{} is already running", self.name)));
        }

        if clean {
            self.close_logs();
            wipe_dir(&self.working_dir).await?;
        } else {
            tokio::fs::create_dir_all(&self.working_dir).await?;
        }
        let (stdout, stderr) = self.log_handles(clean)?;

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| ClusterError::Launch(format!("error spawning {} from {:?}: {}", self.name, self.program, err)))?;
        let pid = child.id().unwrap_or_default();
        self.child = Some(child);
        tracing::info!(name = %self.name, pid, clean, "started supervised process");

        // Give the worker's own recovery and replay logic a moment to begin.
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(pid)
    }

    /// Send the given signal to the supervised process and wait for it to exit.
    ///
    /// Stopping an already stopped process is a no-op. If a grace period is configured and the
    /// process outlives it, a `ClusterError::Shutdown` is returned and the process stays tracked.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.name))]
    pub async fn stop(&mut self, signal: StopSignal) -> ClusterResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Ok(()),
        };

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), signal.as_nix()) {
                Ok(()) | Err(Errno::ESRCH) => (),
                Err(err) => return Err(ClusterError::Io(std::io::Error::from(err))),
            }
        }

        let status = match self.grace {
            Some(grace) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(res) => res?,
                Err(_elapsed) => {
                    return Err(ClusterError::Shutdown {
                        name: self.name.clone(),
                        signal: signal.to_string(),
                        grace,
                    })
                }
            },
            None => child.wait().await?,
        };
        tracing::info!(name = %self.name, %signal, ?status, "supervised process stopped");
        self.child = None;
        Ok(())
    }

    /// Close the capture files, if open.
    pub fn close_logs(&mut self) {
        self.stdout = None;
        self.stderr = None;
    }

    /// Get handles to the capture files for a new child, opening them as needed.
    fn log_handles(&mut self, fresh: bool) -> ClusterResult<(File, File)> {
        if fresh || self.stdout.is_none() {
            self.stdout = Some(open_capture(&self.working_dir.join(STDOUT_FILE), fresh)?);
        }
        if fresh || self.stderr.is_none() {
            self.stderr = Some(open_capture(&self.working_dir.join(STDERR_FILE), fresh)?);
        }
        match (self.stdout.as_ref(), self.stderr.as_ref()) {
            (Some(stdout), Some(stderr)) => Ok((stdout.try_clone()?, stderr.try_clone()?)),
            _ => Err(ClusterError::Launch(format!("capture files for {} are not open", self.name))),
        }
    }
}

/// Recursively delete the given directory, ignoring its absence, and recreate it empty.
pub async fn wipe_dir(dir: &Path) -> ClusterResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => (),
        Err(err) if err.kind() == ErrorKind::NotFound => (),
        Err(err) => return Err(err.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Recursively delete the given directory, ignoring its absence.
pub async fn purge_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(?dir, "purged directory"),
        Err(err) if err.kind() == ErrorKind::NotFound => (),
        Err(err) => tracing::warn!(?dir, error = ?err, "error purging directory"),
    }
}

fn open_capture(path: &Path, truncate: bool) -> ClusterResult<File> {
    let mut opts = OpenOptions::new();
    opts.create(true);
    if truncate {
        opts.write(true).truncate(true);
    } else {
        opts.append(true);
    }
    Ok(opts.open(path)?)
}

/// Read the last `max_lines` lines of the stderr capture file in the given working directory.
///
/// Returns `None` if nothing was captured there.
pub async fn stderr_tail(working_dir: &Path, max_lines: usize) -> Option<String> {
    let contents = tokio::fs::read_to_string(working_dir.join(STDERR_FILE)).await.ok()?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    Some(lines[start..].join("\n"))
}
