//! Launch-then-limit process wrapper.
//!
//! [`LimitedCommand`] starts a child process and immediately hands its pid to
//! a [`Limiter`]. If limiting fails the child is killed and the limiter's
//! error is returned. The child runs unlimited for the short window between
//! creation and attach; callers that need the limit in force from the first
//! instruction must start from an already-limited parent.
use crate::io_handler::{join_copier, spawn_copier, CaptureBuffer};
use crate::limiter::Limiter;
use crate::types::{LimitError, Result};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Lifecycle of a [`LimitedCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Not launched yet
    Unstarted,
    /// Launched, limiter not yet applied
    Started,
    /// Running under the limiter
    Limited,
    /// Exited (or was killed by the caller) and has been reaped
    Terminated,
    /// Killed because the limiter could not be applied
    Killed,
}

/// A command that is placed under a [`Limiter`] as soon as it starts
pub struct LimitedCommand<'a> {
    command: Command,
    limiter: &'a dyn Limiter,
    state: CommandState,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    stdin: Option<Stdio>,
    stdout: Option<Stdio>,
    stderr: Option<Stdio>,
    stdout_claimed: bool,
    stderr_claimed: bool,
}

impl<'a> LimitedCommand<'a> {
    /// Wrap an unstarted command
    pub fn new(command: Command, limiter: &'a dyn Limiter) -> Self {
        Self {
            command,
            limiter,
            state: CommandState::Unstarted,
            child: None,
            exit_status: None,
            stdin: None,
            stdout: None,
            stderr: None,
            stdout_claimed: false,
            stderr_claimed: false,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, value: V) -> &mut Self {
        self.command.env(key, value);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.command.current_dir(dir);
        self
    }

    pub fn stdin<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.stdin = Some(cfg.into());
        self
    }

    /// Redirect standard output. Claimed streams are not captured by [`output`](Self::output).
    pub fn stdout<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.stdout = Some(cfg.into());
        self.stdout_claimed = true;
        self
    }

    /// Redirect standard error. Claimed streams are not captured by [`output`](Self::output).
    pub fn stderr<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.stderr = Some(cfg.into());
        self.stderr_claimed = true;
        self
    }

    /// The underlying process descriptor
    pub fn as_command(&self) -> &Command {
        &self.command
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// OS pid of the child once it has been launched
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Launch the process, then apply the limiter to it
    ///
    /// Fails with [`LimitError::Precondition`] if this command was started before.
    pub fn start(&mut self) -> Result<()> {
        if self.state != CommandState::Unstarted {
            return Err(LimitError::Precondition(format!(
                "command has already been started (state {:?})",
                self.state
            )));
        }

        if let Some(cfg) = self.stdin.take() {
            self.command.stdin(cfg);
        }
        if let Some(cfg) = self.stdout.take() {
            self.command.stdout(cfg);
        }
        if let Some(cfg) = self.stderr.take() {
            self.command.stderr(cfg);
        }

        let mut child = self.command.spawn().map_err(LimitError::Launch)?;
        let pid = child.id();
        self.state = CommandState::Started;
        log::debug!("Started process {} ({:?})", pid, self.command.get_program());

        if let Err(e) = self.limiter.limit(pid) {
            // The attach error is what the caller needs; kill failures are only logged
            if let Err(kill_err) = child.kill() {
                log::warn!("Failed to kill unlimited process {}: {}", pid, kill_err);
            }
            match child.wait() {
                Ok(status) => self.exit_status = Some(status),
                Err(wait_err) => log::warn!("Failed to reap process {}: {}", pid, wait_err),
            }
            self.child = Some(child);
            self.state = CommandState::Killed;
            return Err(LimitError::Limit {
                pid,
                source: Box::new(e),
            });
        }

        self.child = Some(child);
        self.state = CommandState::Limited;
        Ok(())
    }

    /// Block until the process exits and return its raw status
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| LimitError::Precondition("command has not been started".to_string()))?;

        let status = child.wait()?;
        self.exit_status = Some(status);
        self.state = CommandState::Terminated;
        log::debug!("Process {} exited with {}", child.id(), status);
        Ok(status)
    }

    /// Kill the running process
    pub fn kill(&mut self) -> Result<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| LimitError::Precondition("command has not been started".to_string()))?;
        child.kill()?;
        Ok(())
    }

    /// Start the command and wait for it; a non-zero exit is an error
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        let status = self.wait()?;
        if !status.success() {
            return Err(LimitError::Exit {
                status,
                output: Vec::new(),
                stderr: Vec::new(),
            });
        }
        Ok(())
    }

    /// Run the command and collect its standard output
    ///
    /// Unless the caller redirected stderr, its first and last 32 KiB are
    /// captured and attached to the [`LimitError::Exit`] returned on failure,
    /// together with the stdout collected so far. Stdin defaults to the null
    /// device.
    pub fn output(&mut self) -> Result<Vec<u8>> {
        if self.stdout_claimed {
            return Err(LimitError::Precondition("stdout already set".to_string()));
        }
        let capture_stderr = !self.stderr_claimed;

        if self.stdin.is_none() {
            self.stdin = Some(Stdio::null());
        }
        self.stdout = Some(Stdio::piped());
        if capture_stderr {
            self.stderr = Some(Stdio::piped());
        }
        self.start()?;

        let child = self.child.as_mut().ok_or_else(missing_child)?;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = if capture_stderr {
            child.stderr.take().map(Some)
        } else {
            Some(None)
        };
        let (stdout_pipe, stderr_pipe) = match (stdout_pipe, stderr_pipe) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => return Err(self.abandon(missing_pipe())),
        };

        let stdout_copier = spawn_copier(stdout_pipe, Vec::new());
        let stderr_copier = stderr_pipe.map(|pipe| spawn_copier(pipe, CaptureBuffer::default()));

        let stdout = match join_copier(stdout_copier) {
            Ok(stdout) => stdout,
            Err(e) => return Err(self.abandon(e)),
        };
        let stderr = match stderr_copier.map(join_copier).transpose() {
            Ok(captured) => captured.map(|buf| buf.to_bytes()).unwrap_or_default(),
            Err(e) => return Err(self.abandon(e)),
        };

        let status = self.wait()?;
        if !status.success() {
            return Err(LimitError::Exit {
                status,
                output: stdout,
                stderr,
            });
        }
        Ok(stdout)
    }

    /// Run the command and collect standard output and standard error interleaved
    ///
    /// On failure the merged output is attached to the [`LimitError::Exit`].
    pub fn combined_output(&mut self) -> Result<Vec<u8>> {
        if self.stdout_claimed {
            return Err(LimitError::Precondition("stdout already set".to_string()));
        }
        if self.stderr_claimed {
            return Err(LimitError::Precondition("stderr already set".to_string()));
        }

        if self.stdin.is_none() {
            self.stdin = Some(Stdio::null());
        }
        let (reader, writer) = io::pipe()?;
        self.stdout = Some(writer.try_clone()?.into());
        self.stderr = Some(writer.into());
        let started = self.start();

        // Drop our copies of the write end or the reader never sees EOF
        self.command.stdout(Stdio::null()).stderr(Stdio::null());
        started?;

        let output = match join_copier(spawn_copier(reader, Vec::new())) {
            Ok(output) => output,
            Err(e) => return Err(self.abandon(e)),
        };
        let status = self.wait()?;
        if !status.success() {
            return Err(LimitError::Exit {
                status,
                output,
                stderr: Vec::new(),
            });
        }
        Ok(output)
    }

    /// Kill and reap the child after its output could not be collected
    fn abandon(&mut self, err: io::Error) -> LimitError {
        if let Some(child) = self.child.as_mut() {
            let pid = child.id();
            if let Err(kill_err) = child.kill() {
                log::warn!("Failed to kill process {}: {}", pid, kill_err);
            }
            match child.wait() {
                Ok(status) => {
                    self.exit_status = Some(status);
                    self.state = CommandState::Terminated;
                }
                Err(wait_err) => log::warn!("Failed to reap process {}: {}", pid, wait_err),
            }
        }
        LimitError::Io(err)
    }
}

fn missing_child() -> LimitError {
    LimitError::Precondition("command has not been started".to_string())
}

fn missing_pipe() -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        "child output pipe is not available",
    )
}
