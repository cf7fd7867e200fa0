//! Wrapped CLI child process with process group support
//!
//! The CLI is started as the leader of its own process group so that
//! everything it forks (the MCP permission helper, tool subprocesses) can be
//! terminated together.

use std::ffi::OsStr;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use process_wrap::tokio::{ChildWrapper, CommandWrap, KillOnDrop};
#[cfg(unix)]
use process_wrap::tokio::ProcessGroup;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};

/// Owned handle to a spawned CLI process
///
/// Only the exit watcher holds this; everyone else signals the process
/// through its [`ChildPid`].
#[derive(Debug)]
pub struct WrappedChild {
    inner: Box<dyn ChildWrapper>,
}

/// Piped stdio taken from a freshly spawned child
#[derive(Debug)]
pub struct ChildPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl WrappedChild {
    /// Spawn `program` with piped stdio in a new process group
    pub fn spawn(
        program: impl AsRef<OsStr>,
        configure: impl FnOnce(&mut Command),
    ) -> io::Result<(Self, ChildPipes)> {
        let mut command = CommandWrap::with_new(program, |cmd| {
            configure(cmd);
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        });
        #[cfg(unix)]
        command.wrap(ProcessGroup::leader());
        command.wrap(KillOnDrop);

        let mut child = Self {
            inner: command.spawn()?,
        };
        match child.take_pipes() {
            Some(pipes) => Ok((child, pipes)),
            None => {
                drop(child.start_kill());
                Err(io::Error::other("child stdio was not piped"))
            }
        }
    }

    fn take_pipes(&mut self) -> Option<ChildPipes> {
        let stdin = self.inner.stdin().take()?;
        let stdout = self.inner.stdout().take()?;
        let stderr = self.inner.stderr().take()?;
        Some(ChildPipes {
            stdin,
            stdout,
            stderr,
        })
    }

    /// Kill the process group and wait for exit
    pub async fn kill(&mut self) -> io::Result<()> {
        Pin::from(self.inner.kill()).await
    }

    /// Start killing without waiting for exit
    pub fn start_kill(&mut self) -> io::Result<()> {
        self.inner.start_kill()
    }

    /// Wait for the process (and its group) to exit
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        Pin::from(self.inner.wait()).await
    }

    /// Process id, if the process has not been reaped yet
    pub fn pid(&self) -> Option<ChildPid> {
        self.inner.id().map(ChildPid)
    }
}

/// Signal target for a spawned CLI process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildPid(u32);

impl ChildPid {
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// SIGINT to the CLI itself, not its group
    ///
    /// The CLI answers an interrupt by ending the current turn with a
    /// `result` event; its helpers must keep running.
    #[cfg(unix)]
    pub fn interrupt(self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        kill(self.nix_pid()?, Signal::SIGINT).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    pub fn interrupt(self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interrupting the CLI requires unix signals",
        ))
    }

    /// SIGTERM to the whole process group
    #[cfg(unix)]
    pub fn terminate_group(self) -> io::Result<()> {
        use nix::sys::signal::{Signal, killpg};
        killpg(self.nix_pid()?, Signal::SIGTERM).map_err(io::Error::from)
    }

    /// Without process groups the exit watcher's kill is the only mechanism
    #[cfg(not(unix))]
    pub fn terminate_group(self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn nix_pid(self) -> io::Result<nix::unistd::Pid> {
        i32::try_from(self.0)
            .map(nix::unistd::Pid::from_raw)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))
    }
}

impl std::fmt::Display for ChildPid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_spawn_pipes_and_wait() {
        let (mut child, pipes) = WrappedChild::spawn("/bin/sh", |cmd| {
            cmd.arg("-c").arg("read line; echo \"got $line\"");
        })
        .unwrap();
        assert!(child.pid().is_some());

        let ChildPipes {
            mut stdin, stdout, ..
        } = pipes;
        stdin.write_all(b"ping\n").await.unwrap();
        stdin.flush().await.unwrap();

        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("got ping"));
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_group_stops_process() {
        let (mut child, _pipes) = WrappedChild::spawn("/bin/sh", |cmd| {
            cmd.arg("-c").arg("sleep 30");
        })
        .unwrap();
        child.pid().unwrap().terminate_group().unwrap();

        let status = tokio::time::timeout(std::time::Duration::from_secs(10), child.wait())
            .await
            .expect("process group did not exit")
            .unwrap();
        assert!(!status.success());
    }
}
