//! The capability the tracker uses to launch its helper executables.
//!
//! The tracker only ever talks to a `CommandRunner`, so tests can swap in a scripted runner
//! while production code uses [`ProcessRunner`], which spawns real OS processes.

use crate::types::{Args, Input};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, io, path::PathBuf, process::ExitStatus, process::Stdio};
use tokio::{io::AsyncRead, process, sync::oneshot};
use tracing::debug;

pub type Output = Box<dyn AsyncRead + Send + Unpin>;

/// What to run: an executable, its positional arguments and an optional input stream.
pub struct CommandSpec {
    pub path: PathBuf,
    pub args: Args,
    pub stdin: Option<Input>,
}

impl CommandSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            stdin: None,
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

    pub fn stdin(mut self, stdin: Option<Input>) -> Self {
        self.stdin = stdin;
        self
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

/// A started process: its two output streams and a future resolving to its exit code.
pub struct ProcessHandle {
    pub stdout: Output,
    pub stderr: Output,
    pub exit: BoxFuture<'static, io::Result<u32>>,
    /// Send on this to terminate the process. Dropping it leaves the process running.
    pub kill: oneshot::Sender<()>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Start the command without waiting for it to finish.
    async fn start(&self, spec: CommandSpec) -> io::Result<ProcessHandle>;
}

/// Runs helpers as child processes of the server.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn start(&self, spec: CommandSpec) -> io::Result<ProcessHandle> {
        let CommandSpec { path, args, stdin } = spec;
        let stdin_cfg = if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = process::Command::new(&path)
            .args(args)
            .stdin(stdin_cfg)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // feed the input, then drop the pipe so the child sees end of input
        if let (Some(mut input), Some(mut child_stdin)) = (stdin, child.stdin.take()) {
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut input, &mut child_stdin).await {
                    debug!(path = %path.display(), %err, "helper stopped reading its input");
                }
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let (kill, killed) = oneshot::channel();
        let exit = async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = killed => None,
            };
            let status = match exited {
                Some(status) => status?,
                None => {
                    if let Err(err) = child.start_kill() {
                        debug!(path = %path.display(), %err, "helper already gone");
                    }
                    child.wait().await?
                }
            };
            Ok(exit_code(status))
        }
        .boxed();

        Ok(ProcessHandle {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
            kill,
        })
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("child {} was not piped", name))
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        // stopped or continued, never seen from `wait`
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> u32 {
    status.code().unwrap_or(1) as u32
}
