//! Child-process execution for the host tools.
//!
//! Secrets are only ever written to the child's stdin, never passed as
//! arguments.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::VolumeError;

#[derive(Debug, Clone)]
pub(crate) struct HostCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// stderr when present, stdout otherwise.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            "no additional output".to_string()
        } else {
            stdout.to_string()
        }
    }
}

impl HostCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs the tool, killing it once the configured timeout elapses.
    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output, VolumeError> {
        self.execute(args, input, Some(self.timeout))
    }

    /// Runs the tool without a deadline. Used for header writes, which must
    /// never be interrupted halfway.
    pub(crate) fn run_to_completion(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<Output, VolumeError> {
        self.execute(args, input, None)
    }

    fn execute(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Output, VolumeError> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(stdin) = child.stdin.take() {
                feed_stdin(stdin, payload)?;
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait(child, stdout_pipe, stderr_pipe, timeout)
    }

    fn wait(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
        timeout: Option<Duration>,
    ) -> Result<Output, VolumeError> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);

        let exit_status = match timeout {
            None => child.wait()?,
            Some(timeout) => {
                let mut exit_status = None;
                while start.elapsed() <= timeout {
                    if let Some(status) = child.try_wait()? {
                        exit_status = Some(status);
                        break;
                    }
                    thread::sleep(Duration::from_millis(25));
                }

                let Some(exit_status) = exit_status else {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(VolumeError::Timeout {
                        program: self.program_name(),
                        seconds: timeout.as_secs(),
                    });
                };
                exit_status
            }
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| VolumeError::Command("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| VolumeError::Command("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }

    fn program_name(&self) -> String {
        self.binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string())
    }
}

/// Writes `payload` and closes stdin. A child that exits without reading its
/// input is not an error here; its status and stderr tell what happened.
fn feed_stdin(mut stdin: ChildStdin, payload: &[u8]) -> Result<(), VolumeError> {
    match stdin.write_all(payload) {
        Ok(()) => {
            stdin.flush().ok();
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("Child closed stdin before reading all input");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<Result<String, VolumeError>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> Result<String, VolumeError> {
        let Some(mut reader) = pipe else {
            return Ok(String::new());
        };
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}
