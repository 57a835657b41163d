//! Child-process transport.
//!
//! Starts the pinentry program with piped stdin/stdout and speaks to it
//! line by line. The program's stderr is inherited so its `--debug` output
//! reaches the terminal.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, warn};

use crate::traits::Transport;

/// A [`Transport`] backed by a child process.
#[derive(Debug, Default)]
pub struct ProcessTransport {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl ProcessTransport {
    /// Create a transport with no program running yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the child's process id while it is running.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

fn not_started() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pinentry program is not running")
}

impl Transport for ProcessTransport {
    fn start(&mut self, program: &str, args: &[String]) -> io::Result<()> {
        if self.child.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "pinentry program is already running",
            ));
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("failed to start {}: {}", program, e)))?;

        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take().map(BufReader::new);
        debug!(program, pid = child.id(), "Started pinentry process");
        self.child = Some(child);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let stdin = self.stdin.as_mut().ok_or_else(not_started)?;
        stdin.write_all(data)?;
        stdin.flush()?;
        Ok(data.len())
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let stdout = self.stdout.as_mut().ok_or_else(not_started)?;
        let mut line = Vec::new();
        if stdout.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn close(&mut self) -> io::Result<()> {
        // Closing stdin lets a program that missed BYE exit on EOF.
        self.stdin = None;
        self.stdout = None;

        let mut child = self.child.take().ok_or_else(not_started)?;
        let status = child.wait()?;
        debug!(pid = child.id(), %status, "Pinentry process exited");
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("pinentry exited with {}", status)))
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            self.stdin = None;
            if let Err(e) = child.kill() {
                warn!(pid = child.id(), error = %e, "Failed to kill pinentry process");
            }
            let _ = child.wait();
        }
    }
}
