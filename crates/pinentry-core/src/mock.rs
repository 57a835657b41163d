//! Scripted transport for testing.
//!
//! This module provides a [`Transport`] that replays a fixed script of
//! expected calls, so the session engine can be exercised without a real
//! pinentry program.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::traits::Transport;

/// One expected call and the value to return for it.
#[derive(Debug)]
enum Step {
    Start {
        program: String,
        args: Vec<String>,
        result: Option<io::ErrorKind>,
    },
    Write {
        data: Vec<u8>,
        result: Option<io::ErrorKind>,
    },
    ShortWrite {
        data: Vec<u8>,
        written: usize,
    },
    ReadLine(Result<Option<Vec<u8>>, io::ErrorKind>),
    Close(Option<io::ErrorKind>),
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    written: Vec<Vec<u8>>,
    close_count: usize,
}

/// A transport that replays a script of expected calls.
///
/// Calls must happen in script order. A call that does not match the next
/// step panics with both the expected and the actual call.
///
/// # Example
///
/// ```
/// use pinentry_core::mock::ScriptedTransport;
/// use pinentry_core::SessionBuilder;
///
/// let transport = ScriptedTransport::new()
///     .expect_start("pinentry", &[])
///     .expect_read_line("OK Pleased to meet you")
///     .expect_write_line("BYE")
///     .expect_read_line("OK closing connection")
///     .expect_close();
/// let handle = transport.handle();
///
/// let session = SessionBuilder::new().connect(transport).unwrap();
/// session.close().unwrap();
/// assert!(handle.is_finished());
/// ```
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

/// A shared view of a [`ScriptedTransport`]'s progress.
///
/// Stays usable after the transport has moved into a session.
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Create a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, step: Step) -> Self {
        lock(&self.script).steps.push_back(step);
        self
    }

    /// Expect `start` with this program and arguments.
    pub fn expect_start(self, program: &str, args: &[&str]) -> Self {
        self.push(Step::Start {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            result: None,
        })
    }

    /// Expect `start` and fail it.
    pub fn expect_start_error(self, program: &str, kind: io::ErrorKind) -> Self {
        self.push(Step::Start {
            program: program.to_string(),
            args: Vec::new(),
            result: Some(kind),
        })
    }

    /// Expect `line` followed by `\n` to be written.
    pub fn expect_write_line(self, line: &str) -> Self {
        self.push(Step::Write {
            data: format!("{}\n", line).into_bytes(),
            result: None,
        })
    }

    /// Expect `line` followed by `\n` to be written, and fail the write.
    pub fn expect_write_line_error(self, line: &str, kind: io::ErrorKind) -> Self {
        self.push(Step::Write {
            data: format!("{}\n", line).into_bytes(),
            result: Some(kind),
        })
    }

    /// Expect `line` followed by `\n` to be written, and report only
    /// `written` bytes as written.
    pub fn expect_short_write(self, line: &str, written: usize) -> Self {
        self.push(Step::ShortWrite {
            data: format!("{}\n", line).into_bytes(),
            written,
        })
    }

    /// Expect a read and hand back `line`.
    pub fn expect_read_line(self, line: &str) -> Self {
        self.push(Step::ReadLine(Ok(Some(line.as_bytes().to_vec()))))
    }

    /// Expect a read and report end of stream.
    pub fn expect_end_of_stream(self) -> Self {
        self.push(Step::ReadLine(Ok(None)))
    }

    /// Expect a read and fail it.
    pub fn expect_read_error(self, kind: io::ErrorKind) -> Self {
        self.push(Step::ReadLine(Err(kind)))
    }

    /// Expect `close`.
    pub fn expect_close(self) -> Self {
        self.push(Step::Close(None))
    }

    /// Expect `close` and fail it.
    pub fn expect_close_error(self, kind: io::ErrorKind) -> Self {
        self.push(Step::Close(Some(kind)))
    }

    /// Get a handle for inspecting the script after the transport moved.
    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            script: Arc::clone(&self.script),
        }
    }

    fn next_step(&self, call: &str) -> Step {
        lock(&self.script)
            .steps
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected call {call}: script is exhausted"))
    }
}

impl ScriptHandle {
    /// Returns whether every scripted step has been consumed.
    pub fn is_finished(&self) -> bool {
        lock(&self.script).steps.is_empty()
    }

    /// Number of steps not consumed yet.
    pub fn remaining(&self) -> usize {
        lock(&self.script).steps.len()
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        lock(&self.script).close_count
    }

    /// Every line written so far, without terminators.
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.script)
            .written
            .iter()
            .map(|data| {
                let line = data.strip_suffix(b"\n").unwrap_or(data);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    // A panicking test poisons the lock; the script is still readable.
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn error(kind: io::ErrorKind) -> io::Error {
    io::Error::new(kind, "scripted failure")
}

impl Transport for ScriptedTransport {
    fn start(&mut self, program: &str, args: &[String]) -> io::Result<()> {
        let call = format!("start({program:?}, {args:?})");
        match self.next_step(&call) {
            Step::Start {
                program: expected,
                args: expected_args,
                result,
            } => {
                assert_eq!(
                    (expected.as_str(), expected_args.as_slice()),
                    (program, args),
                    "unexpected start arguments"
                );
                result.map_or(Ok(()), |kind| Err(error(kind)))
            }
            step => panic!("unexpected call {call}, expected {step:?}"),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let call = format!("write({:?})", String::from_utf8_lossy(data));
        let step = self.next_step(&call);
        let (expected, outcome) = match step {
            Step::Write {
                data: expected,
                result,
            } => {
                let outcome = result.map_or(Ok(expected.len()), |kind| Err(error(kind)));
                (expected, outcome)
            }
            Step::ShortWrite {
                data: expected,
                written,
            } => (expected, Ok(written)),
            step => panic!("unexpected call {call}, expected {step:?}"),
        };
        assert_eq!(
            String::from_utf8_lossy(&expected),
            String::from_utf8_lossy(data),
            "unexpected write"
        );
        lock(&self.script).written.push(data.to_vec());
        outcome
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.next_step("read_line()") {
            Step::ReadLine(result) => result.map_err(error),
            step => panic!("unexpected call read_line(), expected {step:?}"),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        lock(&self.script).close_count += 1;
        match self.next_step("close()") {
            Step::Close(result) => result.map_or(Ok(()), |kind| Err(error(kind))),
            step => panic!("unexpected call close(), expected {step:?}"),
        }
    }
}
