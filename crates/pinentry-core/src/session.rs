//! The session engine.
//!
//! A [`Session`] owns the transport to one pinentry program and runs the
//! Assuan exchanges on it: the greeting handshake, single-line directives,
//! `CONFIRM`, `GETPIN` with its quality inquiries, and `BYE`.
//!
//! Exactly one command is in flight at a time. Every write is followed by
//! blocking reads until the exchange is finished; blank and comment lines
//! are skipped before a reply is looked at, and `ERR` lines end the
//! exchange with [`ProtocolError::Assuan`].
//!
//! # Example
//!
//! ```no_run
//! use pinentry_core::SessionBuilder;
//! use secrecy::ExposeSecret;
//!
//! let mut session = SessionBuilder::new()
//!     .title("Unlock key")
//!     .description("Enter the passphrase for your signing key")
//!     .prompt("Passphrase:")
//!     .spawn()?;
//!
//! match session.get_pin() {
//!     Ok(result) => println!("got {} bytes", result.pin.expose_secret().len()),
//!     Err(err) if err.is_cancelled() => println!("cancelled"),
//!     Err(err) => return Err(err.into()),
//! }
//! session.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::time::Duration;

use secrecy::SecretString;
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::codec::{
    self, classify, decode_error, unescape, Line, INQUIRE_QUALITY, NOT_CONFIRMED,
    STATUS_PASSWORD_FROM_CACHE, STATUS_PIN_REPEATED,
};
use crate::process::ProcessTransport;
use crate::protocol::{combine, ProtocolError};
use crate::traits::{NoOpinion, QualityEvaluator, Transport};
use crate::types::{Directive, InfoKind, QualityReply, SecretResult};

/// Program started when no other name is configured.
pub const DEFAULT_PROGRAM: &str = "pinentry";

/// A reply line that survived filtering, owned so the transport can be
/// used again while it is inspected.
struct Reply(Vec<u8>);

impl Reply {
    fn line(&self) -> Line<'_> {
        classify(&self.0)
    }

    fn is_ok(&self) -> bool {
        matches!(self.line(), Line::Ok(_))
    }

    fn unexpected(&self) -> ProtocolError {
        ProtocolError::unexpected(&self.0)
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        // Data lines may carry the PIN.
        self.0.zeroize();
    }
}

/// State of the `GETPIN` loop.
enum GetPinState {
    /// Waiting for the next reply line.
    AwaitingLine,
    /// An `INQUIRE QUALITY` arrived; answer it, then read on. The program
    /// never acknowledges the answer.
    AnsweringInquiry(Zeroizing<String>),
}

/// Builds a [`Session`].
///
/// Directives are sent in the order they were added, right after the
/// program's greeting.
pub struct SessionBuilder {
    program: String,
    args: Vec<String>,
    directives: Vec<Directive>,
    quality: Option<Box<dyn QualityEvaluator>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("directives", &self.directives)
            .field("quality", &self.quality.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Create a builder for the default `pinentry` program.
    pub fn new() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            directives: Vec::new(),
            quality: None,
        }
    }

    /// Set the program to start.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Append extra program arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Ask the program to print debug messages (`--debug`).
    pub fn debug(mut self) -> Self {
        self.args.push("--debug".to_string());
        self
    }

    /// Only grab the keyboard while the window is focused (`--no-global-grab`).
    pub fn no_global_grab(mut self) -> Self {
        self.args.push("--no-global-grab".to_string());
        self
    }

    /// Queue a directive for the handshake.
    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    /// Queue a preformatted command line for the handshake.
    pub fn command(self, command: impl Into<String>) -> Self {
        self.directive(Directive::Raw(command.into()))
    }

    /// Set the descriptive text.
    pub fn description(self, text: impl Into<String>) -> Self {
        self.directive(Directive::Description(text.into()))
    }

    /// Set the prompt label.
    pub fn prompt(self, text: impl Into<String>) -> Self {
        self.directive(Directive::Prompt(text.into()))
    }

    /// Set the window title.
    pub fn title(self, text: impl Into<String>) -> Self {
        self.directive(Directive::Title(text.into()))
    }

    /// Set the OK button text.
    pub fn ok_label(self, text: impl Into<String>) -> Self {
        self.directive(Directive::OkLabel(text.into()))
    }

    /// Set the Cancel button text.
    pub fn cancel_label(self, text: impl Into<String>) -> Self {
        self.directive(Directive::CancelLabel(text.into()))
    }

    /// Set the non-affirmative button text.
    pub fn not_ok_label(self, text: impl Into<String>) -> Self {
        self.directive(Directive::NotOkLabel(text.into()))
    }

    /// Set the error text.
    pub fn error_text(self, text: impl Into<String>) -> Self {
        self.directive(Directive::Error(text.into()))
    }

    /// Set a stable key identifier for external password caching.
    pub fn key_info(self, text: impl Into<String>) -> Self {
        self.directive(Directive::KeyInfo(text.into()))
    }

    /// Set the label of the "generate" action.
    pub fn gen_pin(self, text: impl Into<String>) -> Self {
        self.directive(Directive::GenPin(text.into()))
    }

    /// Set the tooltip of the "generate" action.
    pub fn gen_pin_tooltip(self, text: impl Into<String>) -> Self {
        self.directive(Directive::GenPinTooltip(text.into()))
    }

    /// Enable the quality bar, scored by `evaluator`.
    pub fn quality_bar(mut self, evaluator: impl QualityEvaluator + 'static) -> Self {
        self.quality = Some(Box::new(evaluator));
        self.directive(Directive::QualityBar)
    }

    /// Set the quality bar tooltip.
    pub fn quality_bar_tooltip(self, text: impl Into<String>) -> Self {
        self.directive(Directive::QualityBarTooltip(text.into()))
    }

    /// Ask for the PIN twice, labelling the second field with `text`.
    pub fn repeat(self, text: impl Into<String>) -> Self {
        self.directive(Directive::Repeat(text.into()))
    }

    /// Set the message shown when the repeated entries differ.
    pub fn repeat_error(self, text: impl Into<String>) -> Self {
        self.directive(Directive::RepeatError(text.into()))
    }

    /// Set the message shown when the repeated entries match.
    pub fn repeat_ok(self, text: impl Into<String>) -> Self {
        self.directive(Directive::RepeatOk(text.into()))
    }

    /// Let the program cancel the dialog after `timeout`.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.directive(Directive::Timeout(timeout))
    }

    /// Set an option, e.g. `default-ok=Unlock`.
    pub fn option(self, option: impl Into<String>) -> Self {
        self.directive(Directive::Option(option.into()))
    }

    /// Set several options.
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for option in options {
            self = self.option(option);
        }
        self
    }

    /// Point curses-based programs at `$GPG_TTY`, if it is set.
    pub fn gpg_tty(self) -> Self {
        if cfg!(windows) {
            return self;
        }
        self.tty_name(std::env::var("GPG_TTY").ok())
    }

    /// Queue `OPTION ttyname=<tty>` when a tty is given.
    pub fn tty_name(self, tty: Option<String>) -> Self {
        match tty {
            Some(tty) if !tty.is_empty() => {
                self.option(format!("{}={}", codec::options::TTY_NAME, tty))
            }
            _ => self,
        }
    }

    /// Start the program on `transport` and run the handshake.
    ///
    /// On failure after the program started, the session is closed and a
    /// close failure is reported alongside the handshake failure.
    pub fn connect<T: Transport>(self, transport: T) -> Result<Session<T>, ProtocolError> {
        let SessionBuilder {
            program,
            args,
            directives,
            quality,
        } = self;

        let mut session = Session {
            transport,
            quality: quality.unwrap_or_else(|| Box::new(NoOpinion)),
        };

        debug!(program = %program, args = ?args, "Starting pinentry");
        session.transport.start(&program, &args)?;

        if let Err(err) = session.handshake(&directives) {
            warn!(error = %err, "Pinentry handshake failed");
            return Err(combine(err, session.close()));
        }

        debug!(
            program = %program,
            directives = directives.len(),
            "Pinentry session established"
        );
        Ok(session)
    }

    /// Start the program as a child process and run the handshake.
    pub fn spawn(self) -> Result<Session<ProcessTransport>, ProtocolError> {
        self.connect(ProcessTransport::new())
    }
}

/// A connection to one pinentry program.
///
/// Created by [`SessionBuilder::connect`]; ended by [`Session::close`].
pub struct Session<T: Transport> {
    transport: T,
    quality: Box<dyn QualityEvaluator>,
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    /// Send a command line and require `OK`.
    pub fn command(&mut self, command: &str) -> Result<(), ProtocolError> {
        self.write_line(command)?;
        self.read_ok()
    }

    /// Send a directive and require `OK`.
    pub fn apply(&mut self, directive: &Directive) -> Result<(), ProtocolError> {
        self.command(&directive.to_command())
    }

    /// Ask the user for confirmation.
    ///
    /// `option` is escaped and appended to `CONFIRM` when non-empty (e.g.
    /// `--one-button`). Returns `Ok(false)` when the user declines; a
    /// cancelled dialog is an error for which
    /// [`ProtocolError::is_cancelled`] holds.
    pub fn confirm(&mut self, option: &str) -> Result<bool, ProtocolError> {
        let command = if option.is_empty() {
            "CONFIRM".to_string()
        } else {
            format!("CONFIRM {}", codec::escape(option))
        };
        self.write_line(&command)?;

        let reply = self.read_reply()?;
        let confirmed = match reply.line() {
            Line::Ok(_) => true,
            Line::Other(line) if line == NOT_CONFIRMED => false,
            _ => return Err(reply.unexpected()),
        };
        debug!(confirmed, "Confirmation answered");
        Ok(confirmed)
    }

    /// Ask the user for a PIN.
    ///
    /// Quality inquiries are answered with the session's evaluator while the
    /// user types. A cancelled dialog is an error for which
    /// [`ProtocolError::is_cancelled`] holds.
    pub fn get_pin(&mut self) -> Result<SecretResult, ProtocolError> {
        self.write_line("GETPIN")?;

        let mut result = SecretResult::empty();
        let mut state = GetPinState::AwaitingLine;
        loop {
            state = match state {
                GetPinState::AwaitingLine => {
                    let reply = self.read_reply()?;
                    match reply.line() {
                        Line::Ok(_) => break,
                        Line::Data(payload) => {
                            result.pin = secret_from_bytes(unescape(payload));
                            GetPinState::AwaitingLine
                        }
                        Line::Status { keyword, .. } if keyword == STATUS_PASSWORD_FROM_CACHE.as_bytes() => {
                            result.password_from_cache = true;
                            GetPinState::AwaitingLine
                        }
                        Line::Status { keyword, .. } if keyword == STATUS_PIN_REPEATED.as_bytes() => {
                            result.pin_repeated = true;
                            GetPinState::AwaitingLine
                        }
                        Line::Inquire { keyword, argument } if keyword == INQUIRE_QUALITY.as_bytes() => {
                            GetPinState::AnsweringInquiry(candidate_from_bytes(unescape(argument)))
                        }
                        _ => return Err(reply.unexpected()),
                    }
                }
                GetPinState::AnsweringInquiry(candidate) => {
                    self.answer_quality(&candidate)?;
                    GetPinState::AwaitingLine
                }
            };
        }

        debug!(
            password_from_cache = result.password_from_cache,
            pin_repeated = result.pin_repeated,
            "PIN received"
        );
        Ok(result)
    }

    /// Show a message to the user and wait for it to be dismissed.
    pub fn message(&mut self) -> Result<(), ProtocolError> {
        self.command("MESSAGE")
    }

    /// Clear the cached passphrase identified by `cache_id`.
    pub fn clear_passphrase(&mut self, cache_id: &str) -> Result<(), ProtocolError> {
        self.command(&format!("CLEARPASSPHRASE {}", codec::escape(cache_id)))
    }

    /// Query information about the program with `GETINFO`.
    pub fn get_info(&mut self, kind: InfoKind) -> Result<String, ProtocolError> {
        self.write_line(&format!("GETINFO {}", kind))?;

        let mut value = String::new();
        loop {
            let reply = self.read_reply()?;
            match reply.line() {
                Line::Ok(_) => return Ok(value),
                Line::Data(payload) => {
                    value.push_str(&String::from_utf8_lossy(&unescape(payload)));
                }
                _ => return Err(reply.unexpected()),
            }
        }
    }

    /// End the session with `BYE` and release the program.
    ///
    /// The program is released even if `BYE` fails; both failures are
    /// reported together.
    pub fn close(mut self) -> Result<(), ProtocolError> {
        let result = self.close_inner();
        if result.is_ok() {
            debug!("Pinentry session closed");
        }
        result
    }

    fn close_inner(&mut self) -> Result<(), ProtocolError> {
        let bye = self.command("BYE");
        let released = self.transport.close().map_err(ProtocolError::from);
        match (bye, released) {
            (Ok(()), released) => released,
            (Err(err), released) => Err(combine(err, released)),
        }
    }

    fn handshake(&mut self, directives: &[Directive]) -> Result<(), ProtocolError> {
        self.read_ok()?;
        for directive in directives {
            self.apply(directive)?;
        }
        Ok(())
    }

    /// Answer one quality inquiry. The answer gets no reply of its own, so
    /// nothing is read here.
    fn answer_quality(&mut self, candidate: &str) -> Result<(), ProtocolError> {
        let reply = QualityReply::from_evaluation(self.quality.evaluate(candidate));
        trace!(reply = ?reply, "Answering quality inquiry");
        for line in reply.wire_lines() {
            self.write_line(&line)?;
        }
        Ok(())
    }

    /// Write one command line. A line feed or carriage return inside
    /// `line` would start a second command, so such lines are rejected
    /// before anything is written.
    fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        if line.bytes().any(|b| b == b'\n' || b == b'\r') {
            warn!(line = %codec::redact(line.as_bytes()), "Refusing to write embedded line break");
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "command line contains a line break",
            )));
        }

        let mut data = Zeroizing::new(Vec::with_capacity(line.len() + 1));
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let result = self.transport.write(&data);
        match &result {
            Ok(_) => trace!(line = %codec::redact(line.as_bytes()), "Wrote command line"),
            Err(e) => warn!(line = %codec::redact(line.as_bytes()), error = %e, "Failed to write command line"),
        }
        let written = result?;
        if written != data.len() {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, data.len()),
            )));
        }
        Ok(())
    }

    /// Read the next meaningful reply.
    ///
    /// Blank and comment lines are skipped; `ERR` lines become errors.
    fn read_reply(&mut self) -> Result<Reply, ProtocolError> {
        loop {
            let line = match self.transport.read_line() {
                Ok(Some(line)) => Reply(line),
                Ok(None) => {
                    warn!("Pinentry closed its output");
                    return Err(ProtocolError::ConnectionClosed);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read reply");
                    return Err(e.into());
                }
            };
            trace!(line = %codec::redact(&line.0), "Read reply line");

            match line.line() {
                Line::Blank | Line::Comment => continue,
                Line::Error(raw) => return Err(decode_error(raw)?.into()),
                _ => return Ok(line),
            }
        }
    }

    fn read_ok(&mut self) -> Result<(), ProtocolError> {
        let reply = self.read_reply()?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(reply.unexpected())
        }
    }
}

fn secret_from_bytes(bytes: Vec<u8>) -> SecretString {
    SecretString::from(string_from_bytes(bytes))
}

fn candidate_from_bytes(bytes: Vec<u8>) -> Zeroizing<String> {
    Zeroizing::new(string_from_bytes(bytes))
}

fn string_from_bytes(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            let mut bytes = err.into_bytes();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            bytes.zeroize();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptHandle, ScriptedTransport};
    use crate::protocol::{AssuanError, ERROR_CODE_CANCELLED};
    use secrecy::ExposeSecret;

    const CANCELLED_LINE: &str = "ERR 83886179 Operation cancelled <Pinentry>";

    /// A transport that expects the default program and greets with OK.
    fn greeted() -> ScriptedTransport {
        ScriptedTransport::new()
            .expect_start("pinentry", &[])
            .expect_read_line("OK Pleased to meet you")
    }

    fn expect_close(transport: ScriptedTransport) -> ScriptedTransport {
        transport
            .expect_write_line("BYE")
            .expect_read_line("OK closing connection")
            .expect_close()
    }

    fn close_and_verify(session: Session<ScriptedTransport>, handle: &ScriptHandle) {
        session.close().unwrap();
        assert!(handle.is_finished(), "{} steps left", handle.remaining());
        assert_eq!(handle.close_count(), 1);
    }

    #[test]
    fn connect_and_close() {
        let transport = expect_close(greeted());
        let handle = transport.handle();

        let session = SessionBuilder::new().connect(transport).unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn connect_passes_program_and_args() {
        let transport = ScriptedTransport::new()
            .expect_start("pinentry-test", &["--arg1", "--arg2", "--debug", "--no-global-grab"])
            .expect_read_line("OK Pleased to meet you");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let session = SessionBuilder::new()
            .program("pinentry-test")
            .args(["--arg1", "--arg2"])
            .debug()
            .no_global_grab()
            .connect(transport)
            .unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn connect_sends_directives_in_order() {
        let transport = greeted()
            .expect_write_line("SETTITLE title")
            .expect_read_line("OK")
            .expect_write_line("SETDESC My multiline%0Adescription")
            .expect_read_line("OK")
            .expect_write_line("SETPROMPT prompt")
            .expect_read_line("OK")
            .expect_write_line("SETOK ok")
            .expect_read_line("OK")
            .expect_write_line("SETCANCEL cancel")
            .expect_read_line("OK")
            .expect_write_line("SETNOTOK notok")
            .expect_read_line("OK")
            .expect_write_line("SETERROR error")
            .expect_read_line("OK")
            .expect_write_line("SETKEYINFO keyinfo")
            .expect_read_line("OK")
            .expect_write_line("SETGENPIN genpin")
            .expect_read_line("OK")
            .expect_write_line("SETGENPIN_TT genpin_tt")
            .expect_read_line("OK")
            .expect_write_line("SETQUALITYBAR_TT qualitybartooltip")
            .expect_read_line("OK")
            .expect_write_line("SETREPEAT repeat")
            .expect_read_line("OK")
            .expect_write_line("SETREPEATERROR error")
            .expect_read_line("OK")
            .expect_write_line("SETREPEATOK ok")
            .expect_read_line("OK")
            .expect_write_line("SETTIMEOUT 1")
            .expect_read_line("OK")
            .expect_write_line("OPTION option")
            .expect_read_line("OK")
            .expect_write_line("OPTION default-ok=Unlock")
            .expect_read_line("OK")
            .expect_write_line("OPTION lc-ctype=C")
            .expect_read_line("OK")
            .expect_write_line("GETINFO flavor")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let session = SessionBuilder::new()
            .title("title")
            .description("My multiline\ndescription")
            .prompt("prompt")
            .ok_label("ok")
            .cancel_label("cancel")
            .not_ok_label("notok")
            .error_text("error")
            .key_info("keyinfo")
            .gen_pin("genpin")
            .gen_pin_tooltip("genpin_tt")
            .quality_bar_tooltip("qualitybartooltip")
            .repeat("repeat")
            .repeat_error("error")
            .repeat_ok("ok")
            .timeout(Duration::from_secs(1))
            .option("option")
            .options(["default-ok=Unlock", "lc-ctype=C"])
            .command("GETINFO flavor")
            .connect(transport)
            .unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn handshake_skips_blank_lines() {
        let transport = ScriptedTransport::new()
            .expect_start("pinentry", &[])
            .expect_read_line("")
            .expect_read_line("\t")
            .expect_read_line("\n")
            .expect_read_line(" ")
            .expect_read_line("OK Pleased to meet you");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let session = SessionBuilder::new().connect(transport).unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn handshake_skips_comments() {
        let transport = ScriptedTransport::new()
            .expect_start("pinentry", &[])
            .expect_read_line("#")
            .expect_read_line("# comment")
            .expect_read_line("OK Pleased to meet you");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let session = SessionBuilder::new().connect(transport).unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn handshake_without_ok_fails_and_closes_once() {
        let transport = ScriptedTransport::new()
            .expect_start("pinentry", &[])
            .expect_read_line("Hello there");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let err = SessionBuilder::new().connect(transport).unwrap_err();
        match err {
            ProtocolError::UnexpectedResponse { line } => assert_eq!(line, "Hello there"),
            other => panic!("Wrong error type: {other:?}"),
        }
        assert_eq!(handle.close_count(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn handshake_failure_combines_close_failure() {
        let transport = ScriptedTransport::new()
            .expect_start("pinentry", &[])
            .expect_read_line("Hello there")
            .expect_write_line("BYE")
            .expect_end_of_stream()
            .expect_close_error(io::ErrorKind::Other);
        let handle = transport.handle();

        let err = SessionBuilder::new().connect(transport).unwrap_err();
        match err {
            ProtocolError::Combined { primary, secondary } => {
                assert!(matches!(*primary, ProtocolError::UnexpectedResponse { .. }));
                match *secondary {
                    ProtocolError::Combined { primary, secondary } => {
                        assert!(matches!(*primary, ProtocolError::ConnectionClosed));
                        assert!(matches!(*secondary, ProtocolError::Io(_)));
                    }
                    other => panic!("Wrong error type: {other:?}"),
                }
            }
            other => panic!("Wrong error type: {other:?}"),
        }
        assert_eq!(handle.close_count(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn rejected_directive_aborts_handshake() {
        let transport = greeted()
            .expect_write_line("SETTITLE title")
            .expect_read_line("ERR 83886254 Unknown command <Pinentry>");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let err = SessionBuilder::new()
            .title("title")
            .prompt("never sent")
            .connect(transport)
            .unwrap_err();
        assert_eq!(
            err.assuan(),
            Some(&AssuanError::new(83886254, "Unknown command <Pinentry>"))
        );
        assert!(!err.is_cancelled());
        assert_eq!(handle.close_count(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn failed_start_does_not_close() {
        let transport =
            ScriptedTransport::new().expect_start_error("pinentry", io::ErrorKind::NotFound);
        let handle = transport.handle();

        let err = SessionBuilder::new().connect(transport).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
        assert_eq!(handle.close_count(), 0);
    }

    #[test]
    fn command_after_connect() {
        let transport = greeted()
            .expect_write_line("SETERROR Wrong PIN, 2 tries left")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        session
            .apply(&Directive::Error("Wrong PIN, 2 tries left".into()))
            .unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("D abc")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "abc");
        assert!(!result.password_from_cache);
        assert!(!result.pin_repeated);
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_decodes_escapes() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("D 100%25 sure%0Aand%")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "100% sure\nand%");
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_without_data_is_empty() {
        let transport = greeted().expect_write_line("GETPIN").expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "");
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_from_cache() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("S PASSWORD_FROM_CACHE")
            .expect_read_line("D abc")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "abc");
        assert!(result.password_from_cache);
        assert!(!result.pin_repeated);
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_repeated() {
        let transport = greeted()
            .expect_write_line("SETREPEAT repeat")
            .expect_read_line("OK")
            .expect_write_line("GETPIN")
            .expect_read_line("S PIN_REPEATED")
            .expect_read_line("D abc")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new()
            .repeat("repeat")
            .connect(transport)
            .unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "abc");
        assert!(!result.password_from_cache);
        assert!(result.pin_repeated);
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_quality_bar() {
        let transport = greeted()
            .expect_write_line("SETQUALITYBAR")
            .expect_read_line("OK")
            .expect_write_line("GETPIN")
            .expect_read_line("INQUIRE QUALITY a")
            .expect_write_line("D 10")
            .expect_write_line("END")
            .expect_read_line("INQUIRE QUALITY ab")
            .expect_write_line("D 20")
            .expect_write_line("END")
            .expect_read_line("INQUIRE QUALITY abc")
            .expect_write_line("D 30")
            .expect_write_line("END")
            .expect_read_line("D abc")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new()
            .quality_bar(|pin: &str| Some(10 * pin.len() as i32))
            .connect(transport)
            .unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "abc");
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_quality_bar_clamps_scores() {
        let transport = greeted()
            .expect_write_line("SETQUALITYBAR")
            .expect_read_line("OK")
            .expect_write_line("GETPIN")
            .expect_read_line("INQUIRE QUALITY short")
            .expect_write_line("D -100")
            .expect_write_line("END")
            .expect_read_line("INQUIRE QUALITY long enough")
            .expect_write_line("D 100")
            .expect_write_line("END")
            .expect_read_line("D long enough")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new()
            .quality_bar(|pin: &str| Some(if pin.len() < 8 { -500 } else { 1000 }))
            .connect(transport)
            .unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "long enough");
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_quality_bar_no_opinion() {
        let transport = greeted()
            .expect_write_line("SETQUALITYBAR")
            .expect_read_line("OK")
            .expect_write_line("GETPIN")
            .expect_read_line("INQUIRE QUALITY a")
            .expect_write_line("CAN")
            .expect_read_line("INQUIRE QUALITY ab")
            .expect_write_line("CAN")
            .expect_read_line("INQUIRE QUALITY abc")
            .expect_write_line("CAN")
            .expect_read_line("D abc")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new()
            .quality_bar(|_: &str| None::<i32>)
            .connect(transport)
            .unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "abc");
        close_and_verify(session, &handle);
    }

    #[test]
    fn quality_inquiry_without_evaluator_is_cancelled() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("INQUIRE QUALITY a")
            .expect_write_line("CAN")
            .expect_read_line("D a")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        session.get_pin().unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn quality_inquiry_receives_unescaped_candidate() {
        let transport = greeted()
            .expect_write_line("SETQUALITYBAR")
            .expect_read_line("OK")
            .expect_write_line("GETPIN")
            // Escaped by a conforming program, raw `%` from a sloppy one.
            .expect_read_line("INQUIRE QUALITY a%25b%")
            .expect_write_line("D 5")
            .expect_write_line("END")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new()
            .quality_bar(|pin: &str| {
                assert_eq!(pin, "a%b%");
                Some(pin.len() as i32 + 1)
            })
            .connect(transport)
            .unwrap();
        session.get_pin().unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn quality_answer_write_failure_aborts_get_pin() {
        let transport = greeted()
            .expect_write_line("SETQUALITYBAR")
            .expect_read_line("OK")
            .expect_write_line("GETPIN")
            .expect_read_line("INQUIRE QUALITY a")
            .expect_write_line_error("D 10", io::ErrorKind::BrokenPipe);
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new()
            .quality_bar(|pin: &str| Some(10 * pin.len() as i32))
            .connect(transport)
            .unwrap();
        let err = session.get_pin().unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_cancelled() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line(CANCELLED_LINE);
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.get_pin().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.assuan().map(|e| e.code), Some(ERROR_CODE_CANCELLED));
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_other_error_is_not_cancellation() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("ERR 83886142 Timeout <Pinentry>");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.get_pin().unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(
            err.assuan(),
            Some(&AssuanError::new(83886142, "Timeout <Pinentry>"))
        );
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_malformed_error_is_unexpected() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("ERR nonsense");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.get_pin().unwrap_err();
        match err {
            ProtocolError::UnexpectedResponse { line } => assert_eq!(line, "ERR nonsense"),
            other => panic!("Wrong error type: {other:?}"),
        }
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_unexpected_response() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("unexpected response");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.get_pin().unwrap_err();
        match err {
            ProtocolError::UnexpectedResponse { line } => assert_eq!(line, "unexpected response"),
            other => panic!("Wrong error type: {other:?}"),
        }
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_unknown_inquiry_is_unexpected() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("INQUIRE PASSPHRASE x");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.get_pin().unwrap_err();
        match err {
            ProtocolError::UnexpectedResponse { line } => assert_eq!(line, "INQUIRE PASSPHRASE x"),
            other => panic!("Wrong error type: {other:?}"),
        }
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_unknown_status_is_unexpected() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("S SOMETHING_NEW");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(matches!(
            session.get_pin(),
            Err(ProtocolError::UnexpectedResponse { .. })
        ));
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_skips_interleaved_blank_and_comment_lines() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_line("# progress")
            .expect_read_line("S PASSWORD_FROM_CACHE")
            .expect_read_line("")
            .expect_read_line("D abc")
            .expect_read_line("   ")
            .expect_read_line("#")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let result = session.get_pin().unwrap();
        assert_eq!(result.pin.expose_secret(), "abc");
        assert!(result.password_from_cache);
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_pin_end_of_stream() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_end_of_stream()
            .expect_write_line("BYE")
            .expect_end_of_stream()
            .expect_close();
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(matches!(
            session.get_pin(),
            Err(ProtocolError::ConnectionClosed)
        ));
        let err = session.close().unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
        assert_eq!(handle.close_count(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn get_pin_read_error() {
        let transport = greeted()
            .expect_write_line("GETPIN")
            .expect_read_error(io::ErrorKind::UnexpectedEof);
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.get_pin().unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        close_and_verify(session, &handle);
    }

    #[test]
    fn confirm() {
        let transport = greeted()
            .expect_write_line("CONFIRM confirm")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(session.confirm("confirm").unwrap());
        close_and_verify(session, &handle);
    }

    #[test]
    fn confirm_without_option() {
        let transport = greeted().expect_write_line("CONFIRM").expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(session.confirm("").unwrap());
        close_and_verify(session, &handle);
    }

    #[test]
    fn confirm_declined() {
        let transport = greeted()
            .expect_write_line("CONFIRM --one-button")
            .expect_read_line("ASSUAN_Not_Confirmed");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(!session.confirm("--one-button").unwrap());
        close_and_verify(session, &handle);
    }

    #[test]
    fn confirm_cancelled() {
        let transport = greeted()
            .expect_write_line("CONFIRM confirm")
            .expect_read_line(CANCELLED_LINE);
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.confirm("confirm").unwrap_err();
        assert!(err.is_cancelled());
        close_and_verify(session, &handle);
    }

    #[test]
    fn confirm_escapes_option() {
        let transport = greeted()
            .expect_write_line("CONFIRM --one-button%0ABYE")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(session.confirm("--one-button\nBYE").unwrap());
        assert_eq!(handle.written_lines()[0], "CONFIRM --one-button%0ABYE");
        close_and_verify(session, &handle);
    }

    #[test]
    fn command_with_line_break_is_rejected_before_writing() {
        let transport = expect_close(greeted());
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        for command in ["SETDESC a\nBYE", "SETDESC a\rb", "\n"] {
            let err = session.command(command).unwrap_err();
            assert!(
                matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput),
                "{command:?}: {err:?}"
            );
        }
        let err = session
            .apply(&Directive::Raw("OPTION a\nGETPIN".into()))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
        assert!(handle.written_lines().is_empty());
        close_and_verify(session, &handle);
    }

    #[test]
    fn tty_name_queues_option() {
        let transport = greeted()
            .expect_write_line("OPTION ttyname=/dev/pts/3")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let session = SessionBuilder::new()
            .tty_name(Some("/dev/pts/3".to_string()))
            .connect(transport)
            .unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn tty_name_without_tty_queues_nothing() {
        let transport = expect_close(greeted());
        let handle = transport.handle();

        let session = SessionBuilder::new()
            .tty_name(None)
            .tty_name(Some(String::new()))
            .connect(transport)
            .unwrap();
        close_and_verify(session, &handle);
        assert_eq!(handle.written_lines(), vec!["BYE"]);
    }

    #[test]
    fn session_debug_hides_transport() {
        let transport = expect_close(greeted());
        let session = SessionBuilder::new().connect(transport).unwrap();
        assert_eq!(format!("{:?}", session), "Session { .. }");
        session.close().unwrap();
    }

    #[test]
    fn confirm_unexpected_response() {
        let transport = greeted()
            .expect_write_line("CONFIRM")
            .expect_read_line("D yes");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        match session.confirm("").unwrap_err() {
            ProtocolError::UnexpectedResponse { line } => assert_eq!(line, "D yes"),
            other => panic!("Wrong error type: {other:?}"),
        }
        close_and_verify(session, &handle);
    }

    #[test]
    fn message() {
        let transport = greeted().expect_write_line("MESSAGE").expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        session.message().unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn clear_passphrase() {
        let transport = greeted()
            .expect_write_line("CLEARPASSPHRASE cacheID")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        session.clear_passphrase("cacheID").unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn clear_passphrase_escapes_id() {
        let transport = greeted()
            .expect_write_line("CLEARPASSPHRASE n/a%25%0A")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        session.clear_passphrase("n/a%\n").unwrap();
        close_and_verify(session, &handle);
    }

    #[test]
    fn clear_passphrase_unexpected_response() {
        let transport = greeted()
            .expect_write_line("CLEARPASSPHRASE cacheID")
            .expect_read_line("S CLEARED");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert!(matches!(
            session.clear_passphrase("cacheID"),
            Err(ProtocolError::UnexpectedResponse { .. })
        ));
        close_and_verify(session, &handle);
    }

    #[test]
    fn get_info() {
        let transport = greeted()
            .expect_write_line("GETINFO version")
            .expect_read_line("D 1.2.1")
            .expect_read_line("OK");
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        assert_eq!(session.get_info(InfoKind::Version).unwrap(), "1.2.1");
        close_and_verify(session, &handle);
    }

    #[test]
    fn short_write_is_an_error() {
        let transport = greeted().expect_short_write("MESSAGE", 3);
        let transport = expect_close(transport);
        let handle = transport.handle();

        let mut session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.message().unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::WriteZero));
        close_and_verify(session, &handle);
    }

    #[test]
    fn close_releases_program_when_bye_fails() {
        let transport = greeted()
            .expect_write_line_error("BYE", io::ErrorKind::BrokenPipe)
            .expect_close();
        let handle = transport.handle();

        let session = SessionBuilder::new().connect(transport).unwrap();
        let err = session.close().unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(handle.close_count(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn close_combines_bye_and_release_failures() {
        let transport = greeted()
            .expect_write_line("BYE")
            .expect_read_line("ERR 1 nope")
            .expect_close_error(io::ErrorKind::Other);
        let handle = transport.handle();

        let session = SessionBuilder::new().connect(transport).unwrap();
        match session.close().unwrap_err() {
            ProtocolError::Combined { primary, secondary } => {
                assert_eq!(primary.assuan(), Some(&AssuanError::new(1, "nope")));
                assert!(matches!(*secondary, ProtocolError::Io(_)));
            }
            other => panic!("Wrong error type: {other:?}"),
        }
        assert_eq!(handle.close_count(), 1);
    }

    #[test]
    fn close_reports_release_failure() {
        let transport = greeted()
            .expect_write_line("BYE")
            .expect_read_line("OK closing connection")
            .expect_close_error(io::ErrorKind::Other);

        let session = SessionBuilder::new().connect(transport).unwrap();
        assert!(matches!(session.close(), Err(ProtocolError::Io(_))));
    }

    #[test]
    fn string_from_invalid_utf8_is_lossy() {
        assert_eq!(string_from_bytes(b"ab\xffc".to_vec()), "ab\u{FFFD}c");
        assert_eq!(string_from_bytes(b"plain".to_vec()), "plain");
    }
}
