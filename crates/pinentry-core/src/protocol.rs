//! Error types for the Assuan dialect spoken by pinentry programs.
//!
//! Three kinds of failure reach callers:
//!
//! - transport failures ([`ProtocolError::Io`], [`ProtocolError::ConnectionClosed`])
//! - `ERR <code> <description>` replies ([`ProtocolError::Assuan`])
//! - replies that do not fit the exchange in progress
//!   ([`ProtocolError::UnexpectedResponse`])
//!
//! Nothing is retried. Where two failures can happen on the same path
//! (handshake followed by close, `BYE` followed by releasing the program)
//! both are kept in [`ProtocolError::Combined`].

use thiserror::Error;

/// Assuan error code sent when the user cancels the dialog.
pub const ERROR_CODE_CANCELLED: u32 = 83_886_179;

/// An error reported by the pinentry program over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct AssuanError {
    /// The numeric Assuan error code (0 if it could not be parsed).
    pub code: u32,

    /// The human-readable description following the code.
    pub description: String,
}

impl AssuanError {
    /// Create a new Assuan error.
    pub fn new(code: u32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Returns whether the user cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        self.code == ERROR_CODE_CANCELLED
    }
}

/// Errors that can occur while talking to a pinentry program.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to start, write to, read from or release the program.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The program replied with an `ERR` line.
    #[error("pinentry: {0}")]
    Assuan(#[from] AssuanError),

    /// The program sent a line that is not valid at this point.
    #[error("pinentry: unexpected response: {line:?}")]
    UnexpectedResponse {
        /// The offending line, verbatim.
        line: String,
    },

    /// The program closed its output while a reply was expected.
    #[error("connection closed")]
    ConnectionClosed,

    /// Two failures on the same code path.
    #[error("{primary}; additionally: {secondary}")]
    Combined {
        /// The failure that happened first.
        primary: Box<ProtocolError>,
        /// The failure raised while cleaning up after `primary`.
        secondary: Box<ProtocolError>,
    },
}

impl ProtocolError {
    /// Build an unexpected-response error from a raw wire line.
    pub fn unexpected(line: &[u8]) -> Self {
        ProtocolError::UnexpectedResponse {
            line: String::from_utf8_lossy(line).into_owned(),
        }
    }

    /// Returns whether this error means the user cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ProtocolError::Assuan(err) => err.is_cancelled(),
            ProtocolError::Combined { primary, secondary } => {
                primary.is_cancelled() || secondary.is_cancelled()
            }
            _ => false,
        }
    }

    /// Returns the Assuan error carried by this error, if any.
    pub fn assuan(&self) -> Option<&AssuanError> {
        match self {
            ProtocolError::Assuan(err) => Some(err),
            ProtocolError::Combined { primary, .. } => primary.assuan(),
            _ => None,
        }
    }
}

/// Returns whether `err` means the user cancelled the operation.
pub fn is_cancelled(err: &ProtocolError) -> bool {
    err.is_cancelled()
}

/// Fold the outcome of a cleanup step into an earlier failure.
///
/// The earlier failure always stays the primary error.
pub fn combine(primary: ProtocolError, cleanup: Result<(), ProtocolError>) -> ProtocolError {
    match cleanup {
        Ok(()) => primary,
        Err(secondary) => ProtocolError::Combined {
            primary: Box::new(primary),
            secondary: Box::new(secondary),
        },
    }
}
