//! Value types exchanged with a pinentry session.
//!
//! This module contains the result of a `GETPIN` exchange, the clamped
//! quality score used by the quality bar, and the parameter-setting
//! directives a session can send.

use std::time::Duration;

use secrecy::SecretString;

use crate::codec::escape;

/// Result of a `GETPIN` exchange.
///
/// Contains the PIN entered by the user and the status flags the program
/// reported while it was entered.
#[derive(Clone)]
pub struct SecretResult {
    /// The PIN, percent-decoded.
    pub pin: SecretString,

    /// The program served the PIN from its external cache (`S PASSWORD_FROM_CACHE`).
    pub password_from_cache: bool,

    /// The user typed the PIN twice and both entries matched (`S PIN_REPEATED`).
    pub pin_repeated: bool,
}

impl SecretResult {
    pub(crate) fn empty() -> Self {
        Self {
            pin: SecretString::from(String::new()),
            password_from_cache: false,
            pin_repeated: false,
        }
    }
}

// Manual Debug implementation to avoid exposing the secret
impl std::fmt::Debug for SecretResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretResult")
            .field("pin", &"[REDACTED]")
            .field("password_from_cache", &self.password_from_cache)
            .field("pin_repeated", &self.pin_repeated)
            .finish()
    }
}

/// A quality score for the quality bar.
///
/// The absolute value is the quality in percent; a negative score turns the
/// bar red. Scores are clamped into `-100..=100` on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quality(i32);

impl Quality {
    pub const MIN: i32 = -100;
    pub const MAX: i32 = 100;

    /// Create a quality score, clamping it into range.
    pub fn new(score: i32) -> Self {
        Self(score.clamp(Self::MIN, Self::MAX))
    }

    /// The clamped score.
    pub fn get(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The client's answer to an `INQUIRE QUALITY` line.
///
/// The program consumes the answer without acknowledging it, so sending
/// these lines is the whole sub-exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityReply {
    /// Report a score: `D <score>` then `END`.
    Score(Quality),
    /// No opinion: `CAN`.
    Cancel,
}

impl QualityReply {
    /// Build the reply from an evaluator's verdict.
    pub fn from_evaluation(score: Option<i32>) -> Self {
        match score {
            Some(score) => QualityReply::Score(Quality::new(score)),
            None => QualityReply::Cancel,
        }
    }

    /// The lines to write, without terminators.
    pub fn wire_lines(&self) -> Vec<String> {
        match self {
            QualityReply::Score(quality) => vec![format!("D {}", quality), "END".to_string()],
            QualityReply::Cancel => vec!["CAN".to_string()],
        }
    }
}

/// A single-exchange directive: one line out, `OK` or `ERR` back.
///
/// Text arguments are escaped by [`Directive::to_command`], so callers pass
/// them verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `SETDESC`: the descriptive text shown above the entry field.
    Description(String),
    /// `SETPROMPT`: the label in front of the entry field.
    Prompt(String),
    /// `SETTITLE`: the window title.
    Title(String),
    /// `SETOK`: the text of the OK button.
    OkLabel(String),
    /// `SETCANCEL`: the text of the Cancel button.
    CancelLabel(String),
    /// `SETNOTOK`: the text of the non-affirmative button.
    NotOkLabel(String),
    /// `SETERROR`: an error message shown with the next prompt.
    Error(String),
    /// `SETKEYINFO`: a stable key identifier for external password caches.
    KeyInfo(String),
    /// `SETGENPIN`: the label of a "generate" action.
    GenPin(String),
    /// `SETGENPIN_TT`: the tooltip of the "generate" action.
    GenPinTooltip(String),
    /// `SETQUALITYBAR`: enable the quality bar.
    QualityBar,
    /// `SETQUALITYBAR_TT`: the tooltip of the quality bar.
    QualityBarTooltip(String),
    /// `SETREPEAT`: ask for the PIN twice, with this label for the second field.
    Repeat(String),
    /// `SETREPEATERROR`: the message shown when the two entries differ.
    RepeatError(String),
    /// `SETREPEATOK`: the message shown when the two entries match.
    RepeatOk(String),
    /// `SETTIMEOUT`: dialog timeout, sent in whole seconds.
    Timeout(Duration),
    /// `OPTION`: a generic option such as `default-ok=Unlock`.
    Option(String),
    /// A preformatted command line, sent as is.
    Raw(String),
}

impl Directive {
    /// Render the directive as a command line.
    pub fn to_command(&self) -> String {
        match self {
            Directive::Description(text) => format!("SETDESC {}", escape(text)),
            Directive::Prompt(text) => format!("SETPROMPT {}", escape(text)),
            Directive::Title(text) => format!("SETTITLE {}", escape(text)),
            Directive::OkLabel(text) => format!("SETOK {}", escape(text)),
            Directive::CancelLabel(text) => format!("SETCANCEL {}", escape(text)),
            Directive::NotOkLabel(text) => format!("SETNOTOK {}", escape(text)),
            Directive::Error(text) => format!("SETERROR {}", escape(text)),
            Directive::KeyInfo(text) => format!("SETKEYINFO {}", escape(text)),
            Directive::GenPin(text) => format!("SETGENPIN {}", escape(text)),
            Directive::GenPinTooltip(text) => format!("SETGENPIN_TT {}", escape(text)),
            Directive::QualityBar => "SETQUALITYBAR".to_string(),
            Directive::QualityBarTooltip(text) => format!("SETQUALITYBAR_TT {}", escape(text)),
            Directive::Repeat(text) => format!("SETREPEAT {}", escape(text)),
            Directive::RepeatError(text) => format!("SETREPEATERROR {}", escape(text)),
            Directive::RepeatOk(text) => format!("SETREPEATOK {}", escape(text)),
            Directive::Timeout(timeout) => format!("SETTIMEOUT {}", timeout.as_secs()),
            Directive::Option(option) => format!("OPTION {}", escape(option)),
            Directive::Raw(command) => command.clone(),
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_command())
    }
}

/// What to ask for with `GETINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    /// The program's version string.
    Version,
    /// The program's process id.
    Pid,
    /// The flavor, e.g. `gtk2` or `curses`.
    Flavor,
    /// The tty the program is attached to.
    TtyInfo,
}

impl std::fmt::Display for InfoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfoKind::Version => write!(f, "version"),
            InfoKind::Pid => write!(f, "pid"),
            InfoKind::Flavor => write!(f, "flavor"),
            InfoKind::TtyInfo => write!(f, "ttyinfo"),
        }
    }
}
