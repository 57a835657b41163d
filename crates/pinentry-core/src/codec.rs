//! Wire-level encoding of the Assuan dialect.
//!
//! Every function here is pure: percent-escaping of command arguments,
//! lenient unescaping of data payloads, classification of reply lines and
//! decoding of `ERR` lines. Lines passed in never carry their trailing
//! `\n`.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::protocol::{AssuanError, ProtocolError};

/// Status keyword sent when the PIN was served from an external cache.
pub const STATUS_PASSWORD_FROM_CACHE: &str = "PASSWORD_FROM_CACHE";

/// Status keyword sent when the user entered the PIN twice and both matched.
pub const STATUS_PIN_REPEATED: &str = "PIN_REPEATED";

/// Reply line sent when the user declines a `CONFIRM`.
pub const NOT_CONFIRMED: &[u8] = b"ASSUAN_Not_Confirmed";

/// Inquiry keyword used to ask for the quality of a partial PIN.
pub const INQUIRE_QUALITY: &str = "QUALITY";

/// Well-known `OPTION` names understood by pinentry programs.
pub mod options {
    pub const ALLOW_EXTERNAL_PASSWORD_CACHE: &str = "allow-external-password-cache";
    pub const DEFAULT_OK: &str = "default-ok";
    pub const DEFAULT_CANCEL: &str = "default-cancel";
    pub const DEFAULT_PROMPT: &str = "default-prompt";
    pub const TTY_NAME: &str = "ttyname";
    pub const TTY_TYPE: &str = "ttytype";
    pub const LC_CTYPE: &str = "lc-ctype";
}

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)\AERR ([0-9]+) (.*)\z").expect("valid error line regex")
});

/// A classified reply line.
///
/// Borrowed slices point into the line that was classified and never
/// include the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    /// Empty or whitespace only.
    Blank,
    /// Starts with `#`.
    Comment,
    /// Starts with `OK`; holds whatever follows it.
    Ok(&'a [u8]),
    /// Starts with `ERR `; holds the whole line for [`decode_error`].
    Error(&'a [u8]),
    /// `D <payload>`; the payload is still percent-encoded.
    Data(&'a [u8]),
    /// `S <keyword> [args]`.
    Status {
        keyword: &'a [u8],
        args: &'a [u8],
    },
    /// `INQUIRE <keyword> [argument]`; the argument is still percent-encoded.
    Inquire {
        keyword: &'a [u8],
        argument: &'a [u8],
    },
    /// Anything else, compared verbatim by the caller.
    Other(&'a [u8]),
}

impl Line<'_> {
    /// Returns whether the line carries no protocol meaning.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Line::Blank | Line::Comment)
    }
}

/// Escape a string for use as a single command argument.
///
/// `\n`, `\r` and `%` are percent-encoded; every other byte is kept.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => escaped.push_str("%0A"),
            '\r' => escaped.push_str("%0D"),
            '%' => escaped.push_str("%25"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Reverse percent-encoding.
///
/// Only `%XY` with two uppercase hexadecimal digits is decoded. Any other
/// `%` is copied literally: some pinentry builds do not escape the PIN in
/// `INQUIRE QUALITY` lines.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut unescaped = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'%' && i + 2 < data.len() {
            if let (Some(hi), Some(lo)) = (hex_value(data[i + 1]), hex_value(data[i + 2])) {
                unescaped.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        unescaped.push(data[i]);
        i += 1;
    }
    unescaped
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Classify a reply line.
pub fn classify(line: &[u8]) -> Line<'_> {
    if line.iter().all(|&b| is_space(b)) {
        Line::Blank
    } else if line.starts_with(b"#") {
        Line::Comment
    } else if let Some(rest) = line.strip_prefix(b"OK") {
        Line::Ok(rest)
    } else if line.starts_with(b"ERR ") {
        Line::Error(line)
    } else if let Some(payload) = line.strip_prefix(b"D ") {
        Line::Data(payload)
    } else if let Some(rest) = line.strip_prefix(b"S ") {
        let (keyword, args) = split_word(rest);
        Line::Status { keyword, args }
    } else if let Some(rest) = line.strip_prefix(b"INQUIRE ") {
        let (keyword, argument) = split_word(rest);
        Line::Inquire { keyword, argument }
    } else {
        Line::Other(line)
    }
}

/// ASCII whitespace including vertical tab, which
/// `u8::is_ascii_whitespace` leaves out.
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\x0B' | b'\x0C' | b'\r')
}

fn split_word(rest: &[u8]) -> (&[u8], &[u8]) {
    match rest.iter().position(|&b| b == b' ') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, &rest[rest.len()..]),
    }
}

/// Decode an `ERR <code> <description>` line.
///
/// A code that does not fit a `u32` decodes as 0. Lines that do not match
/// the pattern are reported as unexpected responses.
pub fn decode_error(line: &[u8]) -> Result<AssuanError, ProtocolError> {
    let captures = ERROR_LINE
        .captures(line)
        .ok_or_else(|| ProtocolError::unexpected(line))?;
    let code = std::str::from_utf8(&captures[1])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0);
    let description = String::from_utf8_lossy(&captures[2]).into_owned();
    Ok(AssuanError::new(code, description))
}

/// Render a wire line for logging with secret-bearing payloads hidden.
///
/// Data lines and inquiry arguments can hold the PIN (or a prefix of it).
pub fn redact(line: &[u8]) -> String {
    match classify(line) {
        Line::Data(_) => "D [REDACTED]".to_string(),
        Line::Inquire { keyword, argument } if !argument.is_empty() => format!(
            "INQUIRE {} [REDACTED]",
            String::from_utf8_lossy(keyword)
        ),
        _ => String::from_utf8_lossy(line).into_owned(),
    }
}
