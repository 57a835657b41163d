//! Trait definitions for pluggable components.
//!
//! These traits define the interfaces for:
//! - The byte-line channel to the pinentry program
//! - Scoring a PIN while it is typed (quality bar)
//!
//! By using traits, the session engine can be tested with a scripted
//! transport and callers can supply their own transport with a timeout or
//! cancellation scheme of their choosing.

use std::io;

/// A duplex line channel to a pinentry program.
///
/// The session owns its transport exclusively and calls it from a single
/// thread. Every call may block; a program that never answers blocks
/// `read_line` forever unless the implementation enforces its own deadline.
///
/// # Example (in-memory implementation)
///
/// ```ignore
/// struct Loopback {
///     replies: VecDeque<Vec<u8>>,
/// }
///
/// impl Transport for Loopback {
///     fn start(&mut self, _program: &str, _args: &[String]) -> io::Result<()> {
///         Ok(())
///     }
///     fn write(&mut self, data: &[u8]) -> io::Result<usize> {
///         Ok(data.len())
///     }
///     fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
///         Ok(self.replies.pop_front())
///     }
///     fn close(&mut self) -> io::Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait Transport {
    /// Start the program with the given arguments.
    fn start(&mut self, program: &str, args: &[String]) -> io::Result<()>;

    /// Write the bytes, returning how many were written.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read the next line without its `\n` terminator.
    ///
    /// Returns `Ok(None)` at end of stream.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Release the program.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn start(&mut self, program: &str, args: &[String]) -> io::Result<()> {
        (**self).start(program, args)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        (**self).read_line()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Scores a PIN, or a prefix of it, for the quality bar.
///
/// Return `Some(score)` with a score between -100 and 100 (out-of-range
/// values are clamped), or `None` for no opinion. A negative score turns the
/// bar red.
///
/// Any `Fn(&str) -> Option<i32> + Send` closure is an evaluator:
///
/// ```
/// use pinentry_core::QualityEvaluator;
///
/// let by_length = |pin: &str| Some(10 * pin.len() as i32);
/// assert_eq!(by_length.evaluate("abc"), Some(30));
/// ```
///
/// The evaluator runs while a `GETPIN` is in flight and must not call back
/// into the same session.
pub trait QualityEvaluator: Send {
    /// Score a candidate PIN.
    fn evaluate(&self, candidate: &str) -> Option<i32>;
}

impl<F> QualityEvaluator for F
where
    F: Fn(&str) -> Option<i32> + Send,
{
    fn evaluate(&self, candidate: &str) -> Option<i32> {
        self(candidate)
    }
}

/// An evaluator with no opinion on any PIN.
///
/// Used when the quality bar is enabled without an evaluator; every
/// inquiry is answered with `CAN`.
pub struct NoOpinion;

impl QualityEvaluator for NoOpinion {
    fn evaluate(&self, _candidate: &str) -> Option<i32> {
        None
    }
}
