//! Client side of the pinentry protocol.
//!
//! This crate starts a pinentry program (or talks to any other
//! [`Transport`]) and drives the Assuan dialect it speaks: dialog setup,
//! PIN entry with an optional live quality bar, confirmations, messages and
//! cache clearing.
//!
//! # Modules
//!
//! - [`codec`]: Percent-escaping and reply line classification
//! - [`protocol`]: Error types (`ProtocolError`, `AssuanError`)
//! - [`types`]: Value types (`SecretResult`, `Quality`, `Directive`)
//! - [`traits`]: Pluggable component traits (`Transport`, `QualityEvaluator`)
//! - [`session`]: The session engine (`SessionBuilder`, `Session`)
//! - [`process`]: Child-process transport
//! - [`config`]: TOML configuration and gpg-agent.conf discovery
//! - [`mock`]: Scripted transport for tests
//!
//! # Example
//!
//! ```
//! use pinentry_core::mock::ScriptedTransport;
//! use pinentry_core::SessionBuilder;
//! use secrecy::ExposeSecret;
//!
//! let transport = ScriptedTransport::new()
//!     .expect_start("pinentry", &[])
//!     .expect_read_line("OK Pleased to meet you")
//!     .expect_write_line("SETPROMPT PIN:")
//!     .expect_read_line("OK")
//!     .expect_write_line("GETPIN")
//!     .expect_read_line("D 1234")
//!     .expect_read_line("OK")
//!     .expect_write_line("BYE")
//!     .expect_read_line("OK closing connection")
//!     .expect_close();
//!
//! let mut session = SessionBuilder::new().prompt("PIN:").connect(transport)?;
//! let result = session.get_pin()?;
//! assert_eq!(result.pin.expose_secret(), "1234");
//! session.close()?;
//! # Ok::<(), pinentry_core::ProtocolError>(())
//! ```

pub mod codec;
pub mod config;
pub mod mock;
pub mod process;
pub mod protocol;
pub mod session;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root for convenience
pub use config::{Config, ConfigError, PinentryConfig, PromptConfig};
pub use process::ProcessTransport;
pub use protocol::{is_cancelled, AssuanError, ProtocolError, ERROR_CODE_CANCELLED};
pub use session::{Session, SessionBuilder, DEFAULT_PROGRAM};
pub use traits::{NoOpinion, QualityEvaluator, Transport};
pub use types::{Directive, InfoKind, Quality, QualityReply, SecretResult};
