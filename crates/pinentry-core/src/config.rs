//! Configuration types and loading for pinentry-client.
//!
//! Configuration is loaded from `~/.config/pinentry-client/config.toml`.
//!
//! # Error Handling
//!
//! - If the config file doesn't exist, default values are returned.
//! - If the config file exists but is invalid, an error is returned (fail fast).
//!
//! # Example Configuration
//!
//! ```toml
//! [pinentry]
//! program = "pinentry-gnome3"   # default: gpg-agent.conf, then "pinentry"
//! args = ["--display", ":0"]
//! debug = false
//! no_global_grab = true
//! timeout = 60                  # seconds
//! options = ["default-ok=Unlock", "allow-external-password-cache"]
//! gpg_tty = true                # pass $GPG_TTY as ttyname
//! use_gpg_agent_conf = true     # read pinentry-program from gpg-agent.conf
//!
//! [prompt]
//! title = "Passphrase"
//! description = "Enter the passphrase to continue"
//! prompt = "Passphrase:"
//! ok = "Unlock"
//! cancel = "Abort"
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::session::{SessionBuilder, DEFAULT_PROGRAM};

static PINENTRY_PROGRAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*pinentry-program\s+(\S+)").expect("valid pinentry-program regex")
});

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Which program to start and how.
    pub pinentry: PinentryConfig,
    /// Default dialog texts.
    pub prompt: PromptConfig,
}

/// Configuration for the pinentry program.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinentryConfig {
    /// Program to start (default: from gpg-agent.conf, then `pinentry`).
    pub program: Option<String>,
    /// Extra program arguments.
    pub args: Vec<String>,
    /// Pass `--debug` (default: false).
    pub debug: bool,
    /// Pass `--no-global-grab` (default: false).
    pub no_global_grab: bool,
    /// Dialog timeout in seconds (default: none).
    pub timeout: Option<u64>,
    /// `OPTION` lines sent after the greeting.
    pub options: Vec<String>,
    /// Send `$GPG_TTY` as the `ttyname` option (default: true).
    pub gpg_tty: bool,
    /// Fall back to `pinentry-program` from gpg-agent.conf (default: true).
    pub use_gpg_agent_conf: bool,
}

impl Default for PinentryConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            debug: false,
            no_global_grab: false,
            timeout: None,
            options: Vec::new(),
            gpg_tty: true,
            use_gpg_agent_conf: true,
        }
    }
}

/// Default dialog texts. Unset fields leave the program's own defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromptConfig {
    pub title: Option<String>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub ok: Option<String>,
    pub cancel: Option<String>,
}

impl Config {
    /// Returns the default configuration file path.
    ///
    /// Returns `~/.config/pinentry-client/config.toml` using `dirs::config_dir()`,
    /// or `None` if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pinentry-client").join("config.toml"))
    }

    /// Load configuration from the default path.
    ///
    /// - Returns `Ok(Config::default())` if no config file exists.
    /// - Returns `Err` if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Get the program to start.
    ///
    /// Resolution order:
    /// 1. `program` from `[pinentry]`
    /// 2. `pinentry-program` from gpg-agent.conf, if `use_gpg_agent_conf` is set
    /// 3. `pinentry`
    pub fn resolve_program(&self) -> String {
        self.resolve_program_with(gpg_agent_conf_path().as_deref())
    }

    /// Like [`Config::resolve_program`], reading gpg-agent.conf from `agent_conf`.
    pub fn resolve_program_with(&self, agent_conf: Option<&Path>) -> String {
        if let Some(program) = &self.pinentry.program {
            return program.clone();
        }

        if self.pinentry.use_gpg_agent_conf {
            let configured = agent_conf
                .and_then(|path| std::fs::read_to_string(path).ok())
                .and_then(|contents| pinentry_program(&contents));
            if let Some(program) = configured {
                debug!(program = %program, "Using pinentry-program from gpg-agent.conf");
                return program;
            }
        }

        DEFAULT_PROGRAM.to_string()
    }

    /// Create a session builder carrying this configuration.
    pub fn builder(&self) -> SessionBuilder {
        self.builder_with_program(self.resolve_program())
    }

    fn builder_with_program(&self, program: String) -> SessionBuilder {
        let pinentry = &self.pinentry;
        let mut builder = SessionBuilder::new()
            .program(program)
            .args(pinentry.args.iter().cloned());

        if pinentry.debug {
            builder = builder.debug();
        }
        if pinentry.no_global_grab {
            builder = builder.no_global_grab();
        }
        if pinentry.gpg_tty {
            builder = builder.gpg_tty();
        }
        builder = builder.options(pinentry.options.iter().cloned());
        if let Some(secs) = pinentry.timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let prompt = &self.prompt;
        if let Some(title) = &prompt.title {
            builder = builder.title(title.as_str());
        }
        if let Some(description) = &prompt.description {
            builder = builder.description(description.as_str());
        }
        if let Some(text) = &prompt.prompt {
            builder = builder.prompt(text.as_str());
        }
        if let Some(ok) = &prompt.ok {
            builder = builder.ok_label(ok.as_str());
        }
        if let Some(cancel) = &prompt.cancel {
            builder = builder.cancel_label(cancel.as_str());
        }
        builder
    }
}

/// Returns the path of gpg-agent.conf, honouring `$GNUPGHOME`.
pub fn gpg_agent_conf_path() -> Option<PathBuf> {
    std::env::var_os("GNUPGHOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".gnupg")))
        .map(|dir| dir.join("gpg-agent.conf"))
}

/// Extract the `pinentry-program` setting from gpg-agent.conf contents.
///
/// The last occurrence wins, as gpg-agent lets a later option override an
/// earlier one.
pub fn pinentry_program(contents: &str) -> Option<String> {
    PINENTRY_PROGRAM
        .captures_iter(contents)
        .last()
        .map(|captures| captures[1].to_string())
}
