//! CLI error types with miette diagnostics.
//!
//! Maps library errors into user-facing errors with exit codes a
//! supervisor can act on.

use miette::Diagnostic;
use thiserror::Error;

use fieldlink_config::ConfigError;
use fieldlink_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const CONNECTION: i32 = 7;
    /// Consumption stopped on a failure that may leave data inconsistent.
    pub const FATAL: i32 = 70;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid configuration value for {field}: {reason}")]
    #[diagnostic(
        code(fieldlink::validation),
        help("Fix the value in the config file or its FIELDLINK_ environment override.")
    )]
    Validation { field: String, reason: String },

    #[error("Configuration could not be loaded")]
    #[diagnostic(
        code(fieldlink::config),
        help("Run: fieldlink config path  to see which file is read.")
    )]
    Config(#[source] ConfigError),

    #[error("No controllers matched {requested}")]
    #[diagnostic(
        code(fieldlink::no_controllers),
        help("Configured controllers: {available}")
    )]
    NoControllers { requested: String, available: String },

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Could not start controller {controller}")]
    #[diagnostic(code(fieldlink::controller))]
    Controller {
        controller: String,
        #[source]
        source: CoreError,
    },

    #[error("Receiver stopped on an unrecoverable failure: {reason}")]
    #[diagnostic(
        code(fieldlink::fatal),
        help("The message was requeued. Restarting the receiver resumes consumption.")
    )]
    Fatal { reason: String },

    #[error(transparent)]
    #[diagnostic(code(fieldlink::core))]
    Core(CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::NoControllers { .. } => exit_code::USAGE,
            Self::Config(_) => exit_code::CONFIG,
            Self::Controller { .. } => exit_code::CONNECTION,
            Self::Fatal { .. } => exit_code::FATAL,
            Self::Core(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Fatal { reason } => Self::Fatal { reason },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            other => Self::Core(other),
        }
    }
}
