//! Error types for embellish-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for embellish-core
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Render-tree errors
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// A data provider failed to produce a payload
    #[error("Provider error: {0}")]
    Provider(String),

    /// A data provider did not settle within the configured timeout
    #[error("Provider timed out after {0} ms")]
    Timeout(u64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Host(_) => None,
            Self::Provider(_) | Self::Timeout(_) => Some(
                Remediation::new("The provider result is not cached; the next navigation retries it.")
                    .alternative("Raise [fetch] timeout_ms if the provider is slow."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(Remediation::new("Validate the JSON input and retry.")),
        }
    }
}

/// Key-value persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage quota exceeded writing {key} ({needed} bytes, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store contents are corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether a forced eviction might make room for the failed write.
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::QuotaExceeded { .. } => Remediation::new(
                "Free cache space by evicting the oldest entries.",
            )
            .command("Force cleanup", "embellish cache cleanup --force")
            .command("Clear cache", "embellish cache clear"),
            Self::Io(_) => Remediation::new("Check that the store file is readable and writable.")
                .command("Inspect", "embellish cache stats"),
            Self::Corrupt(_) => Remediation::new("The store file could not be parsed.")
                .command("Reset", "embellish cache clear")
                .alternative("Delete the store file; it is rebuilt on the next write."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { .. } => Remediation::new("Check the config path and its permissions.")
                .command("Show defaults", "embellish config show"),
            Self::Parse(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Validate", "embellish config check <path>"),
            Self::Invalid { field, .. } => {
                Remediation::new(format!("Set a valid value for `{field}`."))
                    .command("Show defaults", "embellish config show")
            }
        }
    }
}

/// Render-tree errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("node {0} has no parent")]
    Detached(u64),
}
