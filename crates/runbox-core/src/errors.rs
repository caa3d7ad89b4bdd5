//! Error types for the execution sandbox
//!
//! Failures are grouped by the layer that produces them. Lower layers never
//! retry; every failure bubbles up to the invocation boundary where it becomes
//! exactly one terminal outcome for the caller. A timeout is not
//! an error anywhere in this hierarchy: it is a run whose exit code is absent.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the container pool, the container runtime client and the
/// host-to-worker exchange.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Container runtime error: {0}")]
    Runtime(String),
    #[error("Worker exchange failed: {0}")]
    Exchange(String),
    #[error("Worker exchange timed out")]
    ExchangeTimeout,
    #[error("Worker responded with HTTP status {0}")]
    WorkerStatus(u16),
    #[error("Invalid pool size: {0}")]
    InvalidPoolSize(usize),
    #[error("Sandbox is shutting down")]
    ShuttingDown,
    #[error("Job was dropped before the worker reported back")]
    JobDropped,
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SandboxError::ExchangeTimeout
        } else {
            SandboxError::Exchange(err.to_string())
        }
    }
}

/// Errors raised while spawning or supervising a local process.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error while supervising process: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised by format converters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("No converter available for format '{0}'")]
    Unsupported(String),
    #[error("{format} conversion failed: {message}")]
    Failed { format: String, message: String },
}

impl ConvertError {
    pub fn failed(format: &str, message: impl Into<String>) -> Self {
        ConvertError::Failed {
            format: format.to_string(),
            message: message.into(),
        }
    }
}

/// Errors raised while loading configuration or the algorithm catalog.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Messages collected for one request field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldError {
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Field keyed validation failures, rendered to callers as
/// `{"errors": {"<field>": {"messages": [...], "value": ...}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>, value: Option<Value>) {
        let entry = self.0.entry(field.into()).or_default();
        entry.messages.push(message.into());
        if entry.value.is_none() {
            entry.value = value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&FieldError> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|(field, err)| format!("{}: {}", field, err.messages.join(", ")))
            .collect();
        write!(f, "{}", rendered.join("; "))
    }
}

/// Terminal outcome of a failed invocation.
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("Compilation failed: {}", .0.join("; "))]
    Compilation(Vec<String>),
    #[error("Run failed: {0}")]
    RunFailure(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ValidationErrors> for InvokeError {
    fn from(errors: ValidationErrors) -> Self {
        InvokeError::Validation(errors)
    }
}

impl From<SandboxError> for InvokeError {
    fn from(err: SandboxError) -> Self {
        InvokeError::RunFailure(err.to_string())
    }
}

impl From<RunError> for InvokeError {
    fn from(err: RunError) -> Self {
        InvokeError::RunFailure(err.to_string())
    }
}

impl InvokeError {
    pub fn status_code(&self) -> u16 {
        match self {
            InvokeError::Validation(_) => 400,
            InvokeError::Compilation(_) | InvokeError::RunFailure(_) | InvokeError::IoError(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            InvokeError::Validation(_) => "validation_error",
            InvokeError::Compilation(_) => "compilation_error",
            InvokeError::RunFailure(_) => "run_failure",
            InvokeError::IoError(_) => "io_error",
        }
    }

    /// Response document handed to the caller instead of the output JSON.
    pub fn to_body(&self) -> Value {
        match self {
            InvokeError::Validation(errors) => json!({ "errors": errors }),
            InvokeError::Compilation(messages) => json!({
                "errors": { "files": { "messages": messages } }
            }),
            InvokeError::RunFailure(message) => json!({ "fatal_error": message }),
            InvokeError::IoError(err) => json!({ "fatal_error": err.to_string() }),
        }
    }
}
