//! Request preflight
//!
//! Applies defaults to a client call, casts loosely typed options and checks
//! the arguments against the algorithm's schema. Nothing is written to disk
//! and no process is started; every problem found is reported at once.

use crate::errors::ValidationErrors;
use crate::model::{
    check_required, is_truthy, AlgorithmSpec, FileArg, InvocationRequest, OutputFormat,
    OutputSelection, ParameterKind, UploadedFile,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// A client call as received, before any casting.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawInvocation {
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub options: RawOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawOptions {
    #[serde(default)]
    pub timeout: Option<Value>,
    #[serde(default)]
    pub secure: Option<Value>,
    #[serde(default)]
    pub output: RawOutputOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawOutputOptions {
    #[serde(default)]
    pub mode: Option<Value>,
    #[serde(default)]
    pub stdout: Option<Value>,
    #[serde(default)]
    pub stderr: Option<Value>,
    #[serde(default)]
    pub files: Option<Value>,
}

const MISSING_ENTRY: &str =
    "Requested application is missing an entry app. The application was not properly configured.";

/// Validates `raw` against `spec` and produces the immutable request the
/// core runs. Option casting errors are reported before argument errors.
pub fn prepare(
    algorithm_ref: &str,
    raw: RawInvocation,
    spec: &AlgorithmSpec,
    uploads: &[UploadedFile],
    default_timeout: Duration,
) -> Result<InvocationRequest, ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let output = &raw.options.output;
    let stdout = cast_bool(&mut errors, "options.output.stdout", output.stdout.as_ref());
    let stderr = cast_bool(&mut errors, "options.output.stderr", output.stderr.as_ref());
    let files = cast_bool(&mut errors, "options.output.files", output.files.as_ref());
    let secure = cast_bool(&mut errors, "options.secure", raw.options.secure.as_ref()).unwrap_or(false);
    let output_format = cast_mode(&mut errors, output.mode.as_ref());
    let timeout = cast_timeout(&mut errors, raw.options.timeout.as_ref(), default_timeout);
    errors.into_result()?;

    let mut errors = ValidationErrors::new();
    let arguments = check_arguments(&mut errors, raw.args, spec, uploads);
    check_required(spec, &arguments, &mut errors);
    errors.into_result()?;

    if spec.entry.path.trim().is_empty() {
        let mut errors = ValidationErrors::new();
        errors.add("messages", MISSING_ENTRY, None);
        return Err(errors);
    }

    let defaults = OutputSelection::default();
    Ok(InvocationRequest {
        algorithm_ref: algorithm_ref.to_string(),
        arguments,
        secure,
        timeout,
        output_selection: OutputSelection {
            stdout: stdout.unwrap_or(defaults.stdout),
            stderr: stderr.unwrap_or(defaults.stderr),
            files: files.unwrap_or(defaults.files),
        },
        output_format: output_format.unwrap_or_default(),
    })
}

fn cast_bool(errors: &mut ValidationErrors, field: &str, value: Option<&Value>) -> Option<bool> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) if s == "true" => Some(true),
        Some(Value::String(s)) if s == "false" => Some(false),
        Some(other) => {
            errors.add(
                field,
                format!("Failed to cast `{}` ({}) to boolean.", field, display(other)),
                Some(other.clone()),
            );
            None
        }
    }
}

fn cast_mode(errors: &mut ValidationErrors, value: Option<&Value>) -> Option<OutputFormat> {
    let value = value.filter(|v| !v.is_null())?;
    let mode = match value {
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(OutputFormat::Raw),
            Some(1) => Some(OutputFormat::Parsed),
            _ => None,
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "0" | "raw" => Some(OutputFormat::Raw),
            "1" | "parsed" => Some(OutputFormat::Parsed),
            _ => None,
        },
        _ => None,
    };
    if mode.is_none() {
        errors.add(
            "options.output.mode",
            format!("`options.output.mode` ({}) out of range.", display(value)),
            Some(value.clone()),
        );
    }
    mode
}

fn cast_timeout(errors: &mut ValidationErrors, value: Option<&Value>, default: Duration) -> Duration {
    let millis = match value {
        None | Some(Value::Null) => return default,
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match millis {
        Some(0) => default,
        Some(ms) => Duration::from_millis(ms),
        None => {
            let value = value.cloned().unwrap_or(Value::Null);
            errors.add(
                "options.timeout",
                format!("Failed to cast `options.timeout` ({}) to integer.", display(&value)),
                Some(value),
            );
            default
        }
    }
}

/// Checks every supplied argument and returns them normalized: truthy
/// scalars wrapped in arrays and empty file slots removed.
fn check_arguments(
    errors: &mut ValidationErrors,
    args: Map<String, Value>,
    spec: &AlgorithmSpec,
    uploads: &[UploadedFile],
) -> Map<String, Value> {
    let mut normalized = Map::with_capacity(args.len());

    for (name, value) in args {
        let Some(param) = spec.parameter(&name) else {
            errors.add("args", format!("Invalid arg ({}).", name), Some(Value::String(name)));
            continue;
        };

        let values = match value {
            Value::Array(values) => values,
            value if is_truthy(&value) => vec![value],
            value => {
                normalized.insert(name, value);
                continue;
            }
        };

        if param.options.is_static || param.kind == ParameterKind::Primitive {
            normalized.insert(name, Value::Array(values));
            continue;
        }

        let mut kept = Vec::with_capacity(values.len());
        for (n, value) in values.into_iter().filter(is_truthy).enumerate() {
            let field = format!("args.{}.{}", name, n);
            match FileArg::from_value(&value) {
                Err(message) => errors.add(field, message, Some(value.clone())),
                Ok(FileArg::PathRef(path)) => {
                    if !spec.files.contains(&path) {
                        errors.add(field, format!("'{}' file not found", path), Some(value.clone()));
                    }
                }
                Ok(FileArg::Upload(reference)) => {
                    let found = uploads
                        .iter()
                        .any(|u| u.original_name == reference.name && u.size == reference.size);
                    if !found {
                        errors.add(
                            field,
                            format!("'{}' file not found", reference.name),
                            Some(value.clone()),
                        );
                    }
                }
                Ok(FileArg::Inline(_)) => {}
            }
            kept.push(value);
        }
        normalized.insert(name, Value::Array(kept));
    }
    normalized
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
