//! Argument vector compilation
//!
//! Turns an algorithm's ordered parameter schema plus the caller's argument
//! map into a concrete argv. `File` parameters are materialized on disk inside
//! the invocation's private directory and every generated file name is
//! recorded in the path mapping at the argv index it occupies, so a remote
//! worker can later rewrite it to its own local path.

use crate::converters::ConverterRegistry;
use crate::encoding::TextEncoding;
use crate::errors::{InvokeError, ValidationErrors};
use crate::model::{
    check_required, supplied_values, AlgorithmSpec, CompiledCall, FileArg, InlineData, InlinePayload,
    Parameter, ParameterKind, UploadedFile, COMMAND_MAPPING_INDEX, OUTPUT_DIR_PARAM,
};
use futures_util::future::join_all;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

/// Name of the output directory inside an invocation directory.
pub const FILES_DIR: &str = "files";

/// Filesystem locations a compilation works against.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    /// Directory holding the algorithm's installed files.
    pub app_dir: &'a Path,
    /// Private per-invocation directory; inputs land here, outputs in `files/`.
    pub invocation_dir: &'a Path,
}

enum Materialization {
    Relocate { from: PathBuf, to: PathBuf },
    Write { to: PathBuf, bytes: Vec<u8> },
}

impl Materialization {
    fn target(&self) -> &Path {
        match self {
            Materialization::Relocate { to, .. } | Materialization::Write { to, .. } => to,
        }
    }

    async fn apply(&self) -> Result<(), String> {
        match self {
            Materialization::Write { to, bytes } => tokio::fs::write(to, bytes)
                .await
                .map_err(|e| format!("failed to write {}: {}", to.display(), e)),
            Materialization::Relocate { from, to } => {
                if tokio::fs::rename(from, to).await.is_ok() {
                    return Ok(());
                }
                // rename fails across filesystems
                tokio::fs::copy(from, to).await.map_err(|e| {
                    format!(
                        "failed to relocate {} to {}: {}",
                        from.display(),
                        to.display(),
                        e
                    )
                })?;
                if let Err(e) = tokio::fs::remove_file(from).await {
                    log::warn!("Failed to remove relocated upload {}: {}", from.display(), e);
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArgumentCompiler {
    converters: Arc<ConverterRegistry>,
}

impl ArgumentCompiler {
    pub fn new(converters: Arc<ConverterRegistry>) -> Self {
        Self { converters }
    }

    pub async fn compile(
        &self,
        spec: &AlgorithmSpec,
        args: &Map<String, Value>,
        uploads: &[UploadedFile],
        ctx: CompileContext<'_>,
    ) -> Result<CompiledCall, InvokeError> {
        let mut missing = ValidationErrors::new();
        check_required(spec, args, &mut missing);
        missing.into_result()?;

        let output_dir = ctx.invocation_dir.join(FILES_DIR);
        tokio::fs::create_dir_all(&output_dir).await?;

        let mut path_mapping = BTreeMap::new();
        let (command, working_dir) = compile_command(spec, ctx.app_dir, &mut path_mapping);

        let mut parameters: Vec<&Parameter> = spec.parameters.iter().collect();
        parameters.sort_by_key(|p| p.position);

        let mut argv: Vec<String> = Vec::new();
        let mut pending: Vec<Materialization> = Vec::new();
        let mut targets: HashSet<PathBuf> = HashSet::new();
        let mut failures: Vec<String> = Vec::new();

        for param in parameters {
            if param.name == OUTPUT_DIR_PARAM {
                push_flag(&mut argv, param);
                path_mapping.insert(OUTPUT_DIR_PARAM.to_string(), argv.len() as i64);
                argv.push(path_string(&output_dir));
                continue;
            }

            let Some(values) = resolve_values(param, args) else {
                continue;
            };
            push_flag(&mut argv, param);

            if param.kind == ParameterKind::Primitive {
                argv.extend(values.iter().map(render_primitive));
                continue;
            }

            for value in &values {
                let (name, materialization) = match FileArg::from_value(value) {
                    Err(message) => {
                        failures.push(format!("{}: {}", param.name, message));
                        continue;
                    }
                    Ok(FileArg::PathRef(path)) => {
                        argv.push(format!(".{}{}", MAIN_SEPARATOR, path));
                        continue;
                    }
                    Ok(FileArg::Upload(reference)) => {
                        let Some(upload) = uploads
                            .iter()
                            .find(|u| u.original_name == reference.name && u.size == reference.size)
                        else {
                            failures.push(format!("'{}' file not found", reference.name));
                            continue;
                        };
                        let name = relocated_name(upload);
                        let to = ctx.invocation_dir.join(&name);
                        let from = upload.path.clone();
                        (name, Materialization::Relocate { from, to })
                    }
                    Ok(FileArg::Inline(inline)) => match self.render_inline(&inline) {
                        Err(message) => {
                            failures.push(format!("{}: {}", param.name, message));
                            continue;
                        }
                        Ok(bytes) => {
                            let name = content_name(&inline);
                            let to = ctx.invocation_dir.join(&name);
                            (name, Materialization::Write { to, bytes })
                        }
                    },
                };

                path_mapping.insert(name, argv.len() as i64);
                argv.push(path_string(materialization.target()));
                if targets.insert(materialization.target().to_path_buf()) {
                    pending.push(materialization);
                }
            }
        }

        let results = join_all(pending.iter().map(Materialization::apply)).await;
        let mut materialized_files = Vec::with_capacity(pending.len());
        for (materialization, result) in pending.iter().zip(results) {
            match result {
                Ok(()) => materialized_files.push(materialization.target().to_path_buf()),
                Err(message) => failures.push(message),
            }
        }

        if !failures.is_empty() {
            for path in &materialized_files {
                let _ = tokio::fs::remove_file(path).await;
            }
            log::warn!(
                "Compilation of '{}' failed with {} error(s)",
                spec.id,
                failures.len()
            );
            return Err(InvokeError::Compilation(failures));
        }

        log::debug!("Compiled '{}': {} {:?}", spec.id, command, argv);
        Ok(CompiledCall {
            command,
            argv,
            path_mapping,
            materialized_files,
            working_dir,
            output_dir,
        })
    }

    fn render_inline(&self, inline: &InlineData) -> Result<Vec<u8>, String> {
        let text = match &inline.payload {
            InlinePayload::Raw(raw) => raw.clone(),
            InlinePayload::Structured(data) if self.converters.is_parsable(&inline.extension) => self
                .converters
                .parse(&inline.extension, data)
                .map_err(|e| e.to_string())?,
            InlinePayload::Structured(Value::String(text)) => text.clone(),
            InlinePayload::Structured(other) => other.to_string(),
        };
        Ok(TextEncoding::from_name(Some(&inline.encoding)).encode(&text))
    }
}

fn compile_command(
    spec: &AlgorithmSpec,
    app_dir: &Path,
    mapping: &mut BTreeMap<String, i64>,
) -> (String, Option<PathBuf>) {
    let working_dir = (!spec.files.is_empty()).then(|| app_dir.to_path_buf());
    if spec.entry.is_local_file {
        mapping.insert(spec.entry.path.clone(), COMMAND_MAPPING_INDEX);
        (path_string(&app_dir.join(&spec.entry.path)), working_dir)
    } else {
        (spec.entry.path.clone(), working_dir)
    }
}

/// Values a parameter contributes, or `None` when it contributes nothing.
fn resolve_values(param: &Parameter, args: &Map<String, Value>) -> Option<Vec<Value>> {
    let default = param
        .options
        .default
        .as_deref()
        .filter(|d| !d.is_empty())
        .map(|d| vec![Value::String(d.to_string())]);

    if param.options.is_static {
        return default;
    }

    match args.get(&param.name) {
        None if param.options.required => default,
        None => None,
        Some(value) => supplied_values(param, value).or(default),
    }
}

fn push_flag(argv: &mut Vec<String>, param: &Parameter) {
    if let Some(flag) = param.flag.as_deref().filter(|f| !f.is_empty()) {
        argv.push(flag.to_string());
    }
}

fn render_primitive(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn relocated_name(upload: &UploadedFile) -> String {
    match Path::new(&upload.original_name)
        .extension()
        .and_then(|e| e.to_str())
    {
        Some(ext) if !ext.is_empty() => format!("{}.{}", upload.stored_name, ext),
        _ => upload.stored_name.clone(),
    }
}

/// Content-addressed file name for inline data: SHA-256 over the canonical
/// JSON serialization of the payload, plus the declared extension.
pub fn content_name(inline: &InlineData) -> String {
    let serialized = match &inline.payload {
        InlinePayload::Raw(raw) => Value::String(raw.clone()).to_string(),
        InlinePayload::Structured(data) => canonicalize(data).to_string(),
    };
    let digest = Sha256::digest(serialized.as_bytes());
    let mut name = format!("{:x}", digest);
    if !inline.extension.is_empty() {
        name.push('.');
        name.push_str(&inline.extension);
    }
    name
}

/// Recursively sorts object keys so JSON-equal values serialize identically.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(object.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&object[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
