//! Data model shared by the compiler, the runners and the output assembler
//!
//! Field names follow the JSON documents exchanged with clients and stored in
//! the algorithm catalog, so serde renames are used throughout. Legacy
//! spellings accepted by older clients (`extention`, `fileRgx`) are kept as
//! aliases.

use crate::errors::{ConfigError, ValidationErrors};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Reserved parameter bound to the invocation's private output directory.
pub const OUTPUT_DIR_PARAM: &str = "outputDir";

/// Path mapping entry used for the entry command itself.
pub const COMMAND_MAPPING_INDEX: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Primitive,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterOptions {
    /// Ignore caller input and always use `default`.
    #[serde(rename = "static", default)]
    pub is_static: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default, alias = "endpointId")]
    pub endpoint_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub flag: Option<String>,
    pub position: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub options: ParameterOptions,
}

impl Parameter {
    pub fn primitive(name: &str, position: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: ParameterKind::Primitive,
            flag: None,
            position,
            description: None,
            options: ParameterOptions::default(),
        }
    }

    pub fn file(name: &str, position: u32) -> Self {
        Self {
            kind: ParameterKind::File,
            ..Self::primitive(name, position)
        }
    }

    pub fn with_flag(mut self, flag: &str) -> Self {
        self.flag = Some(flag.to_string());
        self
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.options.default = Some(default.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.options.required = true;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.options.is_static = true;
        self
    }

    /// The synthesized output-directory parameter.
    pub fn output_dir(position: u32) -> Self {
        let mut param = Self::primitive(OUTPUT_DIR_PARAM, position).required().fixed();
        param.description = Some(
            "Output directory path. Files created by the application in this folder are returned."
                .to_string(),
        );
        param
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryCommand {
    /// Executable name, or a file name relative to the algorithm's app dir.
    #[serde(alias = "appName")]
    pub path: String,
    #[serde(default, alias = "localFile")]
    pub is_local_file: bool,
}

fn default_stdout_alias() -> String {
    "stdout".to_string()
}

fn default_stderr_alias() -> String {
    "stderr".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdoutSpec {
    #[serde(default = "default_stdout_alias")]
    pub alias: String,
    #[serde(default, alias = "extention")]
    pub format: Option<String>,
}

impl Default for StdoutSpec {
    fn default() -> Self {
        Self {
            alias: default_stdout_alias(),
            format: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StderrSpec {
    #[serde(default = "default_stderr_alias")]
    pub alias: String,
}

impl Default for StderrSpec {
    fn default() -> Self {
        Self {
            alias: default_stderr_alias(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutputSpec {
    #[serde(alias = "alias")]
    pub alias_group: String,
    #[serde(alias = "fileRgx")]
    pub match_pattern: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default, alias = "extention")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub stdout: StdoutSpec,
    #[serde(default)]
    pub stderr: StderrSpec,
    #[serde(default)]
    pub files: Vec<FileOutputSpec>,
}

/// A registered executable plus its declarative parameter and output schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmSpec {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(alias = "entryApp")]
    pub entry: EntryCommand,
    /// Installed files, relative to the algorithm's app dir.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub output: OutputSpec,
}

impl AlgorithmSpec {
    /// Acceptance checks run before a spec is registered: unique parameter
    /// names and mutually unique output aliases.
    pub fn check(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for param in &self.parameters {
            if !names.insert(param.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "algorithm '{}': duplicate parameter name '{}'",
                    self.id, param.name
                )));
            }
        }

        let mut aliases = HashSet::new();
        for group in &self.output.files {
            if !aliases.insert(group.alias_group.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "algorithm '{}': duplicate output alias '{}'",
                    self.id, group.alias_group
                )));
            }
            if group.alias_group == self.output.stdout.alias
                || group.alias_group == self.output.stderr.alias
            {
                return Err(ConfigError::Invalid(format!(
                    "algorithm '{}': output alias '{}' collides with a stream alias",
                    self.id, group.alias_group
                )));
            }
            regex::Regex::new(&group.match_pattern).map_err(|e| {
                ConfigError::Invalid(format!(
                    "algorithm '{}': invalid match pattern for '{}': {}",
                    self.id, group.alias_group, e
                ))
            })?;
        }

        if self.entry.path.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "algorithm '{}' is missing an entry command",
                self.id
            )));
        }
        Ok(())
    }

    /// Returns the spec with the output-directory parameter synthesized when
    /// output file groups are declared, and dropped when none are.
    pub fn normalized(mut self) -> Self {
        let existing = self
            .parameters
            .iter()
            .position(|p| p.name == OUTPUT_DIR_PARAM);

        match (existing, self.output.files.is_empty()) {
            (Some(idx), true) => {
                self.parameters.remove(idx);
            }
            (Some(idx), false) => {
                let current = &self.parameters[idx];
                let mut param = Parameter::output_dir(current.position);
                param.flag = current.flag.clone();
                self.parameters[idx] = param;
            }
            (None, false) => {
                let position = self.parameters.len() as u32;
                self.parameters.push(Parameter::output_dir(position));
            }
            (None, true) => {}
        }
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Which captured outputs the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSelection {
    pub stdout: bool,
    pub stderr: bool,
    pub files: bool,
}

impl Default for OutputSelection {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            files: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Parsed,
}

/// One client request to run an algorithm. Immutable once handed to the core.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub algorithm_ref: String,
    pub arguments: serde_json::Map<String, Value>,
    pub secure: bool,
    pub timeout: Duration,
    pub output_selection: OutputSelection,
    pub output_format: OutputFormat,
}

/// A file received with the client request, already stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub original_name: String,
    pub stored_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRef {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InlinePayload {
    /// Text written verbatim.
    Raw(String),
    /// JSON value, converted by the declared extension's converter if any.
    Structured(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineData {
    pub payload: InlinePayload,
    pub extension: String,
    pub encoding: String,
}

/// One value supplied for a `File` parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum FileArg {
    /// Name of a file already installed with the algorithm.
    PathRef(String),
    /// A file uploaded with this request, matched by name and size.
    Upload(UploadRef),
    Inline(InlineData),
}

impl FileArg {
    /// Interprets a caller supplied JSON value.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let object = match value {
            Value::String(path) => return Ok(FileArg::PathRef(path.clone())),
            Value::Object(object) => object,
            other => return Err(format!("unsupported file value: {}", other)),
        };

        if let Some(file_ref) = object.get("fileRef").filter(|v| !v.is_null()) {
            let name = file_ref.get("name").and_then(Value::as_str);
            let size = file_ref.get("size").and_then(Value::as_u64);
            return match (name, size) {
                (Some(name), Some(size)) => Ok(FileArg::Upload(UploadRef {
                    name: name.to_string(),
                    size,
                })),
                _ => Err("`name` and/or `size` properties are missing.".to_string()),
            };
        }

        let extension = match object.get("extension").or_else(|| object.get("extention")) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(ext)) => ext.clone(),
            Some(_) => return Err("`extention` property must be a string.".to_string()),
        };
        let encoding = match object.get("encoding") {
            None | Some(Value::Null) => "utf8".to_string(),
            Some(Value::String(enc)) => enc.clone(),
            Some(_) => return Err("`encoding` property must be a string.".to_string()),
        };

        let payload = match (object.get("rawData"), object.get("data")) {
            (Some(Value::String(raw)), _) if !raw.is_empty() => InlinePayload::Raw(raw.clone()),
            (Some(raw), _) if !raw.is_null() && !raw.is_string() => {
                return Err("`rawData` property must be of type string.".to_string())
            }
            (_, Some(data)) if !data.is_null() => InlinePayload::Structured(data.clone()),
            _ => return Err("Missing properties `data`, `rawData` or `fileRef`.".to_string()),
        };

        Ok(FileArg::Inline(InlineData {
            payload,
            extension,
            encoding,
        }))
    }
}

/// The concrete call derived from an invocation. Owned by that invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCall {
    pub command: String,
    pub argv: Vec<String>,
    /// Materialized file name (or [`OUTPUT_DIR_PARAM`], or the entry command)
    /// to the argv index it occupies.
    pub path_mapping: BTreeMap<String, i64>,
    pub materialized_files: Vec<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Where a finished run left its captured outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    /// `None` when the run was killed on timeout.
    pub exit_code: Option<i32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub files_dir: PathBuf,
}

/// Collects the request-level validation failures for a spec: used by both
/// the preflight and the compiler so they agree on what "required" means.
pub(crate) fn check_required(
    spec: &AlgorithmSpec,
    args: &serde_json::Map<String, Value>,
    errors: &mut ValidationErrors,
) {
    for param in &spec.parameters {
        if param.name == OUTPUT_DIR_PARAM || param.options.is_static {
            continue;
        }
        let supplied = args
            .get(&param.name)
            .and_then(|value| supplied_values(param, value))
            .is_some();
        let has_default = param
            .options
            .default
            .as_deref()
            .map(|d| !d.is_empty())
            .unwrap_or(false);
        if param.options.required && !supplied && !has_default {
            errors.add(
                "messages",
                format!(
                    "The parameter `{}` is required but no default values are available.",
                    param.name
                ),
                None,
            );
        }
    }
}

/// The values a caller supplied for `param`, or `None` when nothing usable
/// was given. File slots that are empty do not count.
pub(crate) fn supplied_values(param: &Parameter, value: &Value) -> Option<Vec<Value>> {
    if !is_truthy(value) {
        return None;
    }
    let values = match value {
        Value::Array(values) => values.clone(),
        other => vec![other.clone()],
    };
    let values: Vec<Value> = match param.kind {
        ParameterKind::File => values.into_iter().filter(is_truthy).collect(),
        ParameterKind::Primitive => values,
    };
    (!values.is_empty()).then_some(values)
}

/// Loose truthiness of a caller value: null, false, 0 and "" are empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_with_outputs(files: Vec<FileOutputSpec>) -> AlgorithmSpec {
        AlgorithmSpec {
            id: "algo".to_string(),
            version: None,
            entry: EntryCommand {
                path: "run.sh".to_string(),
                is_local_file: true,
            },
            files: vec![],
            parameters: vec![Parameter::file("in", 0).with_flag("-i")],
            output: OutputSpec {
                files,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_output_dir_parameter_is_synthesized_for_file_outputs() {
        let spec = spec_with_outputs(vec![FileOutputSpec {
            alias_group: "images".to_string(),
            match_pattern: r"\.png$".to_string(),
            encoding: None,
            format: None,
        }])
        .normalized();

        let out = spec.parameter(OUTPUT_DIR_PARAM).unwrap();
        assert_eq!(out.position, 1);
        assert!(out.options.is_static);
        assert!(out.options.required);
    }

    #[test]
    fn test_output_dir_parameter_is_dropped_without_file_outputs() {
        let mut spec = spec_with_outputs(vec![]);
        spec.parameters.push(Parameter::output_dir(1));
        let spec = spec.normalized();
        assert!(spec.parameter(OUTPUT_DIR_PARAM).is_none());
    }

    #[test]
    fn test_check_rejects_alias_collision_with_stdout() {
        let spec = spec_with_outputs(vec![FileOutputSpec {
            alias_group: "stdout".to_string(),
            match_pattern: ".*".to_string(),
            encoding: None,
            format: None,
        }]);
        assert!(spec.check().is_err());
    }

    #[test]
    fn test_file_arg_variants() {
        assert_eq!(
            FileArg::from_value(&json!("data/in.txt")).unwrap(),
            FileArg::PathRef("data/in.txt".to_string())
        );
        assert_eq!(
            FileArg::from_value(&json!({"fileRef": {"name": "a.csv", "size": 12}})).unwrap(),
            FileArg::Upload(UploadRef {
                name: "a.csv".to_string(),
                size: 12
            })
        );
        match FileArg::from_value(&json!({"rawData": "a,b", "extention": "csv"})).unwrap() {
            FileArg::Inline(inline) => {
                assert_eq!(inline.payload, InlinePayload::Raw("a,b".to_string()));
                assert_eq!(inline.extension, "csv");
                assert_eq!(inline.encoding, "utf8");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(FileArg::from_value(&json!({"extention": "csv"})).is_err());
        assert!(FileArg::from_value(&json!({"rawData": 5})).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("0")));
    }
}
