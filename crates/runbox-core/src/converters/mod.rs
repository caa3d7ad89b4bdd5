//! Format converter registry
//!
//! Converters are the narrow seam between the sandbox and the world of file
//! formats. Input converters render a caller supplied JSON value into the text
//! of a file of the declared extension; output converters turn the text of a
//! produced file back into JSON. The registry is populated once at startup
//! from a static list of implementations selected by name in configuration.

mod csv;
mod xml;

pub use self::csv::CsvConverter;
pub use self::xml::XmlConverter;

use crate::errors::ConvertError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Renders JSON into the text of a file format.
pub trait InputConverter: Send + Sync {
    fn format(&self) -> &str;
    fn to_file(&self, data: &Value) -> Result<String, ConvertError>;
}

/// Parses the text of a file format into JSON.
pub trait OutputConverter: Send + Sync {
    fn format(&self) -> &str;
    fn to_json(&self, text: &str) -> Result<Value, ConvertError>;
}

#[derive(Clone, Default)]
pub struct ConverterRegistry {
    inputs: HashMap<String, Arc<dyn InputConverter>>,
    outputs: HashMap<String, Arc<dyn OutputConverter>>,
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut inputs: Vec<&String> = self.inputs.keys().collect();
        let mut outputs: Vec<&String> = self.outputs.keys().collect();
        inputs.sort();
        outputs.sort();
        f.debug_struct("ConverterRegistry")
            .field("inputs", &inputs)
            .field("outputs", &outputs)
            .finish()
    }
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in converter.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_input(Arc::new(JsonConverter));
        registry.register_output(Arc::new(JsonConverter));
        registry.register_input(Arc::new(RrConverter));
        registry.register_input(Arc::new(CsvConverter));
        registry.register_output(Arc::new(CsvConverter));
        registry.register_input(Arc::new(XmlConverter));
        registry.register_output(Arc::new(XmlConverter));
        registry
    }

    /// Registry restricted to the named built-ins.
    pub fn from_names(names: &[String]) -> Result<Self, ConvertError> {
        let mut registry = Self::new();
        for name in names {
            match name.as_str() {
                "json" => {
                    registry.register_input(Arc::new(JsonConverter));
                    registry.register_output(Arc::new(JsonConverter));
                }
                "rr" => registry.register_input(Arc::new(RrConverter)),
                "csv" => {
                    registry.register_input(Arc::new(CsvConverter));
                    registry.register_output(Arc::new(CsvConverter));
                }
                "xml" => {
                    registry.register_input(Arc::new(XmlConverter));
                    registry.register_output(Arc::new(XmlConverter));
                }
                other => return Err(ConvertError::Unsupported(other.to_string())),
            }
        }
        Ok(registry)
    }

    pub fn register_input(&mut self, converter: Arc<dyn InputConverter>) {
        self.inputs.insert(converter.format().to_string(), converter);
    }

    pub fn register_output(&mut self, converter: Arc<dyn OutputConverter>) {
        self.outputs.insert(converter.format().to_string(), converter);
    }

    /// Whether JSON can be rendered into `format`.
    pub fn is_parsable(&self, format: &str) -> bool {
        self.inputs.contains_key(format)
    }

    /// Renders `data` as the text of a `format` file.
    pub fn parse(&self, format: &str, data: &Value) -> Result<String, ConvertError> {
        let converter = self
            .inputs
            .get(format)
            .ok_or_else(|| ConvertError::Unsupported(format.to_string()))?;
        converter.to_file(data)
    }

    /// Whether `format` files can be read back as JSON.
    pub fn is_readable(&self, format: &str) -> bool {
        self.outputs.contains_key(format)
    }

    pub fn read(&self, format: &str, text: &str) -> Result<Value, ConvertError> {
        let converter = self
            .outputs
            .get(format)
            .ok_or_else(|| ConvertError::Unsupported(format.to_string()))?;
        converter.to_json(text)
    }
}

pub struct JsonConverter;

impl InputConverter for JsonConverter {
    fn format(&self) -> &str {
        "json"
    }

    fn to_file(&self, data: &Value) -> Result<String, ConvertError> {
        serde_json::to_string(data).map_err(|e| ConvertError::failed("json", e.to_string()))
    }
}

impl OutputConverter for JsonConverter {
    fn format(&self) -> &str {
        "json"
    }

    fn to_json(&self, text: &str) -> Result<Value, ConvertError> {
        serde_json::from_str(text).map_err(|e| ConvertError::failed("json", e.to_string()))
    }
}

/// RR interval series: a JSON array of numbers, one per line.
pub struct RrConverter;

impl InputConverter for RrConverter {
    fn format(&self) -> &str {
        "rr"
    }

    fn to_file(&self, data: &Value) -> Result<String, ConvertError> {
        let intervals = data
            .as_array()
            .ok_or_else(|| ConvertError::failed("rr", "expected an array of intervals"))?;

        let mut lines = Vec::with_capacity(intervals.len());
        for (i, interval) in intervals.iter().enumerate() {
            let rendered = match interval {
                Value::Number(n) => n.to_string(),
                Value::String(s) if s.trim().parse::<f64>().is_ok() => s.trim().to_string(),
                _ => {
                    return Err(ConvertError::failed(
                        "rr",
                        format!("invalid element at position {}", i),
                    ))
                }
            };
            lines.push(rendered);
        }
        Ok(lines.join("\n"))
    }
}
