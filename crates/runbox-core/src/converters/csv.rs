//! CSV files: the first row holds column names, every following row becomes
//! one JSON object keyed by them. Rendered files use `;` as delimiter.

use super::{InputConverter, OutputConverter};
use crate::errors::ConvertError;
use ::csv::{ReaderBuilder, Terminator, WriterBuilder};
use serde_json::{Map, Value};

const FORMAT: &str = "csv";
const DELIMITER: u8 = b';';

pub struct CsvConverter;

impl InputConverter for CsvConverter {
    fn format(&self) -> &str {
        FORMAT
    }

    /// Accepts an array of objects (columns in order of first appearance)
    /// or an array of arrays (written as-is).
    fn to_file(&self, data: &Value) -> Result<String, ConvertError> {
        let rows = data
            .as_array()
            .ok_or_else(|| ConvertError::failed(FORMAT, "expected an array of rows"))?;

        let records: Vec<Vec<String>> = if rows.iter().all(Value::is_object) {
            let mut columns: Vec<&str> = Vec::new();
            for row in rows.iter().filter_map(Value::as_object) {
                for key in row.keys() {
                    if !columns.contains(&key.as_str()) {
                        columns.push(key);
                    }
                }
            }
            let header: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
            let body = rows.iter().filter_map(Value::as_object).map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(*c).map(cell).unwrap_or_default())
                    .collect::<Vec<String>>()
            });
            std::iter::once(header).chain(body).collect()
        } else {
            rows.iter()
                .enumerate()
                .map(|(i, row)| match row {
                    Value::Array(cells) => Ok(cells.iter().map(cell).collect::<Vec<String>>()),
                    _ => Err(ConvertError::failed(
                        FORMAT,
                        format!("row {} is neither an object nor an array", i),
                    )),
                })
                .collect::<Result<_, _>>()?
        };

        let mut writer = WriterBuilder::new()
            .delimiter(DELIMITER)
            .terminator(Terminator::CRLF)
            .flexible(true)
            .from_writer(Vec::new());
        for record in &records {
            writer
                .write_record(record)
                .map_err(|e| ConvertError::failed(FORMAT, e.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ConvertError::failed(FORMAT, e.to_string()))?;
        let text =
            String::from_utf8(bytes).map_err(|e| ConvertError::failed(FORMAT, e.to_string()))?;
        Ok(text.trim_end_matches("\r\n").to_string())
    }
}

impl OutputConverter for CsvConverter {
    fn format(&self) -> &str {
        FORMAT
    }

    /// Comma-separated with a header row. Cells stay strings.
    fn to_json(&self, text: &str) -> Result<Value, ConvertError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| ConvertError::failed(FORMAT, e.to_string()))?
            .clone();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ConvertError::failed(FORMAT, e.to_string()))?;
            let row: Map<String, Value> = headers
                .iter()
                .zip(record.iter())
                .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
                .collect();
            rows.push(Value::Object(row));
        }
        Ok(Value::Array(rows))
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
