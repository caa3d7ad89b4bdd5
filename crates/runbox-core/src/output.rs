//! Output assembly
//!
//! Streams a single JSON document built from the captured stdout, stderr and
//! output files of a run:
//!
//! ```text
//! {"<stdout alias>": ..., "<stderr alias>": ..., "<file alias>": [{"<name>": ...}], "exit_code": N}
//! ```
//!
//! A run killed on timeout gets a `"warning"` member instead of `"exit_code"`.

use crate::converters::ConverterRegistry;
use crate::encoding::TextEncoding;
use crate::model::{OutputFormat, OutputSelection, OutputSpec, ProcessOutput};
use bytes::Bytes;
use futures_util::Stream;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TIMEOUT_WARNING: &str =
    "Process allowed execution time has expired. The process was killed.";

/// Files found in the output directory, grouped by the first alias whose
/// pattern matched them.
#[derive(Debug, Clone, PartialEq)]
pub struct FileGroup {
    pub alias: String,
    pub encoding: Option<String>,
    pub format: Option<String>,
    pub files: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct OutputAssembler {
    converters: Arc<ConverterRegistry>,
    format: OutputFormat,
}

impl OutputAssembler {
    pub fn new(converters: Arc<ConverterRegistry>, format: OutputFormat) -> Self {
        Self { converters, format }
    }

    /// Scans `dir` once and assigns every plain file to the first group whose
    /// pattern matches its name. Unmatched files are dropped.
    pub async fn collect_files(spec: &OutputSpec, dir: &Path) -> std::io::Result<Vec<FileGroup>> {
        let mut groups = Vec::with_capacity(spec.files.len());
        let mut patterns = Vec::with_capacity(spec.files.len());
        for file_spec in &spec.files {
            let pattern = Regex::new(&file_spec.match_pattern)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            patterns.push(pattern);
            groups.push(FileGroup {
                alias: file_spec.alias_group.clone(),
                encoding: file_spec.encoding.clone(),
                format: file_spec.format.clone(),
                files: Vec::new(),
            });
        }

        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        for name in names {
            if let Some(idx) = patterns.iter().position(|p| p.is_match(&name)) {
                groups[idx].files.push(dir.join(&name));
            }
        }
        Ok(groups)
    }

    /// Renders the response document chunk by chunk.
    pub fn assemble(
        self,
        selection: OutputSelection,
        output: ProcessOutput,
        spec: OutputSpec,
    ) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        async_stream::try_stream! {
            let groups = if selection.files {
                Self::collect_files(&spec, &output.files_dir).await?
            } else {
                Vec::new()
            };

            yield Bytes::from_static(b"{");
            let mut first = true;

            if selection.stdout {
                yield member_key(&spec.stdout.alias, &mut first);
                let rendered = self
                    .render_file(&output.stdout, None, spec.stdout.format.as_deref(), true)
                    .await?;
                yield Bytes::from(rendered);
            }

            if selection.stderr {
                yield member_key(&spec.stderr.alias, &mut first);
                let rendered = self.render_file(&output.stderr, None, None, true).await?;
                yield Bytes::from(rendered);
            }

            for group in &groups {
                yield member_key(&group.alias, &mut first);
                yield Bytes::from_static(b"[");
                for (i, path) in group.files.iter().enumerate() {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let mut chunk = String::new();
                    if i > 0 {
                        chunk.push(',');
                    }
                    chunk.push('{');
                    chunk.push_str(&json_string(&name));
                    chunk.push(':');
                    yield Bytes::from(chunk);

                    let rendered = self
                        .render_file(path, group.encoding.as_deref(), group.format.as_deref(), false)
                        .await?;
                    yield Bytes::from(rendered);
                    yield Bytes::from_static(b"}");
                }
                yield Bytes::from_static(b"]");
            }

            let tail = match output.exit_code {
                Some(code) => format!("\"exit_code\":{}", code),
                None => format!("\"warning\":{}", json_string(TIMEOUT_WARNING)),
            };
            let separator = if first { "" } else { "," };
            yield Bytes::from(format!("{}{}}}", separator, tail));
        }
    }

    /// JSON text for one captured file. Captured streams that were never
    /// written render as an empty string.
    async fn render_file(
        &self,
        path: &Path,
        encoding: Option<&str>,
        format: Option<&str>,
        missing_is_empty: bool,
    ) -> std::io::Result<String> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if missing_is_empty && e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let text = TextEncoding::from_name(encoding).decode(&bytes);

        if self.format == OutputFormat::Parsed {
            if let Some(format) = format.filter(|f| self.converters.is_readable(f)) {
                match self.converters.read(format, &text) {
                    Ok(value) => return Ok(value.to_string()),
                    Err(e) => log::warn!(
                        "Falling back to raw output for {}: {}",
                        path.display(),
                        e
                    ),
                }
            }
        }
        Ok(json_string(&text))
    }
}

fn member_key(alias: &str, first: &mut bool) -> Bytes {
    let separator = if *first { "" } else { "," };
    *first = false;
    Bytes::from(format!("{}{}:", separator, json_string(alias)))
}

fn json_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}
