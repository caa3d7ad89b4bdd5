//! Invocation orchestration
//!
//! One invocation owns one temporary directory holding its materialized
//! inputs, its captured streams and its output files. The directory lives
//! exactly as long as the [`Invocation`] (or the response stream built from
//! it), so every exit path removes it.

use crate::compiler::{ArgumentCompiler, CompileContext, FILES_DIR};
use crate::converters::ConverterRegistry;
use crate::errors::InvokeError;
use crate::model::{
    AlgorithmSpec, CompiledCall, InvocationRequest, OutputSelection, OutputSpec, ProcessOutput,
    UploadedFile,
};
use crate::output::OutputAssembler;
use crate::process::{ProcessRunner, STDERR_FILE, STDOUT_FILE};
use crate::sandbox::{JobPayload, Sandbox};
use crate::wire;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const RESULT_ARCHIVE: &str = "result.zip";

#[derive(Debug, Clone)]
pub struct Invoker {
    compiler: ArgumentCompiler,
    converters: Arc<ConverterRegistry>,
    sandbox: Option<Sandbox>,
    temp_root: PathBuf,
}

/// A finished run whose outputs are still on disk.
#[derive(Debug)]
pub struct Invocation {
    temp_dir: TempDir,
    output: ProcessOutput,
    output_spec: OutputSpec,
    selection: OutputSelection,
    assembler: OutputAssembler,
}

impl Invocation {
    pub fn exit_code(&self) -> Option<i32> {
        self.output.exit_code
    }

    pub fn output(&self) -> &ProcessOutput {
        &self.output
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The response document. The temporary directory is removed once the
    /// stream is dropped, whether or not it was read to the end.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        let Invocation {
            temp_dir,
            output,
            output_spec,
            selection,
            assembler,
        } = self;
        let inner = assembler.assemble(selection, output, output_spec);
        async_stream::stream! {
            let _temp_dir = temp_dir;
            futures_util::pin_mut!(inner);
            while let Some(chunk) = inner.next().await {
                yield chunk;
            }
        }
    }
}

impl Invoker {
    pub fn new(
        converters: Arc<ConverterRegistry>,
        sandbox: Option<Sandbox>,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            compiler: ArgumentCompiler::new(converters.clone()),
            converters,
            sandbox,
            temp_root: temp_root.into(),
        }
    }

    pub async fn invoke(
        &self,
        spec: &AlgorithmSpec,
        app_dir: &Path,
        request: InvocationRequest,
        uploads: &[UploadedFile],
    ) -> Result<Invocation, InvokeError> {
        tokio::fs::create_dir_all(&self.temp_root).await?;
        let temp_dir = tempfile::Builder::new()
            .prefix("invocation-")
            .tempdir_in(&self.temp_root)?;

        let ctx = CompileContext {
            app_dir,
            invocation_dir: temp_dir.path(),
        };
        let call = self
            .compiler
            .compile(spec, &request.arguments, uploads, ctx)
            .await?;

        let output = if request.secure {
            self.run_remote(&call, app_dir, &request, temp_dir.path())
                .await?
        } else {
            self.run_local(&call, &request, temp_dir.path()).await?
        };

        log::info!(
            "Invocation of '{}' finished ({})",
            spec.id,
            match output.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "timed out".to_string(),
            }
        );

        Ok(Invocation {
            temp_dir,
            output,
            output_spec: spec.output.clone(),
            selection: request.output_selection,
            assembler: OutputAssembler::new(self.converters.clone(), request.output_format),
        })
    }

    async fn run_local(
        &self,
        call: &CompiledCall,
        request: &InvocationRequest,
        dir: &Path,
    ) -> Result<ProcessOutput, InvokeError> {
        let outcome = ProcessRunner::run(
            &call.command,
            &call.argv,
            call.working_dir.as_deref(),
            request.timeout,
            dir,
        )
        .await?;

        Ok(ProcessOutput {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            files_dir: call.output_dir.clone(),
        })
    }

    async fn run_remote(
        &self,
        call: &CompiledCall,
        app_dir: &Path,
        request: &InvocationRequest,
        dir: &Path,
    ) -> Result<ProcessOutput, InvokeError> {
        let sandbox = self.sandbox.as_ref().ok_or_else(|| {
            InvokeError::RunFailure("Secure invocations are not available: the sandbox is disabled".to_string())
        })?;

        let app_path = app_dir.to_path_buf();
        let app_archive = tokio::task::spawn_blocking(move || wire::pack_app_dir(&app_path))
            .await
            .map_err(|e| InvokeError::RunFailure(format!("packing application failed: {}", e)))??;

        let payload = JobPayload {
            command: call.command.clone(),
            args: call.argv.clone(),
            mapping: call.path_mapping.clone(),
            cwd: call.working_dir.as_ref().map(|_| wire::RUN_DIR.to_string()),
            app_archive: Some(app_archive),
            files: call.materialized_files.clone(),
        };

        let archive = dir.join(RESULT_ARCHIVE);
        let sink = tokio::fs::File::create(&archive).await?;
        let exit_code = sandbox
            .run(request.timeout, payload, Box::new(sink))
            .await?;

        let (zip_path, dest) = (archive.clone(), dir.to_path_buf());
        let unpacked = tokio::task::spawn_blocking(move || wire::unpack_results(&zip_path, &dest))
            .await
            .map_err(|e| InvokeError::RunFailure(format!("unpacking results failed: {}", e)))?;
        match unpacked {
            Ok(()) => {}
            Err(e) if exit_code.is_none() => {
                log::warn!("Partial result archive after timeout: {}", e);
            }
            Err(e) => {
                return Err(InvokeError::RunFailure(format!(
                    "Worker returned an unreadable result archive: {}",
                    e
                )))
            }
        }
        let _ = tokio::fs::remove_file(&archive).await;

        let error_dir = dir.to_path_buf();
        if let Some(message) = tokio::task::spawn_blocking(move || wire::read_error(&error_dir))
            .await
            .map_err(|e| InvokeError::RunFailure(e.to_string()))??
        {
            return Err(InvokeError::RunFailure(message));
        }

        let files_dir = dir.join(FILES_DIR);
        tokio::fs::create_dir_all(&files_dir).await?;
        Ok(ProcessOutput {
            exit_code,
            stdout: dir.join(STDOUT_FILE),
            stderr: dir.join(STDERR_FILE),
            files_dir,
        })
    }
}
