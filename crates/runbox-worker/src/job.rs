//! The single job endpoint of a worker.
//!
//! Every failure after the request was read is reported inside the result
//! archive's `error` entry with an empty `exit-code` header, so the host
//! always receives an archive it can unpack.

use anyhow::{anyhow, Context, Result};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use runbox_core::process::ProcessRunner;
use runbox_core::wire;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const INPUTS_DIR: &str = "inputs";

#[derive(Debug, Clone)]
pub struct WorkerState {
    /// The algorithm's files are unpacked under `<root>/run`.
    pub root: PathBuf,
    pub max_runtime: Duration,
}

#[derive(Debug, Default)]
struct ReceivedJob {
    command: String,
    args: Vec<String>,
    mapping: BTreeMap<String, i64>,
    cwd: String,
    inputs: HashMap<String, PathBuf>,
}

pub async fn job_handler(State(state): State<Arc<WorkerState>>, multipart: Multipart) -> Response {
    let job_dir = match tempfile::Builder::new()
        .prefix("job-")
        .tempdir_in(&state.root)
    {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("Failed to create job directory: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let exit_code = match run_job(&state, multipart, job_dir.path()).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            log::error!("Job failed: {:#}", e);
            if let Err(write_err) =
                tokio::fs::write(job_dir.path().join(wire::ERROR_FILE), format!("{:#}", e)).await
            {
                log::error!("Failed to record job error: {}", write_err);
            }
            None
        }
    };

    match pack(job_dir).await {
        Ok(archive) => (
            [
                (wire::EXIT_CODE_HEADER, exit_code.map(|c| c.to_string()).unwrap_or_default()),
                ("content-type", "application/zip".to_string()),
            ],
            archive,
        )
            .into_response(),
        Err(e) => {
            log::error!("Failed to pack job results: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn pack(job_dir: TempDir) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || wire::pack_results(job_dir.path()))
        .await
        .context("result packing task panicked")?
        .context("failed to pack results")
}

async fn run_job(state: &WorkerState, multipart: Multipart, job_dir: &Path) -> Result<Option<i32>> {
    let job = receive(state, multipart, job_dir).await?;
    if job.command.is_empty() {
        return Err(anyhow!("job request carried no command"));
    }

    let output_dir = job_dir.join(wire::RESULT_FILES_DIR);
    tokio::fs::create_dir_all(&output_dir).await?;

    let run_dir = state.root.join(wire::RUN_DIR);
    let (command, args) = wire::rewrite_args(
        &job.command,
        job.args,
        &job.mapping,
        &run_dir,
        &job.inputs,
        &output_dir,
    );
    let cwd = (!job.cwd.is_empty()).then(|| state.root.join(&job.cwd));

    log::info!("Running {} {:?}", command, args);
    let outcome =
        ProcessRunner::run(&command, &args, cwd.as_deref(), state.max_runtime, job_dir).await?;
    Ok(outcome.exit_code)
}

/// Reads the multipart job request, unpacking the app and storing inputs
/// as they arrive.
async fn receive(state: &WorkerState, mut multipart: Multipart, job_dir: &Path) -> Result<ReceivedJob> {
    let inputs_dir = job_dir.join(INPUTS_DIR);
    tokio::fs::create_dir_all(&inputs_dir).await?;
    let mut job = ReceivedJob::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            wire::FIELD_COMMAND => job.command = field.text().await?,
            wire::FIELD_ARGS => {
                job.args = serde_json::from_str(&field.text().await?).context("malformed args")?
            }
            wire::FIELD_MAPPING => {
                job.mapping =
                    serde_json::from_str(&field.text().await?).context("malformed mapping")?
            }
            wire::FIELD_CWD => job.cwd = field.text().await?,
            wire::FIELD_APP => {
                let archive = field.bytes().await?;
                let root = state.root.clone();
                tokio::task::spawn_blocking(move || wire::unpack_app(&archive, &root))
                    .await
                    .context("app unpacking task panicked")?
                    .context("failed to unpack application archive")?;
            }
            wire::FIELD_FILES => {
                let file_name = field
                    .file_name()
                    .and_then(|n| Path::new(n).file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("input file part without a file name"))?;
                let path = inputs_dir.join(&file_name);
                tokio::fs::write(&path, field.bytes().await?).await?;
                job.inputs.insert(file_name, path);
            }
            other => log::debug!("Ignoring unknown field '{}'", other),
        }
    }
    Ok(job)
}
