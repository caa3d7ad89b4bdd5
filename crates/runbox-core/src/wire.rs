//! Host to worker protocol
//!
//! A job travels as one multipart POST: `command`, `args` (JSON array),
//! `mapping` (JSON object), `cwd`, an `app` tar part with the algorithm's
//! installed files and any number of `files` parts with materialized inputs.
//! The worker answers with a zip archive of `stdout`, `stderr`, `error` and
//! `files/`, plus the exit code in the `exit-code` header.

use crate::model::{COMMAND_MAPPING_INDEX, OUTPUT_DIR_PARAM};
use crate::process::{STDERR_FILE, STDOUT_FILE};
use crate::sandbox::JobPayload;
use reqwest::multipart::{Form, Part};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const FIELD_COMMAND: &str = "command";
pub const FIELD_ARGS: &str = "args";
pub const FIELD_MAPPING: &str = "mapping";
pub const FIELD_CWD: &str = "cwd";
pub const FIELD_APP: &str = "app";
pub const FIELD_FILES: &str = "files";

pub const EXIT_CODE_HEADER: &str = "exit-code";

/// Entry in the result archive carrying a worker-side failure message.
pub const ERROR_FILE: &str = "error";
/// Directory the algorithm's files are unpacked into on the worker.
pub const RUN_DIR: &str = "run";
pub const RESULT_FILES_DIR: &str = "files";

pub async fn build_form(payload: &JobPayload) -> io::Result<Form> {
    let mut form = Form::new()
        .text(FIELD_COMMAND, payload.command.clone())
        .text(FIELD_ARGS, serde_json::to_string(&payload.args)?)
        .text(FIELD_MAPPING, serde_json::to_string(&payload.mapping)?)
        .text(FIELD_CWD, payload.cwd.clone().unwrap_or_default());

    if let Some(app) = &payload.app_archive {
        form = form.part(
            FIELD_APP,
            Part::bytes(app.clone())
                .file_name("app.tar")
                .mime_str("application/x-tar")
                .map_err(io::Error::other)?,
        );
    }

    for path in &payload.files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("input path {} has no file name", path.display()),
                )
            })?;
        let bytes = tokio::fs::read(path).await?;
        form = form.part(FIELD_FILES, Part::bytes(bytes).file_name(name));
    }
    Ok(form)
}

/// Tars the algorithm's installed files under `run/`. A missing directory
/// yields an empty archive.
pub fn pack_app_dir(app_dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);
    if app_dir.is_dir() {
        builder.append_dir_all(RUN_DIR, app_dir)?;
    }
    builder.into_inner()
}

pub fn unpack_app(archive: &[u8], root: &Path) -> io::Result<()> {
    std::fs::create_dir_all(root.join(RUN_DIR))?;
    tar::Archive::new(Cursor::new(archive)).unpack(root)
}

/// Zips the captured streams, the error file and the output directory of a
/// worker job directory.
pub fn pack_results(job_dir: &Path) -> io::Result<Vec<u8>> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for name in [STDOUT_FILE, STDERR_FILE, ERROR_FILE] {
        let path = job_dir.join(name);
        if path.is_file() {
            zip.start_file(name, options).map_err(io::Error::other)?;
            zip.write_all(&std::fs::read(&path)?)?;
        }
    }

    zip.add_directory(format!("{}/", RESULT_FILES_DIR), options)
        .map_err(io::Error::other)?;
    let files_dir = job_dir.join(RESULT_FILES_DIR);
    if files_dir.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(&files_dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = format!(
                "{}/{}",
                RESULT_FILES_DIR,
                entry.file_name().to_string_lossy()
            );
            zip.start_file(name, options).map_err(io::Error::other)?;
            zip.write_all(&std::fs::read(entry.path())?)?;
        }
    }

    Ok(zip.finish().map_err(io::Error::other)?.into_inner())
}

pub fn unpack_results(zip_path: &Path, dest: &Path) -> io::Result<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(io::Error::other)?;
    archive.extract(dest).map_err(io::Error::other)
}

/// Reads the error entry a worker left in an unpacked result directory.
pub fn read_error(dir: &Path) -> io::Result<Option<String>> {
    let mut file = match std::fs::File::open(dir.join(ERROR_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    let text = text.trim().to_string();
    Ok((!text.is_empty()).then_some(text))
}

/// Rewrites a received command line to worker-local paths using the path
/// mapping. Returns the command and argv to spawn.
///
/// A mapped index names the host path a file occupies; every argv slot
/// holding that same host path is rewritten, since one file may be passed
/// more than once.
pub fn rewrite_args(
    command: &str,
    mut args: Vec<String>,
    mapping: &BTreeMap<String, i64>,
    run_dir: &Path,
    inputs: &HashMap<String, PathBuf>,
    output_dir: &Path,
) -> (String, Vec<String>) {
    let mut command = command.to_string();
    let mut local_paths: HashMap<String, String> = HashMap::new();

    for (name, &index) in mapping {
        if index == COMMAND_MAPPING_INDEX {
            command = run_dir.join(name).to_string_lossy().into_owned();
            continue;
        }
        let Some(host_path) = usize::try_from(index).ok().and_then(|i| args.get(i)) else {
            log::warn!("Ignoring mapping '{}' to out-of-range index {}", name, index);
            continue;
        };
        let local = if name == OUTPUT_DIR_PARAM {
            Some(output_dir)
        } else {
            inputs.get(name).map(PathBuf::as_path)
        };
        if let Some(local) = local {
            local_paths.insert(host_path.clone(), local.to_string_lossy().into_owned());
        }
    }

    for arg in args.iter_mut() {
        if let Some(local) = local_paths.get(arg.as_str()) {
            *arg = local.clone();
        }
    }
    (command, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rewrite_args_maps_inputs_output_and_command() {
        let mut mapping = BTreeMap::new();
        mapping.insert("run.sh".to_string(), COMMAND_MAPPING_INDEX);
        mapping.insert("abc.csv".to_string(), 1);
        mapping.insert(OUTPUT_DIR_PARAM.to_string(), 2);
        mapping.insert("lost.txt".to_string(), 9);

        let mut inputs = HashMap::new();
        inputs.insert("abc.csv".to_string(), PathBuf::from("/job/in/abc.csv"));

        let (command, args) = rewrite_args(
            "/host/app/run.sh",
            vec![
                "-i".to_string(),
                "/host/tmp/abc.csv".to_string(),
                "/host/tmp/files".to_string(),
            ],
            &mapping,
            Path::new("/usr/src/app/run"),
            &inputs,
            Path::new("/job/files"),
        );

        assert_eq!(command, "/usr/src/app/run/run.sh");
        assert_eq!(args, vec!["-i", "/job/in/abc.csv", "/job/files"]);
    }

    #[test]
    fn test_rewrite_args_rewrites_every_slot_of_a_repeated_file() {
        let mut mapping = BTreeMap::new();
        mapping.insert("4f2a.txt".to_string(), 3);

        let mut inputs = HashMap::new();
        inputs.insert("4f2a.txt".to_string(), PathBuf::from("/job/inputs/4f2a.txt"));

        let (_, args) = rewrite_args(
            "cat",
            vec![
                "-a".to_string(),
                "/host/tmp/4f2a.txt".to_string(),
                "-b".to_string(),
                "/host/tmp/4f2a.txt".to_string(),
            ],
            &mapping,
            Path::new("/usr/src/app/run"),
            &inputs,
            Path::new("/job/files"),
        );

        assert_eq!(
            args,
            vec!["-a", "/job/inputs/4f2a.txt", "-b", "/job/inputs/4f2a.txt"]
        );
    }

    #[test]
    fn test_app_archive_unpacks_under_run_dir() {
        let app = TempDir::new().unwrap();
        std::fs::create_dir(app.path().join("lib")).unwrap();
        std::fs::write(app.path().join("main.sh"), "echo hi").unwrap();
        std::fs::write(app.path().join("lib").join("util.sh"), "true").unwrap();

        let archive = pack_app_dir(app.path()).unwrap();
        let root = TempDir::new().unwrap();
        unpack_app(&archive, root.path()).unwrap();

        let run = root.path().join(RUN_DIR);
        assert_eq!(std::fs::read_to_string(run.join("main.sh")).unwrap(), "echo hi");
        assert!(run.join("lib").join("util.sh").is_file());
    }

    #[test]
    fn test_missing_app_dir_packs_empty_archive() {
        let archive = pack_app_dir(Path::new("/definitely/not/here")).unwrap();
        let root = TempDir::new().unwrap();
        unpack_app(&archive, root.path()).unwrap();
        assert!(root.path().join(RUN_DIR).is_dir());
    }

    #[test]
    fn test_result_archive_carries_streams_error_and_files() {
        let job = TempDir::new().unwrap();
        std::fs::write(job.path().join(STDOUT_FILE), "out").unwrap();
        std::fs::write(job.path().join(ERROR_FILE), "spawn failed\n").unwrap();
        std::fs::create_dir(job.path().join(RESULT_FILES_DIR)).unwrap();
        std::fs::write(job.path().join(RESULT_FILES_DIR).join("r.txt"), "42").unwrap();

        let bytes = pack_results(job.path()).unwrap();
        let host = TempDir::new().unwrap();
        let zip_path = host.path().join("result.zip");
        std::fs::write(&zip_path, bytes).unwrap();
        unpack_results(&zip_path, host.path()).unwrap();

        assert_eq!(std::fs::read_to_string(host.path().join(STDOUT_FILE)).unwrap(), "out");
        assert!(!host.path().join(STDERR_FILE).exists());
        assert_eq!(
            std::fs::read_to_string(host.path().join(RESULT_FILES_DIR).join("r.txt")).unwrap(),
            "42"
        );
        assert_eq!(read_error(host.path()).unwrap().as_deref(), Some("spawn failed"));
    }

    #[test]
    fn test_blank_error_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_error(dir.path()).unwrap(), None);
        std::fs::write(dir.path().join(ERROR_FILE), "  \n").unwrap();
        assert_eq!(read_error(dir.path()).unwrap(), None);
    }
}
