mod common;

use common::{eventually, MockOptions, MockRuntime, WorkerBehavior};
use runbox_core::model::{
    AlgorithmSpec, EntryCommand, FileOutputSpec, InvocationRequest, OutputFormat,
    OutputSelection, OutputSpec, Parameter, COMMAND_MAPPING_INDEX, OUTPUT_DIR_PARAM,
};
use runbox_core::output::TIMEOUT_WARNING;
use runbox_core::{ConverterRegistry, InvokeError, Invoker, Sandbox};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn spec() -> AlgorithmSpec {
    AlgorithmSpec {
        id: "csv-stats".to_string(),
        version: Some("1".to_string()),
        entry: EntryCommand {
            path: "run.sh".to_string(),
            is_local_file: true,
        },
        files: vec!["run.sh".to_string()],
        parameters: vec![Parameter::file("in", 0).with_flag("-i")],
        output: OutputSpec {
            files: vec![FileOutputSpec {
                alias_group: "results".to_string(),
                match_pattern: r"\.txt$".to_string(),
                encoding: None,
                format: None,
            }],
            ..Default::default()
        },
    }
    .normalized()
}

fn request(data: &str) -> InvocationRequest {
    InvocationRequest {
        algorithm_ref: "csv-stats".to_string(),
        arguments: json!({"in": {"rawData": data, "extention": "csv"}})
            .as_object()
            .cloned()
            .unwrap(),
        secure: true,
        timeout: Duration::from_secs(10),
        output_selection: OutputSelection::default(),
        output_format: OutputFormat::Raw,
    }
}

async fn invoke(invoker: Invoker, app_dir: &Path, data: &str) -> Value {
    let invocation = invoker
        .invoke(&spec(), app_dir, request(data), &[])
        .await
        .unwrap();
    let chunks: Vec<_> = invocation
        .into_stream()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    serde_json::from_slice(&chunks.concat()).unwrap()
}

#[tokio::test]
async fn test_second_secure_invocation_waits_for_a_fresh_worker() {
    let runtime = MockRuntime::new(MockOptions {
        gate_jobs: true,
        ..Default::default()
    });
    let sandbox = Sandbox::new(runtime.clone(), 1).unwrap();
    sandbox.initialize();

    let app = tempfile::TempDir::new().unwrap();
    std::fs::write(app.path().join("run.sh"), "#!/bin/sh\ncat \"$2\"\n").unwrap();
    let temp_root = tempfile::TempDir::new().unwrap();
    let invoker = Invoker::new(
        Arc::new(ConverterRegistry::with_builtins()),
        Some(sandbox.clone()),
        temp_root.path(),
    );

    let first_worker = runtime.next_started().await;
    sandbox.register_ready(&first_worker).await;
    eventually("first worker available", || async {
        sandbox.pool().stats().await.available == 1
    })
    .await;

    let app_dir = app.path().to_path_buf();
    let first = tokio::spawn({
        let (invoker, app_dir) = (invoker.clone(), app_dir.clone());
        async move { invoke(invoker, &app_dir, "a,b\n1,2").await }
    });
    eventually("first job at worker", || async { runtime.received().len() == 1 }).await;

    let second = tokio::spawn({
        let (invoker, app_dir) = (invoker.clone(), app_dir.clone());
        async move { invoke(invoker, &app_dir, "c,d\n3,4").await }
    });
    eventually("second job queued", || async {
        sandbox.pool().stats().await.waiting_jobs == 1
    })
    .await;

    let replacement = runtime.next_started().await;
    runtime.release_job();
    let first_doc = first.await.unwrap();
    assert_eq!(sandbox.pool().stats().await.waiting_jobs, 1);

    sandbox.register_ready(&replacement).await;
    eventually("second job at worker", || async { runtime.received().len() == 2 }).await;
    runtime.release_job();
    let second_doc = second.await.unwrap();

    for doc in [&first_doc, &second_doc] {
        assert_eq!(doc["exit_code"], json!(0));
        assert_eq!(doc["stderr"], json!(""));
        assert_eq!(doc["results"], json!([{"out.txt": "done"}]));
        assert!(doc["stdout"].as_str().unwrap().starts_with("-i "));
    }
    assert!(sandbox.pool().booted_total() >= 2);

    let received = runtime.received();
    let job = &received[0];
    assert!(job.has_app);
    assert_eq!(job.cwd, "run");
    assert_eq!(job.mapping.get("run.sh"), Some(&COMMAND_MAPPING_INDEX));
    assert_eq!(job.mapping.get(OUTPUT_DIR_PARAM), Some(&2));
    assert_eq!(job.files.len(), 1);
    assert!(job.files[0].ends_with(".csv"));
    assert_eq!(job.mapping.get(&job.files[0]), Some(&1));
    assert_ne!(received[0].files, received[1].files);

    // Both invocation directories are gone once their responses were read.
    assert_eq!(std::fs::read_dir(temp_root.path()).unwrap().count(), 0);

    sandbox.shutdown().await;
}

/// A one-worker sandbox whose worker already announced itself.
async fn ready_sandbox(runtime: &Arc<MockRuntime>) -> Sandbox {
    let sandbox = Sandbox::new(runtime.clone(), 1).unwrap();
    sandbox.initialize();
    let worker = runtime.next_started().await;
    sandbox.register_ready(&worker).await;
    eventually("worker available", || async {
        sandbox.pool().stats().await.available == 1
    })
    .await;
    sandbox
}

#[tokio::test]
async fn test_worker_error_status_is_a_run_failure() {
    let runtime = MockRuntime::new(MockOptions {
        behavior: WorkerBehavior::Fail,
        ..Default::default()
    });
    let sandbox = ready_sandbox(&runtime).await;

    let app = tempfile::TempDir::new().unwrap();
    std::fs::write(app.path().join("run.sh"), "#!/bin/sh\n").unwrap();
    let temp_root = tempfile::TempDir::new().unwrap();
    let invoker = Invoker::new(
        Arc::new(ConverterRegistry::with_builtins()),
        Some(sandbox.clone()),
        temp_root.path(),
    );

    let err = invoker
        .invoke(&spec(), app.path(), request("a,b"), &[])
        .await
        .unwrap_err();
    match &err {
        InvokeError::RunFailure(message) => assert!(message.contains("500"), "{}", message),
        other => panic!("expected a run failure, got {:?}", other),
    }
    assert_eq!(err.status_code(), 500);
    assert_eq!(std::fs::read_dir(temp_root.path()).unwrap().count(), 0);

    // The failed worker is gone and its replacement serves the next call.
    eventually("failed worker retired", || async { runtime.removed().len() == 1 }).await;
    runtime.set_behavior(WorkerBehavior::Complete);
    let replacement = runtime.next_started().await;
    sandbox.register_ready(&replacement).await;

    let doc = invoke(invoker, app.path(), "c,d").await;
    assert_eq!(doc["exit_code"], json!(0));
    assert_eq!(doc["results"], json!([{"out.txt": "done"}]));

    sandbox.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_worker_yields_warning_and_tolerates_partial_archive() {
    let runtime = MockRuntime::new(MockOptions {
        behavior: WorkerBehavior::Stall,
        ..Default::default()
    });
    let sandbox = ready_sandbox(&runtime).await;

    let app = tempfile::TempDir::new().unwrap();
    std::fs::write(app.path().join("run.sh"), "#!/bin/sh\n").unwrap();
    let temp_root = tempfile::TempDir::new().unwrap();
    let invoker = Invoker::new(
        Arc::new(ConverterRegistry::with_builtins()),
        Some(sandbox.clone()),
        temp_root.path(),
    );

    let mut call = request("a,b");
    call.timeout = Duration::from_millis(300);
    let invocation = tokio::time::timeout(
        Duration::from_secs(5),
        invoker.invoke(&spec(), app.path(), call, &[]),
    )
    .await
    .expect("invocation did not finish after its timeout")
    .unwrap();
    assert_eq!(invocation.exit_code(), None);

    let chunks: Vec<_> = invocation
        .into_stream()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    let doc: Value = serde_json::from_slice(&chunks.concat()).unwrap();
    assert_eq!(
        doc,
        json!({
            "stdout": "",
            "stderr": "",
            "results": [],
            "warning": TIMEOUT_WARNING
        })
    );
    assert_eq!(std::fs::read_dir(temp_root.path()).unwrap().count(), 0);
    eventually("timed out worker retired", || async { runtime.removed().len() == 1 }).await;

    sandbox.shutdown().await;
}
