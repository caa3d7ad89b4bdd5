//! HTTP routes of the runbox host
//!
//! - `POST /algorithms/{id}/invoke`: multipart call (`call` JSON plus files)
//! - `POST /register`: readiness announcement from a sandbox worker
//! - `GET /health`

use axum::body::Body;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use runbox_core::preflight::{self, RawInvocation};
use runbox_core::{AlgorithmRepository, Invoker, Sandbox, UploadedFile, ValidationErrors};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn AlgorithmRepository>,
    pub invoker: Invoker,
    pub sandbox: Option<Sandbox>,
    /// Uploaded files are staged here until an invocation relocates them.
    pub incoming_dir: PathBuf,
    pub default_timeout: Duration,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub address: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/algorithms/{id}/invoke", post(invoke_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let sandbox = match &state.sandbox {
        Some(sandbox) => {
            let stats = sandbox.pool().stats().await;
            Some(json!({
                "available": stats.available,
                "booting": stats.booting,
                "waiting_jobs": stats.waiting_jobs,
                "booted_total": sandbox.pool().booted_total(),
            }))
        }
        None => None,
    };
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sandbox,
    })
}

async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    let Some(sandbox) = &state.sandbox else {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "Sandbox is disabled on this host" })),
        ));
    };
    let address = request.address.trim();
    if address.is_empty() {
        return Err(validation_error("address", "`address` must not be empty."));
    }
    log::info!("Worker announced itself at {}", address);
    sandbox.register_ready(address).await;
    Ok(Json(json!({ "status": "ok" })))
}

async fn invoke_handler(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    tokio::fs::create_dir_all(&state.incoming_dir)
        .await
        .map_err(internal_error)?;
    // Whatever an invocation does not relocate is removed with this directory.
    let staging = tempfile::Builder::new()
        .prefix("upload-")
        .tempdir_in(&state.incoming_dir)
        .map_err(internal_error)?;

    let (raw, uploads) = read_call(multipart, &staging).await?;

    let Some(entry) = state.catalog.find(&id).await else {
        let (_, body) = validation_error("algorithm", "Requested application was not found.");
        return Err((StatusCode::NOT_FOUND, body));
    };

    let request = preflight::prepare(&id, raw, &entry.spec, &uploads, state.default_timeout)
        .map_err(|errors| (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))))?;

    log::info!(
        "Invoking '{}' ({})",
        id,
        if request.secure { "sandboxed" } else { "local" }
    );
    match state
        .invoker
        .invoke(&entry.spec, &entry.app_dir, request, &uploads)
        .await
    {
        Ok(invocation) => Ok((
            [(header::CONTENT_TYPE, "application/json")],
            Body::from_stream(invocation.into_stream()),
        )
            .into_response()),
        Err(e) => {
            log::warn!("Invocation of '{}' failed: {}", id, e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Err((status, Json(e.to_body())))
        }
    }
}

/// Splits the multipart body into the `call` document and the stored files.
async fn read_call(
    mut multipart: Multipart,
    staging: &TempDir,
) -> Result<(RawInvocation, Vec<UploadedFile>), ApiError> {
    let mut raw = RawInvocation::default();
    let mut uploads = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| validation_error("body", &e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(original_name) = field.file_name().map(str::to_string) {
            let stored_name = uuid::Uuid::new_v4().simple().to_string();
            let path = staging.path().join(&stored_name);
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(internal_error)?;
            let mut size = 0u64;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| validation_error(&name, &e.to_string()))?
            {
                size += chunk.len() as u64;
                file.write_all(&chunk).await.map_err(internal_error)?;
            }
            file.flush().await.map_err(internal_error)?;
            uploads.push(UploadedFile {
                original_name,
                stored_name,
                path,
                size,
            });
        } else if name == "call" {
            let text = field
                .text()
                .await
                .map_err(|e| validation_error("call", &e.to_string()))?;
            raw = serde_json::from_str(&text)
                .map_err(|e| validation_error("call", &format!("Malformed call: {}", e)))?;
        }
    }
    Ok((raw, uploads))
}

fn validation_error(field: &str, message: &str) -> ApiError {
    let mut errors = ValidationErrors::new();
    errors.add(field, message, None);
    (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors })))
}

fn internal_error(e: std::io::Error) -> ApiError {
    log::error!("I/O error while handling request: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "fatal_error": e.to_string() })),
    )
}

/// Removes staging directories left behind by a previous run.
pub async fn clean_incoming(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use runbox_core::model::{AlgorithmSpec, EntryCommand, OutputSpec, Parameter};
    use runbox_core::{ConverterRegistry, FileCatalog};
    use tower::ServiceExt;

    const BOUNDARY: &str = "runbox-test-boundary";

    struct Fixture {
        _root: TempDir,
        router: Router,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let mut catalog = FileCatalog::default();
        catalog
            .insert(
                AlgorithmSpec {
                    id: "echo".to_string(),
                    version: None,
                    entry: EntryCommand {
                        path: "echo".to_string(),
                        is_local_file: false,
                    },
                    files: vec![],
                    parameters: vec![
                        Parameter::primitive("word", 0).required(),
                        Parameter::file("in", 1),
                    ],
                    output: OutputSpec::default(),
                },
                &root.path().join("uploads"),
            )
            .unwrap();

        let state = AppState {
            catalog: Arc::new(catalog),
            invoker: Invoker::new(
                Arc::new(ConverterRegistry::with_builtins()),
                None,
                root.path().join("temp"),
            ),
            sandbox: None,
            incoming_dir: root.path().join("uploads").join(".incoming"),
            default_timeout: Duration::from_secs(10),
        };
        Fixture {
            router: build_router(state),
            _root: root,
        }
    }

    fn multipart(call: &str, files: &[(&str, &str)]) -> Body {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"call\"\r\n\r\n{call}\r\n",
            b = BOUNDARY
        );
        for (name, content) in files {
            body.push_str(&format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: text/plain\r\n\r\n{content}\r\n",
                b = BOUNDARY
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        Body::from(body)
    }

    fn invoke_request(id: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/algorithms/{}/invoke", id))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(body)
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_streams_output_document() {
        let fixture = fixture();
        let call = r#"{"args": {"word": "hello", "in": {"fileRef": {"name": "a.txt", "size": 3}}}}"#;
        let response = fixture
            .router
            .oneshot(invoke_request("echo", multipart(call, &[("a.txt", "abc")])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let doc = json_body(response).await;
        assert_eq!(doc["exit_code"], json!(0));
        let stdout = doc["stdout"].as_str().unwrap();
        assert!(stdout.starts_with("hello "));
        assert!(stdout.trim_end().ends_with(".txt"));
    }

    #[tokio::test]
    async fn test_invoke_unknown_algorithm_is_not_found() {
        let fixture = fixture();
        let response = fixture
            .router
            .oneshot(invoke_request("nope", multipart("{}", &[])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invoke_validation_errors_are_reported() {
        let fixture = fixture();
        let call = r#"{"args": {"bogus": 1}, "options": {"timeout": "x"}}"#;
        let response = fixture
            .router
            .oneshot(invoke_request("echo", multipart(call, &[])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let doc = json_body(response).await;
        assert_eq!(doc["errors"]["options.timeout"]["value"], json!("x"));
    }

    #[tokio::test]
    async fn test_malformed_call_is_rejected() {
        let fixture = fixture();
        let response = fixture
            .router
            .oneshot(invoke_request("echo", multipart("{not json", &[])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let doc = json_body(response).await;
        assert!(doc["errors"]["call"]["messages"][0]
            .as_str()
            .unwrap()
            .starts_with("Malformed call"));
    }

    #[tokio::test]
    async fn test_register_without_sandbox_conflicts() {
        let fixture = fixture();
        let response = fixture
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"address": "172.17.0.3:3000"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_health() {
        let fixture = fixture();
        let response = fixture
            .router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = json_body(response).await;
        assert_eq!(doc["status"], json!("healthy"));
        assert!(doc.get("sandbox").is_none());
    }
}
