//! Execution sandbox for registered third-party algorithms.
//!
//! This crate turns a declarative algorithm description plus client supplied
//! argument values into a concrete process invocation, runs it either as a
//! local subprocess or inside a disposable container worker, and streams the
//! captured outputs back as a single JSON document.
//!
//! # Architecture Overview
//!
//! - **Argument compilation**: parameter schema + caller values become an argv,
//!   a path mapping table and a set of materialized input files
//! - **Process runner**: local spawn with wall-clock timeout and process-tree kill
//! - **Container pool**: one-shot workers booted, awaited, dispatched and retired
//! - **Wire protocol**: multipart job request out, zip archive response in
//! - **Output assembly**: incremental JSON rendering with optional format conversion

pub mod catalog;
pub mod compiler;
pub mod config;
pub mod converters;
pub mod encoding;
pub mod errors;
pub mod invoke;
pub mod model;
pub mod output;
pub mod preflight;
pub mod process;
pub mod sandbox;
pub mod wire;

pub use catalog::{AlgorithmRepository, CatalogEntry, FileCatalog};
pub use compiler::{ArgumentCompiler, CompileContext};
pub use config::{ConfigLoader, RunboxConfig};
pub use converters::ConverterRegistry;
pub use errors::{InvokeError, RunError, SandboxError, ValidationErrors};
pub use invoke::{Invocation, Invoker};
pub use model::*;
pub use output::OutputAssembler;
pub use process::ProcessRunner;
pub use sandbox::{ContainerRuntime, DockerRuntime, Sandbox};
