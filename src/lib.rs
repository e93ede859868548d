//! Convert Worker Library
//!
//! This library provides the core of the file conversion pipeline: clients
//! submit a file and a target format, workers convert it in the background,
//! and the result is kept in storage until the retention window expires.
//!
//! ## Module Overview
//!
//! - `format`: File formats, conversion pairs and MIME types
//! - `registry`: The fixed table of supported conversions
//! - `converter`: Office, image-to-PDF and PDF-to-image converters
//! - `job`: Job lifecycle state machine
//! - `artifact`: Normalizes converter output into one downloadable artifact
//! - `queue`: Broker and result store (Redis, or in-memory for development)
//! - `dispatcher`: Records and enqueues new jobs
//! - `worker`: Queue consumers with retries and time limits
//! - `storage`: Local and object-store backends
//! - `sweeper`: Retention sweeps
//! - `service`: Submit, status and retrieve
//! - `api`: HTTP shim (axum)
//! - `config`: Environment configuration
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use convert_worker::{
//!     artifact::ArtifactResolver,
//!     config::ToolConfig,
//!     queue::MemoryQueue,
//!     registry::Registry,
//!     service::ConversionService,
//!     storage::LocalStorage,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Arc::new(MemoryQueue::new(Duration::from_secs(3600)));
//!     let service = ConversionService::new(
//!         Arc::new(Registry::new(&ToolConfig::default())),
//!         queue.clone(),
//!         queue,
//!         Arc::new(LocalStorage::new("storage")),
//!         ArtifactResolver::new("storage"),
//!         10 * 1024 * 1024,
//!     );
//!
//!     let submitted = service
//!         .submit("scan.png", "png", "pdf", &std::fs::read("scan.png").unwrap())
//!         .await
//!         .unwrap();
//!     println!("{:?}", service.status(&submitted.job_id).await.unwrap());
//! }
//! ```

pub mod api;
pub mod artifact;
pub mod config;
pub mod converter;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod job;
pub mod queue;
pub mod registry;
pub mod service;
pub mod storage;
pub mod sweeper;
pub mod telemetry;
pub mod worker;
