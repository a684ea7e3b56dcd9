//! Defines routes for the segmented file store.
//!
//! ## Structure
//! - **Health**
//!   - `GET /healthz`: liveness
//!   - `GET /readyz`:  readiness (metadata store + blob store)
//!
//! - **Files**
//!   - `PUT /write?name=<name>`:        stream the body in as a new file
//!   - `GET /read/{file_id}`:           reassembled, verified content
//!   - `GET /files/{file_id}`:          file metadata
//!   - `GET /files/{file_id}/verify`:   per-segment integrity report

use crate::{
    handlers::{
        file_handlers::{describe_file, read_file, verify_file, write_file},
        health_handlers::{healthz, readyz},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Build the router. Handlers share `StorageService` as state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // uploads are streamed, so the default 2 MiB body cap does not apply
        .route("/write", put(write_file).layer(DefaultBodyLimit::disable()))
        .route("/read/{file_id}", get(read_file))
        .route("/files/{file_id}", get(describe_file))
        .route("/files/{file_id}/verify", get(verify_file))
}
