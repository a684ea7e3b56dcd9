//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and blob store

use crate::services::storage_service::{StorageResult, StorageService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Always returns 200 OK. Performs no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Pings the metadata store and probes the blob store with a
/// write/read/delete round trip. HTTP 200 when both pass, 503 otherwise.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let (metadata, blob_store) = tokio::join!(service.metadata.ping(), service.blobs.probe());

    let mut checks = HashMap::new();
    checks.insert("metadata", CheckStatus::from_result(metadata));
    checks.insert("blob_store", CheckStatus::from_result(blob_store));

    let overall_ok = checks.values().all(|c| c.ok);
    if !overall_ok {
        tracing::warn!("readiness check failed");
    }

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result(result: StorageResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(e) => Self {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}
