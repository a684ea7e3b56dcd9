//! HTTP handlers for file write, read and diagnostics.
//! Request bodies are streamed into the segmenter; storage concerns are
//! delegated to `StorageService`.

use crate::{
    errors::AppError,
    models::file::File,
    services::{read_path::IntegrityReport, storage_service::StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::StreamReader;
use uuid::Uuid;

/// Query params accepted by `PUT /write`.
#[derive(Debug, Deserialize)]
pub struct WriteQuery {
    pub name: Option<String>,
}

/// `PUT /write?name=<name>`: store the request body as a new file.
pub async fn write_file(
    State(service): State<StorageService>,
    Query(q): Query<WriteQuery>,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let name = q
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::bad_request("missing 'name' query parameter"))?;

    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    let result = service.write_stream(&name, reader).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// `GET /read/{file_id}`: reassembled file content.
pub async fn read_file(
    State(service): State<StorageService>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let file_id = parse_file_id(&file_id)?;
    let (file, content) = service.read(file_id).await?;

    let mut response = Response::new(Body::from(content));
    *response.status_mut() = StatusCode::OK;
    set_content_headers(response.headers_mut(), &file);
    Ok(response)
}

/// `GET /files/{file_id}`: file metadata as JSON.
pub async fn describe_file(
    State(service): State<StorageService>,
    Path(file_id): Path<String>,
) -> Result<Json<File>, AppError> {
    let file_id = parse_file_id(&file_id)?;
    Ok(Json(service.describe(file_id).await?))
}

/// `GET /files/{file_id}/verify`: per-segment integrity report.
pub async fn verify_file(
    State(service): State<StorageService>,
    Path(file_id): Path<String>,
) -> Result<Json<IntegrityReport>, AppError> {
    let file_id = parse_file_id(&file_id)?;
    Ok(Json(service.verify_file(file_id).await?))
}

/// An id that is not a UUID cannot name a stored file.
fn parse_file_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("file `{}` not found", raw)))
}

fn set_content_headers(headers: &mut HeaderMap, file: &File) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file.size.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    match HeaderValue::from_str(&content_disposition(&file.name)) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Err(e) => tracing::warn!("dropping Content-Disposition for {}: {}", file.id, e),
    }
}

/// `attachment; filename="..."`, plus an RFC 5987 `filename*` when the name
/// is not plain ASCII.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect();
    let quoted = fallback.replace('\\', "\\\\").replace('"', "\\\"");

    if fallback == name {
        format!("attachment; filename=\"{}\"", quoted)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            quoted,
            urlencoding::encode(name)
        )
    }
}
