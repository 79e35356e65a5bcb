//! HTTP surface: `/predict`, `/predict/histories` and `/health`

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use image::ImageFormat;
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::model::{Classifier, Verdict};
use crate::records::{PredictionRecord, RecordStore};
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Multipart name of the uploaded file.
pub const IMAGE_FIELD: &str = "image";

const ALLOWED_EXTENSIONS: [&str; 3] = ["jpeg", "jpg", "png"];
const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/jpg", "image/png"];

// Room for boundaries and part headers on top of the image itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const PREDICT_SUCCESS: &str = "Model is predicted successfully";
const PREDICT_FAILED: &str = "An error occurred while making the prediction";
const HISTORY_FAILED: &str = "Failed to fetch prediction histories";
const MISSING_IMAGE: &str = "Image is required";
const WRONG_TYPE: &str = "File must be an image (jpeg/jpg/png)";

#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn Classifier>,
    pub blobs: Arc<dyn StorageBackend>,
    pub records: Arc<dyn RecordStore>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        blobs: Arc<dyn StorageBackend>,
        records: Arc<dyn RecordStore>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            classifier,
            blobs,
            records,
            max_upload_bytes,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/predict", post(predict_handler))
        .route("/predict/histories", get(histories_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    id: String,
    history: PredictionRecord,
}

fn success<T: Serialize>(message: Option<&'static str>, data: T) -> Response {
    let body = Envelope {
        status: "success",
        message,
        data: Some(data),
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn fail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "fail", "message": message }))).into_response()
}

/// Client errors keep their own message; everything else is logged and hidden
/// behind `generic`.
fn failure(err: Error, generic: &str) -> Response {
    if err.is_client_error() {
        tracing::debug!(error = %err, "Rejected request");
        fail(StatusCode::BAD_REQUEST, &err.to_string())
    } else {
        tracing::error!(error = %err, "Request failed");
        fail(StatusCode::INTERNAL_SERVER_ERROR, generic)
    }
}

/// A validated image, not yet stored anywhere.
#[derive(Debug)]
struct Upload {
    file_name: String,
    content_type: &'static str,
    data: Bytes,
}

async fn predict_handler(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            tracing::debug!(%rejection, "Request is not a multipart upload");
            return fail(StatusCode::BAD_REQUEST, MISSING_IMAGE);
        }
    };

    let result = async {
        let upload = read_upload(multipart, state.max_upload_bytes).await?;
        predict(&state, upload).await
    }
    .await;

    match result {
        Ok(record) => success(Some(PREDICT_SUCCESS), record),
        Err(err) => failure(err, PREDICT_FAILED),
    }
}

async fn read_upload(mut multipart: Multipart, max_bytes: usize) -> Result<Upload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::invalid_upload(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_owned);
        let declared_type = field.content_type().map(str::to_owned);

        let mut data = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| Error::invalid_upload(format!("Failed to read image: {}", e)))?
        {
            if data.len() + chunk.len() > max_bytes {
                return Err(Error::invalid_upload(format!(
                    "Image must not be larger than {} bytes",
                    max_bytes
                )));
            }
            data.extend_from_slice(&chunk);
        }

        if data.is_empty() {
            return Err(Error::invalid_upload(MISSING_IMAGE));
        }

        let content_type =
            check_image_type(file_name.as_deref(), declared_type.as_deref(), &data)?;

        return Ok(Upload {
            file_name: sanitize_file_name(file_name.as_deref(), content_type),
            content_type,
            data: Bytes::from(data),
        });
    }

    Err(Error::invalid_upload(MISSING_IMAGE))
}

/// Accept only JPEG and PNG, judged by the file extension (or the declared
/// content type when there is no extension) and then by the bytes themselves.
/// Returns the content type to store the blob under.
fn check_image_type(
    file_name: Option<&str>,
    declared_type: Option<&str>,
    data: &[u8],
) -> Result<&'static str> {
    let extension = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let declared_ok = match extension {
        Some(ext) => ALLOWED_EXTENSIONS.contains(&ext.as_str()),
        None => declared_type
            .map(|ct| ct.to_ascii_lowercase())
            .is_some_and(|ct| ALLOWED_CONTENT_TYPES.contains(&ct.as_str())),
    };
    if !declared_ok {
        return Err(Error::invalid_upload(WRONG_TYPE));
    }

    match image::guess_format(data) {
        Ok(ImageFormat::Jpeg) => Ok("image/jpeg"),
        Ok(ImageFormat::Png) => Ok("image/png"),
        _ => Err(Error::invalid_upload(WRONG_TYPE)),
    }
}

/// Last path component with anything outside `[A-Za-z0-9._-]` replaced.
fn sanitize_file_name(file_name: Option<&str>, content_type: &str) -> String {
    let base = file_name
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .unwrap_or("")
        .trim_start_matches('.');

    if base.is_empty() {
        let ext = if content_type == "image/png" { "png" } else { "jpg" };
        return format!("image.{}", ext);
    }

    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn predict(state: &AppState, upload: Upload) -> Result<PredictionRecord> {
    let id = Uuid::new_v4().to_string();
    let key = format!("uploads/{}_{}", id, upload.file_name);

    state
        .blobs
        .put(&key, upload.data.clone(), upload.content_type)
        .await?;
    tracing::debug!(%id, %key, bytes = upload.data.len(), "Stored upload");

    let classifier = state.classifier.clone();
    let data = upload.data;
    let score = tokio::task::spawn_blocking(move || classifier.score(&data))
        .await
        .map_err(|e| Error::internal(format!("inference task failed: {}", e)))??;

    let verdict = Verdict::from_score(score);
    let record = PredictionRecord::new(id, verdict);
    state.records.insert(&record).await?;

    tracing::info!(id = %record.id, score, result = ?verdict, "Prediction stored");
    Ok(record)
}

async fn histories_handler(State(state): State<AppState>) -> Response {
    match state.records.list().await {
        Ok(records) => {
            let entries: Vec<HistoryEntry> = records
                .into_iter()
                .map(|record| HistoryEntry {
                    id: record.id.clone(),
                    history: record,
                })
                .collect();
            success(None, entries)
        }
        Err(err) => failure(err, HISTORY_FAILED),
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    #[test]
    fn accepts_matching_extension_and_bytes() {
        assert_eq!(
            check_image_type(Some("lesion.PNG"), None, PNG_MAGIC).unwrap(),
            "image/png"
        );
        assert_eq!(
            check_image_type(Some("lesion.jpeg"), Some("image/jpeg"), JPEG_MAGIC).unwrap(),
            "image/jpeg"
        );
    }

    #[test]
    fn falls_back_to_content_type_without_extension() {
        assert!(check_image_type(Some("blob"), Some("image/png"), PNG_MAGIC).is_ok());
        assert!(check_image_type(None, Some("text/plain"), PNG_MAGIC).is_err());
        assert!(check_image_type(None, None, PNG_MAGIC).is_err());
    }

    #[test]
    fn rejects_wrong_extension_or_bytes() {
        let err = check_image_type(Some("notes.txt"), Some("text/plain"), b"hello").unwrap_err();
        assert!(err.is_client_error());
        assert!(check_image_type(Some("fake.jpg"), Some("image/jpeg"), b"hello").is_err());
        assert!(check_image_type(Some("anim.gif"), Some("image/gif"), b"GIF89a").is_err());
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(sanitize_file_name(Some("scan 01.jpg"), "image/jpeg"), "scan_01.jpg");
        assert_eq!(
            sanitize_file_name(Some("../../etc/passwd.png"), "image/png"),
            "passwd.png"
        );
        assert_eq!(
            sanitize_file_name(Some("C:\\photos\\mole.png"), "image/png"),
            "mole.png"
        );
        assert_eq!(sanitize_file_name(None, "image/png"), "image.png");
        assert_eq!(sanitize_file_name(Some(""), "image/jpeg"), "image.jpg");
    }
}
