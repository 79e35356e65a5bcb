use std::{env, path::Path};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};

use crate::storage::{StorageBackend, StorageConfig};
use crate::{Error, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Everything the service reads from its environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub port: u16,
    pub max_upload_bytes: usize,
    pub model_path: String,
    pub model_url: Option<String>,
    pub model_blob_key: Option<String>,
    pub model_input_op: String,
    pub model_output_op: String,
    pub github_token: Option<String>,
    pub storage: StorageConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = match var("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                Error::config("PORT must be a valid number between 0 and 65535")
            })?,
            None => DEFAULT_PORT,
        };

        let max_upload_bytes = match var("MAX_UPLOAD_BYTES") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::config("MAX_UPLOAD_BYTES must be a positive integer"))?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        let storage = match var("STORAGE_BACKEND").as_deref().unwrap_or("local") {
            "local" => StorageConfig::Local {
                root_path: var("STORAGE_ROOT").unwrap_or_else(|| "./data".into()),
            },
            "memory" => StorageConfig::Memory,
            "s3" => StorageConfig::S3 {
                bucket: var("S3_BUCKET")
                    .ok_or_else(|| Error::config("S3_BUCKET is required for the s3 backend"))?,
                region: var("S3_REGION")
                    .ok_or_else(|| Error::config("S3_REGION is required for the s3 backend"))?,
                endpoint: var("S3_ENDPOINT"),
            },
            other => {
                return Err(Error::config(format!(
                    "STORAGE_BACKEND must be one of local, s3, memory (got '{}')",
                    other
                )))
            }
        };

        let log_format = match var("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::config(format!(
                    "LOG_FORMAT must be 'text' or 'json' (got '{}')",
                    other
                )))
            }
        };

        Ok(Settings {
            port,
            max_upload_bytes,
            model_path: var("MODEL_PATH").unwrap_or_else(|| "./model/frozen_graph.pb".into()),
            model_url: var("MODEL_URL"),
            model_blob_key: var("MODEL_BLOB_KEY"),
            model_input_op: var("MODEL_INPUT_OP").unwrap_or_else(|| "x".into()),
            model_output_op: var("MODEL_OUTPUT_OP").unwrap_or_else(|| "Identity".into()),
            github_token: var("GITHUB_TOKEN"),
            storage,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_format,
        })
    }
}

async fn download_file(url: &str, path: &Path, token: Option<&str>) -> Result<()> {
    tracing::info!(%url, path = %path.display(), "Downloading model");

    let mut header_map = HeaderMap::new();
    if let Some(token) = token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| Error::config("GITHUB_TOKEN contains invalid header characters"))?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));
    header_map.insert(
        HeaderName::from_static("user-agent"),
        HeaderValue::from_static(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))),
    );

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(|e| Error::storage(format!("failed to request {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(Error::storage(format!(
            "failed to download {}: {}",
            url,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::storage(format!("failed to read body of {}: {}", url, e)))?;
    write_model(path, &bytes).await
}

async fn write_model(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Make sure the model file is on local disk, fetching it once if needed.
///
/// Sources, in order: the existing file, `model_url`, then `model_blob_key` in the
/// blob store.
pub async fn ensure_model_file(settings: &Settings, blobs: &dyn StorageBackend) -> Result<()> {
    let path = Path::new(&settings.model_path);
    tracing::info!(path = %path.display(), "Checking model");

    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }

    if let Some(url) = &settings.model_url {
        return download_file(url, path, settings.github_token.as_deref()).await;
    }

    if let Some(key) = &settings.model_blob_key {
        tracing::info!(%key, "Fetching model from blob store");
        let bytes = blobs.get(key).await?;
        return write_model(path, &bytes).await;
    }

    Err(Error::config(format!(
        "model not found at {} and neither MODEL_URL nor MODEL_BLOB_KEY is set",
        settings.model_path
    )))
}
