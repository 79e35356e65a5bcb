use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lesion_service::model::Classifier;
use lesion_service::records::StorageRecordStore;
use lesion_service::routes::{create_router, AppState};
use lesion_service::storage::create_storage;
use lesion_service::utils::{ensure_model_file, LogFormat, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("failed to load configuration")?;

    init_tracing(&settings);

    let storage = create_storage(settings.storage.clone())
        .await
        .context("failed to initialise storage")?;

    ensure_model_file(&settings, storage.as_ref())
        .await
        .context("failed to provision model")?;
    let classifier = load_classifier(&settings)?;

    let records = Arc::new(StorageRecordStore::new(storage.clone()));
    let state = AppState::new(classifier, storage, records, settings.max_upload_bytes);
    let app = create_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.port)
        .parse()
        .with_context(|| format!("invalid listen address for port {}", settings.port))?;
    tracing::info!(%addr, max_upload_bytes = settings.max_upload_bytes, "Listening");

    axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind to {}", addr))?
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

#[cfg(feature = "tensorflow")]
fn load_classifier(settings: &Settings) -> anyhow::Result<Arc<dyn Classifier>> {
    let model = lesion_service::model::Model::new(
        &settings.model_path,
        &settings.model_input_op,
        &settings.model_output_op,
    )
    .with_context(|| format!("failed to load model from {}", settings.model_path))?;
    tracing::info!(path = %settings.model_path, "Model loaded");
    Ok(Arc::new(model))
}

#[cfg(not(feature = "tensorflow"))]
fn load_classifier(_settings: &Settings) -> anyhow::Result<Arc<dyn Classifier>> {
    anyhow::bail!("built without the `tensorflow` feature; no inference runtime available")
}

fn init_tracing(settings: &Settings) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match settings.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
