use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::config::{AppConfig, PipelineConfig};
use crate::db::{
    self,
    queries::PgStore,
    repository::{DocumentStore, SupplierDirectory, TaskQueue, UsageRecorder},
};
use crate::services::{
    encryption::EncryptionService,
    llm::{LlmClient, WorkersAiLlm},
    ocr::{OcrEngine, WorkersAiOcr},
    pdf::{PageRenderer, PdftoppmRenderer},
    storage::{ObjectStore, S3ObjectStore},
};

/// Shared handles used by the HTTP routes and the worker loop.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<dyn TaskQueue>,
    pub documents: Arc<dyn DocumentStore>,
    pub suppliers: Arc<dyn SupplierDirectory>,
    pub usage: Arc<dyn UsageRecorder>,
    pub storage: Arc<dyn ObjectStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub renderer: Arc<dyn PageRenderer>,
    pub llm: Arc<dyn LlmClient>,
    /// Present when uploads are stored encrypted.
    pub encryption: Option<Arc<EncryptionService>>,
    pub pipeline: PipelineConfig,
}

/// Service handles for [`AppState::new`].
pub struct Services {
    pub storage: Arc<dyn ObjectStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub renderer: Arc<dyn PageRenderer>,
    pub llm: Arc<dyn LlmClient>,
    pub encryption: Option<EncryptionService>,
}

impl AppState {
    /// `store` backs all four storage seams, as both `PgStore` and
    /// `MemoryStore` do.
    pub fn new<S>(store: Arc<S>, services: Services, pipeline: PipelineConfig) -> Self
    where
        S: TaskQueue + DocumentStore + SupplierDirectory + UsageRecorder + 'static,
    {
        Self {
            tasks: store.clone(),
            documents: store.clone(),
            suppliers: store.clone(),
            usage: store,
            storage: services.storage,
            ocr: services.ocr,
            renderer: services.renderer,
            llm: services.llm,
            encryption: services.encryption.map(Arc::new),
            pipeline,
        }
    }
}

/// State of the `/metrics` route.
pub type MetricsState = Arc<PrometheusHandle>;

impl AppState {
    /// Connect to PostgreSQL and the providers named in `config`.
    ///
    /// Runs pending migrations when `migrate` is set.
    pub async fn connect(
        config: &AppConfig,
        pipeline: PipelineConfig,
        migrate: bool,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!("Connecting to PostgreSQL database");
        let pool = db::init_pool(&config.database_url).await?;
        if migrate {
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
        }

        tracing::info!("Initializing object storage client");
        let storage = S3ObjectStore::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_access_key,
            &config.s3_secret_key,
        )?;

        tracing::info!(ocr_model = %config.ocr_model, llm_model = %config.llm_model, "Initializing Workers AI clients");
        let ocr = WorkersAiOcr::new(&config.cf_account_id, &config.cf_api_token, &config.ocr_model)?;
        let llm = WorkersAiLlm::new(&config.cf_account_id, &config.cf_api_token, &config.llm_model)?;

        let encryption = match config.encryption_key.as_deref() {
            Some(key) => {
                tracing::info!("Stored documents are decrypted with AES-256-GCM");
                Some(EncryptionService::new(key)?)
            }
            None => None,
        };

        let services = Services {
            storage: Arc::new(storage),
            ocr: Arc::new(ocr),
            renderer: Arc::new(PdftoppmRenderer),
            llm: Arc::new(llm),
            encryption,
        };
        Ok(Self::new(Arc::new(PgStore::new(pool)), services, pipeline))
    }
}
