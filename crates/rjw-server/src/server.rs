use std::future::Future;
use std::sync::Arc;

use rjw_assets::{AssetStore, FsAssetStore};
use rjw_pipeline::{DocumentPipeline, GuestDirectory, InMemoryGuestDirectory, Renderer};
use rjw_records::{DocumentRecordStore, JournalConfig, JournalRecordStore};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::AppState;
use crate::router::build_router;

/// Document service: the pipeline behind the HTTP API plus the background
/// reconciler.
pub struct RjwServer {
    config: ServerConfig,
    state: AppState,
}

impl RjwServer {
    /// Serve an already assembled pipeline.
    pub fn new(config: ServerConfig, pipeline: DocumentPipeline, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            config,
            state: AppState::new(pipeline, renderer),
        }
    }

    /// Open the filesystem asset store, replay the record journal and load
    /// the guest list named by `config`.
    pub async fn open(config: ServerConfig) -> ServerResult<Self> {
        let storage = &config.storage;
        let assets: Arc<dyn AssetStore> = Arc::new(FsAssetStore::open(&storage.assets_root).await?);
        let records: Arc<dyn DocumentRecordStore> = Arc::new(JournalRecordStore::open(
            &storage.journal_path,
            JournalConfig {
                sync_mode: storage.journal_sync,
            },
            Arc::clone(&assets),
        )?);
        let guests: Arc<dyn GuestDirectory> = match &storage.guests_path {
            Some(path) => Arc::new(InMemoryGuestDirectory::load_json(path).await?),
            None => {
                tracing::warn!("no guest list configured, every generation will be not found");
                Arc::new(InMemoryGuestDirectory::new())
            }
        };
        let pipeline =
            DocumentPipeline::new(assets, records, guests).with_config(config.pipeline.clone());
        let renderer: Arc<dyn Renderer> = Arc::new(config.documents.clone());
        Ok(Self::new(config, pipeline, renderer))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &DocumentPipeline {
        &self.state.pipeline
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone(), self.config.frontend_url.as_deref())
    }

    /// Serve until ctrl-c.
    pub async fn serve(self) -> ServerResult<()> {
        self.serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Serve until `signal` resolves, then stop the reconciler.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!("rjw server listening on {}", self.config.bind_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = self.state.pipeline.reconciler();
        let reconcile_task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()));

        let _ = shutdown_tx.send(true);
        if let Err(e) = reconcile_task.await {
            tracing::warn!(error = %e, "reconciler task ended abnormally");
        }
        tracing::info!("rjw server stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.storage.assets_root = dir.join("assets");
        config.storage.journal_path = dir.join("records.journal");
        config
    }

    #[tokio::test]
    async fn open_creates_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let server = RjwServer::open(config(tmp.path())).await.unwrap();
        assert!(tmp.path().join("assets").is_dir());
        assert!(tmp.path().join("records.journal").exists());
        let _router = server.router();
    }

    #[tokio::test]
    async fn open_fails_on_missing_guest_list() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.storage.guests_path = Some(tmp.path().join("missing.json"));
        assert!(matches!(
            RjwServer::open(config).await,
            Err(ServerError::Guests(_))
        ));
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.storage.guests_path = Some(
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/guests.json"),
        );
        let guest = rjw_types::GuestId::new("AB12").unwrap();
        let ty = rjw_types::DocumentType::Itinerary;

        let server = RjwServer::open(config.clone()).await.unwrap();
        let renderer: Arc<dyn Renderer> = Arc::new(config.documents.clone());
        let generated = server.pipeline().generate(&guest, ty, renderer).await.unwrap();
        drop(server);

        let reopened = RjwServer::open(config).await.unwrap();
        let latest = reopened.pipeline().latest(&guest, ty).await.unwrap().unwrap();
        assert_eq!(latest, generated);
        let bytes = reopened.pipeline().fetch(&latest).await.unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn serve_stops_on_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let server = RjwServer::open(config(tmp.path())).await.unwrap();
        server.serve_with_shutdown(async {}).await.unwrap();
    }
}
