use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rjw_pipeline::PipelineConfig;
use rjw_records::SyncMode;
use rjw_render::PdfRenderer;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Service configuration, read from TOML with environment overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Origin allowed by CORS. No cross-origin access when unset.
    pub frontend_url: Option<String>,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    /// Title and schedule printed on generated documents.
    pub documents: PdfRenderer,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            frontend_url: None,
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            documents: PdfRenderer::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem asset store.
    pub assets_root: PathBuf,
    /// Record journal file.
    pub journal_path: PathBuf,
    pub journal_sync: SyncMode,
    /// JSON guest list. The directory starts empty when unset.
    pub guests_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            assets_root: PathBuf::from("data/assets"),
            journal_path: PathBuf::from("data/records.journal"),
            journal_sync: SyncMode::EveryWrite,
            guests_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> ServerResult<Self> {
        toml::from_str(raw).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `RJW_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> ServerResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ServerResult<()> {
        if let Some(addr) = lookup("RJW_BIND_ADDR") {
            self.bind_addr = addr
                .parse()
                .map_err(|e| ServerError::Config(format!("RJW_BIND_ADDR={addr}: {e}")))?;
        }
        if let Some(url) = lookup("RJW_FRONTEND_URL") {
            self.frontend_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(root) = lookup("RJW_ASSETS_ROOT") {
            self.storage.assets_root = root.into();
        }
        if let Some(journal) = lookup("RJW_JOURNAL_PATH") {
            self.storage.journal_path = journal.into();
        }
        if let Some(guests) = lookup("RJW_GUESTS_PATH") {
            self.storage.guests_path = Some(guests.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn default_config() {
        let c = ServerConfig::default();
        assert_eq!(c.bind_addr, "127.0.0.1:8000".parse::<SocketAddr>().unwrap());
        assert!(c.frontend_url.is_none());
        assert_eq!(c.storage.journal_sync, SyncMode::EveryWrite);
        assert_eq!(c.pipeline.grace_period, Duration::from_secs(300));
    }

    #[test]
    fn partial_toml() {
        let c = ServerConfig::from_toml_str(
            r#"
            bind_addr = "0.0.0.0:9000"
            frontend_url = "https://rjwedding.uk"

            [storage]
            assets_root = "/srv/assets"

            [pipeline.retry]
            max_attempts = 6

            [documents]
            title = "Rosie & James"
            schedule = [{ time = "14:00", label = "Ceremony" }]
            "#,
        )
        .unwrap();
        assert_eq!(c.bind_addr.port(), 9000);
        assert_eq!(c.frontend_url.as_deref(), Some("https://rjwedding.uk"));
        assert_eq!(c.storage.assets_root, PathBuf::from("/srv/assets"));
        assert_eq!(c.storage.journal_path, PathBuf::from("data/records.journal"));
        assert_eq!(c.pipeline.retry.max_attempts, 6);
        assert_eq!(c.documents.schedule.len(), 1);
    }

    #[test]
    fn bundled_config_parses() {
        let c = ServerConfig::from_toml_str(include_str!("../../../config/rjw.toml")).unwrap();
        assert_eq!(c.storage.guests_path, Some(PathBuf::from("config/guests.json")));
        assert_eq!(c.pipeline.reconcile_interval, Duration::from_secs(60));
        assert_eq!(c.documents.title, "Rosie & James");
        assert!(c.documents.schedule[0].wedding_party_only);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(
            ServerConfig::from_toml_str("bind_addr = 12"),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RJW_BIND_ADDR", "0.0.0.0:8080"),
            ("RJW_FRONTEND_URL", "http://localhost:3000"),
            ("RJW_GUESTS_PATH", "guests.json"),
        ]
        .into_iter()
        .collect();
        let mut c = ServerConfig::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.bind_addr.port(), 8080);
        assert_eq!(c.frontend_url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(c.storage.guests_path, Some(PathBuf::from("guests.json")));

        let err = c
            .apply_overrides(|k| (k == "RJW_BIND_ADDR").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RJW_BIND_ADDR"));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rjw.toml");
        std::fs::write(&path, "bind_addr = \"127.0.0.1:9999\"\n").unwrap();
        let c = ServerConfig::load(&path).unwrap();
        assert!(c.bind_addr.port() == 9999 || std::env::var("RJW_BIND_ADDR").is_ok());
        assert!(ServerConfig::load(tmp.path().join("missing.toml")).is_err());
    }
}
