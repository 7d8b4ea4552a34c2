//! Audit trail for intercepted artifacts.
//!
//! One [`AuditRecord`] is produced per successfully stored artifact and handed
//! to every active [`AuditLogger`].

pub mod elastic;
pub mod file;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::banner;
use crate::config::LoggerConfig;

pub use elastic::ElasticLogger;
pub use file::FileLogger;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub host: String,
    pub path: String,
    pub method: String,
    pub remote_addr: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub storage_locator: String,
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit file write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("index request failed: {0}")]
    Index(String),
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Builds every enabled logger. A logger that cannot start is skipped with a
/// warning so the others stay active.
pub async fn build_loggers(config: &LoggerConfig) -> Vec<Arc<dyn AuditLogger>> {
    let mut loggers: Vec<Arc<dyn AuditLogger>> = Vec::new();

    if config.enable_file {
        match FileLogger::open(&config.file).await {
            Ok(logger) => {
                banner::print_success(&format!("File audit logger writing to {}", config.file.path));
                loggers.push(Arc::new(logger));
            }
            Err(e) => banner::print_warning(&format!("File audit logger disabled: {}", e)),
        }
    }

    if config.enable_elastic {
        match ElasticLogger::new(&config.elastic) {
            Ok(logger) => {
                banner::print_success(&format!(
                    "Elastic audit logger indexing into `{}`",
                    config.elastic.index
                ));
                loggers.push(Arc::new(logger));
            }
            Err(e) => banner::print_warning(&format!("Elastic audit logger disabled: {}", e)),
        }
    }

    if loggers.is_empty() {
        banner::print_warning("No audit loggers active; stored artifacts will not be audited");
    }

    loggers
}
