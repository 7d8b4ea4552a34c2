use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{AuditError, AuditLogger, AuditRecord};
use crate::config::ElasticConfig;

/// Indexes each record as one document in a search index.
pub struct ElasticLogger {
    client: Client,
    urls: Vec<String>,
    index: String,
}

impl ElasticLogger {
    pub fn new(config: &ElasticConfig) -> Result<Self, AuditError> {
        if config.urls.is_empty() {
            return Err(AuditError::Index("no cluster URLs configured".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AuditError::Index(e.to_string()))?;

        Ok(Self {
            client,
            urls: config
                .urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            index: config.index.clone(),
        })
    }

    fn document_url(&self, base: &str) -> String {
        format!("{}/{}/_doc", base, self.index)
    }
}

#[async_trait]
impl AuditLogger for ElasticLogger {
    fn name(&self) -> &'static str {
        "elastic"
    }

    /// Tries each node in order; the first one that accepts the document wins.
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut last_error = String::new();

        for base in &self.urls {
            match self.client.post(self.document_url(base)).json(record).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_error = format!("{} answered {}", base, resp.status());
                }
                Err(e) => {
                    last_error = format!("{}: {}", base, e);
                }
            }
            tracing::debug!("Elastic node rejected audit record: {}", last_error);
        }

        Err(AuditError::Index(last_error))
    }
}
