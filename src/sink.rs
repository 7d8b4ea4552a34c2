//! Store-then-audit processing for extracted artifacts.
//!
//! Every artifact is handled by its own detached task. Nothing here can fail
//! the request that produced the artifact: storage and audit errors end up in
//! the operational log only.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::audit::{AuditLogger, AuditRecord};
use crate::detector::ExtractedArtifact;
use crate::storage::Uploader;

/// Owned request metadata carried into detached sink tasks.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub host: String,
    pub path: String,
    pub method: String,
    pub remote_addr: String,
}

pub struct ArtifactSink {
    uploader: Arc<dyn Uploader>,
    loggers: Vec<Arc<dyn AuditLogger>>,
    task_timeout: Duration,
}

impl ArtifactSink {
    pub fn new(
        uploader: Arc<dyn Uploader>,
        loggers: Vec<Arc<dyn AuditLogger>>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            uploader,
            loggers,
            task_timeout,
        }
    }

    /// Spawns one independent task per artifact and returns immediately.
    /// The tasks are not tied to the request and may outlive its response.
    pub fn dispatch(self: &Arc<Self>, meta: &RequestMeta, artifacts: Vec<ExtractedArtifact>) {
        for artifact in artifacts {
            let sink = Arc::clone(self);
            let meta = meta.clone();
            let span = tracing::info_span!("artifact", request_id = %meta.request_id);

            tokio::spawn(
                async move {
                    let name = artifact.file_name().to_string();
                    if tokio::time::timeout(sink.task_timeout, sink.process(&meta, artifact))
                        .await
                        .is_err()
                    {
                        tracing::warn!(
                            "Gave up storing {} after {:?}",
                            name,
                            sink.task_timeout
                        );
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Stores one artifact and emits its audit record to every logger.
    /// Returns the record when the store succeeded.
    pub async fn process(&self, meta: &RequestMeta, artifact: ExtractedArtifact) -> Option<AuditRecord> {
        let unique_name = storage_name(&meta.request_id, artifact.file_name());

        let storage_locator = match self
            .uploader
            .store(artifact.data().clone(), &unique_name, artifact.mime_type())
            .await
        {
            Ok(locator) => locator,
            Err(e) => {
                tracing::warn!(
                    request_id = %meta.request_id,
                    "Failed to store {} from {}: {}",
                    artifact.file_name(),
                    artifact.source(),
                    e
                );
                return None;
            }
        };

        let record = AuditRecord {
            timestamp: Utc::now(),
            request_id: meta.request_id.clone(),
            host: meta.host.clone(),
            path: meta.path.clone(),
            method: meta.method.clone(),
            remote_addr: meta.remote_addr.clone(),
            file_name: artifact.file_name().to_string(),
            file_size: artifact.size() as u64,
            mime_type: artifact.mime_type().to_string(),
            storage_locator,
            source: artifact.source().to_string(),
        };

        for logger in &self.loggers {
            if let Err(e) = logger.emit(&record).await {
                tracing::warn!(
                    request_id = %meta.request_id,
                    "Audit logger `{}` rejected record for {}: {}",
                    logger.name(),
                    record.storage_locator,
                    e
                );
            }
        }

        tracing::info!(
            request_id = %meta.request_id,
            "Artifact stored at {} (from {})",
            record.storage_locator,
            record.source
        );
        Some(record)
    }
}

/// `<request_id>_<file name>`, reduced to one safe path segment.
pub fn storage_name(request_id: &str, file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let cleaned = if cleaned.is_empty() { "artifact" } else { cleaned };
    format!("{}_{}", request_id, cleaned)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::AuditError;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryUploader {
        pub(crate) stored: Mutex<Vec<(String, Bytes)>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl Uploader for MemoryUploader {
        async fn store(&self, data: Bytes, unique_name: &str, _mime: &str) -> Result<String, StorageError> {
            if self.fail {
                return Err(StorageError::ObjectStore("backend unreachable".into()));
            }
            self.stored.lock().expect("lock").push((unique_name.to_string(), data));
            Ok(format!("mem://{}", unique_name))
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingLogger {
        pub(crate) records: Mutex<Vec<AuditRecord>>,
        pub(crate) fail: bool,
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait]
    impl AuditLogger for CountingLogger {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuditError::Index("down".into()));
            }
            self.records.lock().expect("lock").push(record.clone());
            Ok(())
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            request_id: "req-1".into(),
            host: "app.example".into(),
            path: "/upload".into(),
            method: "POST".into(),
            remote_addr: "10.0.0.7:51234".into(),
        }
    }

    fn artifact(name: &str) -> ExtractedArtifact {
        ExtractedArtifact::new(Bytes::from_static(b"\x89PNG"), name, "multipart-field:f", "image/png")
            .expect("non-empty")
    }

    #[tokio::test]
    async fn test_store_then_audit_every_logger() {
        let uploader = Arc::new(MemoryUploader::default());
        let first = Arc::new(CountingLogger::default());
        let second = Arc::new(CountingLogger::default());
        let sink = ArtifactSink::new(
            uploader.clone(),
            vec![first.clone(), second.clone()],
            Duration::from_secs(5),
        );

        let record = sink.process(&meta(), artifact("me.png")).await.expect("stored");

        assert_eq!(uploader.stored.lock().expect("lock").len(), 1);
        assert_eq!(record.storage_locator, "mem://req-1_me.png");
        assert_eq!(record.file_size, 4);
        assert_eq!(first.records.lock().expect("lock").len(), 1);
        assert_eq!(second.records.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_logger_is_isolated() {
        let broken = Arc::new(CountingLogger {
            fail: true,
            ..CountingLogger::default()
        });
        let healthy = Arc::new(CountingLogger::default());
        let sink = ArtifactSink::new(
            Arc::new(MemoryUploader::default()),
            vec![broken.clone(), healthy.clone()],
            Duration::from_secs(5),
        );

        assert!(sink.process(&meta(), artifact("a.png")).await.is_some());
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.records.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_store_emits_nothing() {
        let logger = Arc::new(CountingLogger::default());
        let sink = ArtifactSink::new(
            Arc::new(MemoryUploader {
                fail: true,
                ..MemoryUploader::default()
            }),
            vec![logger.clone()],
            Duration::from_secs(5),
        );

        assert!(sink.process(&meta(), artifact("a.png")).await.is_none());
        assert_eq!(logger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_runs_detached() {
        let uploader = Arc::new(MemoryUploader::default());
        let logger = Arc::new(CountingLogger::default());
        let sink = Arc::new(ArtifactSink::new(
            uploader.clone(),
            vec![logger.clone()],
            Duration::from_secs(5),
        ));

        sink.dispatch(&meta(), vec![artifact("a.png"), artifact("b.png")]);

        for _ in 0..100 {
            if logger.records.lock().expect("lock").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut names: Vec<String> = uploader
            .stored
            .lock()
            .expect("lock")
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["req-1_a.png", "req-1_b.png"]);
    }

    #[test]
    fn test_storage_name_is_single_segment() {
        assert_eq!(storage_name("id", "../../etc/passwd"), "id__.._etc_passwd");
        assert_eq!(storage_name("id", "..\\win.ini"), "id__win.ini");
        assert_eq!(storage_name("id", ""), "id_artifact");
        assert_eq!(storage_name("id", "photo.jpg"), "id_photo.jpg");
    }
}
