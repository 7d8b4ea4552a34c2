//! Content detectors.
//!
//! Each detector inspects the captured view of one request and returns the
//! file-like payloads it found. Detectors never touch the network body stream;
//! they read the buffered body through [`CapturedRequest`], which caches the
//! parsed form so every detector sees the same data.

pub mod base64;
pub mod multipart;
pub mod sniff;

use async_trait::async_trait;
use bytes::Bytes;

use crate::banner;
use crate::config::DetectorConfig;
use crate::pipeline::CapturedRequest;

pub use self::base64::Base64Detector;
pub use self::multipart::MultipartDetector;

/// One payload pulled out of a request.
#[derive(Debug)]
pub struct ExtractedArtifact {
    data: Bytes,
    file_name: String,
    source: String,
    mime_type: String,
}

impl ExtractedArtifact {
    /// Returns `None` for empty payloads or an empty source locator.
    pub fn new(
        data: Bytes,
        file_name: impl Into<String>,
        source: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Option<Self> {
        let source = source.into();
        if data.is_empty() || source.is_empty() {
            return None;
        }
        Some(Self {
            data,
            file_name: file_name.into(),
            source,
            mime_type: mime_type.into(),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where in the request the payload was found, e.g. `multipart-field:avatar`.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectionError {
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error("multipart part `{field}` exceeds {limit} bytes")]
    PartTooLarge { field: String, limit: usize },
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Short name used in operational logs.
    fn name(&self) -> &'static str;

    async fn detect(&self, req: &CapturedRequest) -> Result<Vec<ExtractedArtifact>, DetectionError>;
}

/// Builds the active detectors in their fixed evaluation order.
pub fn build_detectors(config: &DetectorConfig) -> Vec<Box<dyn Detector>> {
    let mut detectors: Vec<Box<dyn Detector>> = Vec::new();

    if config.enable_file {
        banner::print_success("Multipart file detector enabled");
        detectors.push(Box::new(MultipartDetector::new()));
    }

    if config.enable_base64 {
        banner::print_success("Base64 payload detector enabled");
        detectors.push(Box::new(Base64Detector::new()));
    }

    if detectors.is_empty() {
        banner::print_warning("No content detectors enabled; artifacts will not be extracted");
    }

    detectors
}
