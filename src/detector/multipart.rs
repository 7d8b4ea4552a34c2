use async_trait::async_trait;

use super::{DetectionError, Detector, ExtractedArtifact};
use crate::pipeline::CapturedRequest;

const DEFAULT_PART_TYPE: &str = "application/octet-stream";

/// Emits one artifact per uploaded file in a `multipart/form-data` body.
#[derive(Debug, Default)]
pub struct MultipartDetector;

impl MultipartDetector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Detector for MultipartDetector {
    fn name(&self) -> &'static str {
        "multipart"
    }

    async fn detect(&self, req: &CapturedRequest) -> Result<Vec<ExtractedArtifact>, DetectionError> {
        if !req.is_multipart() {
            return Ok(Vec::new());
        }

        let body = req.form().await.body.as_ref().map_err(Clone::clone)?;
        let artifacts = body
            .files
            .iter()
            .filter_map(|part| {
                ExtractedArtifact::new(
                    part.data.clone(),
                    part.file_name.clone(),
                    format!("multipart-field:{}", part.field),
                    part.content_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PART_TYPE.to_string()),
                )
            })
            .collect();

        Ok(artifacts)
    }
}
