use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use regex::Regex;

use super::sniff::{essence, sniff_content_type};
use super::{DetectionError, Detector, ExtractedArtifact};
use crate::pipeline::CapturedRequest;

/// At least five 4-char groups, optional `==`/`=` padding group.
const CANDIDATE_PATTERN: &str =
    r"^(?:[A-Za-z0-9+/]{4}){5,}(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=)?$";

const DEFAULT_EXTENSION: &str = ".bin";

/// Finds base64-encoded binaries hidden in query parameters and form fields.
pub struct Base64Detector {
    candidate: Regex,
}

impl Base64Detector {
    pub fn new() -> Self {
        Self {
            candidate: Regex::new(CANDIDATE_PATTERN).expect("base64 candidate pattern is valid"),
        }
    }

    /// Decodes one value and returns an artifact unless it is not base64 or
    /// decodes to plain text.
    fn inspect(&self, field: &str, value: &str, source: String) -> Option<ExtractedArtifact> {
        if !self.candidate.is_match(value) {
            return None;
        }

        let decoded = STANDARD.decode(value).ok()?;
        let mime_type = sniff_content_type(&decoded);
        if mime_type.starts_with("text/plain") {
            return None;
        }

        let file_name = format!("base64_{}{}", field, extension_for(mime_type));
        ExtractedArtifact::new(Bytes::from(decoded), file_name, source, mime_type)
    }
}

impl Default for Base64Detector {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort file extension (with leading dot) for a MIME type.
fn extension_for(mime_type: &str) -> String {
    mime_guess::get_mime_extensions_str(&essence(mime_type))
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

#[async_trait]
impl Detector for Base64Detector {
    fn name(&self) -> &'static str {
        "base64"
    }

    async fn detect(&self, req: &CapturedRequest) -> Result<Vec<ExtractedArtifact>, DetectionError> {
        let form = req.form().await;
        let mut artifacts = Vec::new();

        for (field, value) in &form.query {
            if let Some(artifact) = self.inspect(field, value, format!("query-param:{}", field)) {
                artifacts.push(artifact);
            }
        }

        // A body the parser rejects is reported by the multipart detector.
        match &form.body {
            Ok(body) => {
                for (field, value) in &body.fields {
                    if let Some(artifact) =
                        self.inspect(field, value, format!("form-field:{}", field))
                    {
                        artifacts.push(artifact);
                    }
                }
            }
            Err(e) => tracing::debug!("Skipping body values for base64 scan: {}", e),
        }

        Ok(artifacts)
    }
}
