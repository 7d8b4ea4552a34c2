//! Buffered, re-readable view of one incoming request.
//!
//! The body is read from the network exactly once. Every consumer (detectors,
//! the policy transaction, the forwarder) gets its own `Bytes` handle over the
//! same buffer, so no stage can exhaust the body for a later one.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, Method, Uri, Version};
use tokio::sync::OnceCell;

use crate::detector::DetectionError;

/// Bounds applied while parsing multipart bodies. The body itself is already
/// held in memory under `server.max_body_bytes`, so parts are collected into
/// memory as well; this only caps a single part.
#[derive(Debug, Clone, Copy)]
pub struct FormLimits {
    /// Parts larger than this abort the parse.
    pub max_part_bytes: usize,
}

impl Default for FormLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: 64 << 20,
        }
    }
}

/// An uploaded file part of a multipart body.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Values carried by the request body.
#[derive(Debug, Default)]
pub struct FormBody {
    /// Urlencoded body pairs or multipart text fields, in order.
    pub fields: Vec<(String, String)>,
    pub files: Vec<FilePart>,
}

/// Every key/value the request carries, parsed once.
///
/// The query never fails to parse. A broken body only poisons `body`, so
/// consumers of the query still see it.
#[derive(Debug)]
pub struct ParsedForm {
    /// Query string pairs, in order.
    pub query: Vec<(String, String)>,
    pub body: Result<FormBody, DetectionError>,
}

pub struct CapturedRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    limits: FormLimits,
    form: OnceCell<ParsedForm>,
}

impl CapturedRequest {
    pub fn new(
        parts: http::request::Parts,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
        limits: FormLimits,
    ) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            remote_addr,
            limits,
            form: OnceCell::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// A fresh handle over the buffered body. Cheap: no bytes are copied.
    pub fn body(&self) -> Bytes {
        self.body.clone()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Host header, falling back to the URI authority.
    pub fn host(&self) -> String {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
            .unwrap_or(false)
    }

    fn is_urlencoded(&self) -> bool {
        self.content_type()
            .map(|ct| {
                ct.to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }

    /// Parsed query and body values. The parse runs on first use only; every
    /// later caller gets the cached result, body error included.
    pub async fn form(&self) -> &ParsedForm {
        self.form.get_or_init(|| self.parse_form()).await
    }

    async fn parse_form(&self) -> ParsedForm {
        let query = self
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        ParsedForm {
            query,
            body: self.parse_body().await,
        }
    }

    async fn parse_body(&self) -> Result<FormBody, DetectionError> {
        let carries_form = matches!(self.method, Method::POST | Method::PUT | Method::PATCH);

        if self.is_multipart() {
            let content_type = self.content_type().unwrap_or_default();
            parse_multipart(content_type, self.body(), self.limits).await
        } else if carries_form && self.is_urlencoded() {
            Ok(FormBody {
                fields: url::form_urlencoded::parse(&self.body).into_owned().collect(),
                files: Vec::new(),
            })
        } else {
            Ok(FormBody::default())
        }
    }
}

async fn parse_multipart(
    content_type: &str,
    body: Bytes,
    limits: FormLimits,
) -> Result<FormBody, DetectionError> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| DetectionError::Multipart(e.to_string()))?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();
    let mut files = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| DetectionError::Multipart(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|m| m.to_string());

        let mut buf = BytesMut::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| DetectionError::Multipart(e.to_string()))?
        {
            if buf.len() + chunk.len() > limits.max_part_bytes {
                return Err(DetectionError::PartTooLarge {
                    field: name,
                    limit: limits.max_part_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        let data = buf.freeze();

        match file_name {
            Some(file_name) if !file_name.is_empty() => files.push(FilePart {
                field: name,
                file_name,
                content_type,
                data,
            }),
            _ => fields.push((name, String::from_utf8_lossy(&data).into_owned())),
        }
    }

    Ok(FormBody { fields, files })
}
