use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::banner;

pub const CONFIG_FILE_NAME: &str = "gateway.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub waf: WafConfig,
    pub detectors: DetectorConfig,
    pub uploader: UploaderConfig,
    pub logger: LoggerConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub backend_url: String,
    /// Requests with larger bodies are refused before any inspection.
    pub max_body_bytes: usize,
    pub backend_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            backend_url: "http://localhost:3000".to_string(),
            max_body_bytes: 64 << 20,
            backend_timeout_seconds: 300,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WafConfig {
    pub directives_path: String,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            directives_path: "rules/signatures.json".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DetectorConfig {
    pub enable_file: bool,
    pub enable_base64: bool,
    /// A multipart part above this size aborts the multipart parse.
    pub max_part_bytes: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enable_file: true,
            enable_base64: true,
            max_part_bytes: 64 << 20,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploaderKind {
    #[default]
    Local,
    S3,
}

impl UploaderKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Some(UploaderKind::Local),
            "s3" => Some(UploaderKind::S3),
            _ => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct UploaderConfig {
    #[serde(rename = "type")]
    pub kind: UploaderKind,
    pub local: LocalUploaderConfig,
    pub s3: S3UploaderConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LocalUploaderConfig {
    pub path: String,
}

impl Default for LocalUploaderConfig {
    fn default() -> Self {
        Self {
            path: "/tmp/uploads".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct S3UploaderConfig {
    /// Custom endpoint for S3-compatible stores; path-style addressing is used when set.
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggerConfig {
    pub enable_file: bool,
    pub enable_elastic: bool,
    pub file: FileLoggerConfig,
    pub elastic: ElasticConfig,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enable_file: true,
            enable_elastic: false,
            file: FileLoggerConfig::default(),
            elastic: ElasticConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FileLoggerConfig {
    pub path: String,
}

impl Default for FileLoggerConfig {
    fn default() -> Self {
        Self {
            path: "/tmp/interceptor.log".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ElasticConfig {
    pub urls: Vec<String>,
    pub index: String,
    pub timeout_seconds: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            urls: vec!["http://localhost:9200".to_string()],
            index: "coraza-interceptor".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SinkConfig {
    /// Upper bound for one detached store-and-audit task.
    pub task_timeout_seconds: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            task_timeout_seconds: 60,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub debug_log: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug_log: "gateway_debug.log".to_string(),
        }
    }
}

/// Directory containing the executable, or the working directory.
pub fn base_dir() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        exe_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
    } else {
        std::env::current_dir().unwrap_or_default()
    }
}

/// Loads defaults, then the TOML file, then environment overrides. Callers
/// apply CLI flags with [`Config::apply_overrides`] and then [`Config::validate`].
///
/// A missing file is not an error; an unreadable or unparseable one is.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base_dir().join(CONFIG_FILE_NAME));

    let mut config = if path.exists() {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = parse_config(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        banner::print_success(&format!("Loaded config from {}", path.display()));
        config
    } else {
        banner::print_warning(&format!(
            "No {} found at {}. Using defaults.",
            CONFIG_FILE_NAME,
            path.display()
        ));
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(content)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("`{}` is not a boolean", other))),
    }
}

/// `:8080` means all interfaces.
fn normalize_listen(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

impl Config {
    /// Applies environment overrides. `lookup` returns the raw variable value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERVER_LISTEN_ADDRESS") {
            self.server.listen_address = v;
        }
        if let Some(v) = lookup("SERVER_BACKEND_URL") {
            self.server.backend_url = v;
        }
        if let Some(v) = lookup("WAF_DIRECTIVES_PATH") {
            self.waf.directives_path = v;
        }
        if let Some(v) = lookup("DETECTORS_ENABLE_FILE") {
            self.detectors.enable_file = parse_bool("DETECTORS_ENABLE_FILE", &v)?;
        }
        if let Some(v) = lookup("DETECTORS_ENABLE_BASE64") {
            self.detectors.enable_base64 = parse_bool("DETECTORS_ENABLE_BASE64", &v)?;
        }
        if let Some(v) = lookup("UPLOADER_TYPE") {
            self.uploader.kind = UploaderKind::parse(&v).ok_or_else(|| {
                ConfigError::invalid("UPLOADER_TYPE", format!("unknown uploader `{}`", v))
            })?;
        }
        if let Some(v) = lookup("UPLOADER_LOCAL_PATH") {
            self.uploader.local.path = v;
        }
        if let Some(v) = lookup("UPLOADER_S3_ENDPOINT") {
            self.uploader.s3.endpoint = Some(v);
        }
        if let Some(v) = lookup("UPLOADER_S3_BUCKET") {
            self.uploader.s3.bucket = v;
        }
        if let Some(v) = lookup("UPLOADER_S3_REGION") {
            self.uploader.s3.region = Some(v);
        }
        if let Some(v) = lookup("UPLOADER_S3_ACCESS_KEY") {
            self.uploader.s3.access_key = Some(v);
        }
        if let Some(v) = lookup("UPLOADER_S3_SECRET_KEY") {
            self.uploader.s3.secret_key = Some(v);
        }
        if let Some(v) = lookup("LOGGER_ENABLE_FILE") {
            self.logger.enable_file = parse_bool("LOGGER_ENABLE_FILE", &v)?;
        }
        if let Some(v) = lookup("LOGGER_ENABLE_ELASTIC") {
            self.logger.enable_elastic = parse_bool("LOGGER_ENABLE_ELASTIC", &v)?;
        }
        if let Some(v) = lookup("LOGGER_FILE_PATH") {
            self.logger.file.path = v;
        }
        if let Some(v) = lookup("LOGGER_ELASTIC_URLS") {
            self.logger.elastic.urls = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("LOGGER_ELASTIC_INDEX") {
            self.logger.elastic.index = v;
        }
        Ok(())
    }

    /// Command-line flags, the last configuration layer.
    pub fn apply_overrides(
        &mut self,
        listen: Option<String>,
        backend: Option<String>,
        rules: Option<String>,
    ) {
        if let Some(listen) = listen {
            self.server.listen_address = listen;
        }
        if let Some(backend) = backend {
            self.server.backend_url = backend;
        }
        if let Some(rules) = rules {
            self.waf.directives_path = rules;
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        normalize_listen(&self.server.listen_address)
            .parse()
            .map_err(|_| {
                ConfigError::invalid(
                    "server.listen_address",
                    format!("`{}` is not a socket address", self.server.listen_address),
                )
            })
    }

    pub fn backend_url(&self) -> Result<url::Url, ConfigError> {
        let url = url::Url::parse(&self.server.backend_url)
            .map_err(|e| ConfigError::invalid("server.backend_url", e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::invalid(
                "server.backend_url",
                format!("unsupported scheme `{}`", other),
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.backend_url()?;

        if self.waf.directives_path.trim().is_empty() {
            return Err(ConfigError::invalid("waf.directives_path", "must not be empty"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::invalid("server.max_body_bytes", "must be positive"));
        }
        if self.detectors.max_part_bytes == 0 {
            return Err(ConfigError::invalid("detectors.max_part_bytes", "must be positive"));
        }
        match self.uploader.kind {
            UploaderKind::Local if self.uploader.local.path.trim().is_empty() => {
                return Err(ConfigError::invalid("uploader.local.path", "must not be empty"));
            }
            UploaderKind::S3 if self.uploader.s3.bucket.trim().is_empty() => {
                return Err(ConfigError::invalid("uploader.s3.bucket", "must not be empty"));
            }
            _ => {}
        }
        if self.logger.enable_elastic && self.logger.elastic.urls.is_empty() {
            return Err(ConfigError::invalid("logger.elastic.urls", "at least one URL is required"));
        }
        Ok(())
    }
}
