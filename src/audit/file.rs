use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditError, AuditLogger, AuditRecord};
use crate::config::FileLoggerConfig;

/// Appends one JSON object per line to a local file.
pub struct FileLogger {
    file: Mutex<File>,
}

impl FileLogger {
    pub async fn open(config: &FileLoggerConfig) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

/// Record fields plus `level`, `message` and a Unix-seconds `time`.
fn to_line(record: &AuditRecord) -> Result<String, AuditError> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.remove("@timestamp");
        map.insert("level".into(), json!("info"));
        map.insert("time".into(), json!(record.timestamp.timestamp()));
        map.insert("message".into(), json!("file intercepted"));
    }
    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl AuditLogger for FileLogger {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = to_line(record)?;
        // one write per line under the lock keeps concurrent records whole
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::sample_record;

    #[tokio::test]
    async fn test_one_json_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let logger = FileLogger::open(&FileLoggerConfig {
            path: path.display().to_string(),
        })
        .await
        .expect("open");

        let record = sample_record();
        logger.emit(&record).await.expect("emit");
        logger.emit(&record).await.expect("emit");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(parsed["time"], record.timestamp.timestamp());
        assert_eq!(parsed["request_id"], "6a1f");
        assert_eq!(parsed["message"], "file intercepted");
        assert!(parsed.get("@timestamp").is_none());
    }
}
