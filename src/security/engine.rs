use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

use super::{Intervention, Phase, PolicyEngine, PolicyError, PolicyTransaction};

/// Whether matches interrupt, are only logged, or are not evaluated at all.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    #[default]
    On,
    DetectionOnly,
    Off,
}

/// The phase in which a signature is evaluated.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    /// URI and header values.
    RequestHeaders,
    /// The raw request body.
    RequestBody,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Deny,
    Log,
}

/// A single signature from the database.
#[derive(Debug, Clone, Deserialize)]
pub struct Signature {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    pub phase: RulePhase,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: u8,
    #[serde(default)]
    pub action: RuleAction,
}

#[derive(Deserialize)]
struct SignatureDatabase {
    #[serde(default)]
    mode: EngineMode,
    #[serde(default)]
    signatures: Vec<Signature>,
}

enum Matcher {
    /// Lowercased; matched case-insensitively.
    Literal(String),
    Regex(Regex),
}

struct CompiledSignature {
    signature: Signature,
    matcher: Matcher,
}

impl CompiledSignature {
    fn compile(signature: Signature) -> Result<Self, PolicyError> {
        let matcher = if signature.is_regex {
            Matcher::Regex(Regex::new(&signature.pattern).map_err(|source| PolicyError::Pattern {
                id: signature.id.clone(),
                source,
            })?)
        } else {
            Matcher::Literal(signature.pattern.to_lowercase())
        };
        Ok(Self { signature, matcher })
    }

    fn matches(&self, target: &str, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::Literal(pattern) => lowered.contains(pattern.as_str()),
            Matcher::Regex(re) => re.is_match(target),
        }
    }
}

/// Signature-database policy engine. Cheap to share: transactions hold an
/// `Arc` to the compiled rule set and never mutate it.
pub struct SignatureEngine {
    mode: EngineMode,
    rules: Arc<Vec<CompiledSignature>>,
}

impl SignatureEngine {
    /// Loads and compiles the database at `path`. Any problem is fatal.
    pub fn from_file(path: &str) -> Result<Self, PolicyError> {
        if path.trim().is_empty() {
            return Err(PolicyError::MissingDirectives);
        }
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&content, path)
    }

    pub fn from_json(content: &str, origin: &str) -> Result<Self, PolicyError> {
        let db: SignatureDatabase =
            serde_json::from_str(content).map_err(|source| PolicyError::Parse {
                path: origin.to_string(),
                source,
            })?;

        let rules = db
            .signatures
            .into_iter()
            .map(CompiledSignature::compile)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            "Policy engine loaded {} signatures from {} (mode {:?})",
            rules.len(),
            origin,
            db.mode
        );

        Ok(Self {
            mode: db.mode,
            rules: Arc::new(rules),
        })
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }
}

impl PolicyEngine for SignatureEngine {
    fn new_transaction(&self, request_id: &str) -> Box<dyn PolicyTransaction> {
        Box::new(SignatureTransaction {
            request_id: request_id.to_string(),
            mode: self.mode,
            rules: Arc::clone(&self.rules),
            phase: Phase::New,
            client: String::new(),
            uri: String::new(),
            headers: Vec::new(),
            intervention: None,
            matched: Vec::new(),
        })
    }

    fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

struct SignatureTransaction {
    request_id: String,
    mode: EngineMode,
    rules: Arc<Vec<CompiledSignature>>,
    phase: Phase,
    client: String,
    uri: String,
    headers: Vec<(String, String)>,
    intervention: Option<Intervention>,
    /// Ids of every signature that matched, denied or not.
    matched: Vec<String>,
}

impl SignatureTransaction {
    fn enter(&mut self, from: Phase, to: Phase) -> Result<(), PolicyError> {
        if self.phase != from {
            return Err(PolicyError::PhaseOrder {
                current: self.phase,
                requested: to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Runs every signature of `phase` against `targets`. Stops at the first
    /// interrupting match.
    fn evaluate(&mut self, phase: RulePhase, targets: &[&str]) {
        if self.mode == EngineMode::Off || self.intervention.is_some() {
            return;
        }
        let lowered: Vec<String> = targets.iter().map(|t| t.to_lowercase()).collect();
        let rules = Arc::clone(&self.rules);

        for rule in rules.iter().filter(|r| r.signature.phase == phase) {
            let hit = targets
                .iter()
                .zip(&lowered)
                .any(|(target, low)| rule.matches(target, low));
            if !hit {
                continue;
            }

            let sig = &rule.signature;
            self.matched.push(sig.id.clone());

            if self.mode == EngineMode::On && sig.action == RuleAction::Deny {
                self.intervention = Some(Intervention {
                    status: 403,
                    rule_id: sig.id.clone(),
                    message: format!("{} [{}] severity {}", sig.category, sig.id, sig.severity),
                });
                return;
            }

            tracing::info!(
                request_id = %self.request_id,
                "Signature {} ({}) matched without interrupting",
                sig.id,
                sig.category
            );
        }
    }
}

impl PolicyTransaction for SignatureTransaction {
    fn process_connection(
        &mut self,
        client_addr: &str,
        client_port: u16,
        _server_addr: &str,
        _server_port: u16,
    ) -> Result<(), PolicyError> {
        self.enter(Phase::New, Phase::Connection)?;
        self.client = format!("{}:{}", client_addr, client_port);
        Ok(())
    }

    fn process_uri(&mut self, _method: &str, uri: &str, _protocol: &str) -> Result<(), PolicyError> {
        self.enter(Phase::Connection, Phase::Uri)?;
        self.uri = uri.to_string();
        Ok(())
    }

    fn add_request_header(&mut self, name: &str, value: &str) -> Result<(), PolicyError> {
        if self.phase != Phase::Uri {
            return Err(PolicyError::PhaseOrder {
                current: self.phase,
                requested: Phase::RequestHeaders,
            });
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn process_request_headers(&mut self) -> Result<(), PolicyError> {
        self.enter(Phase::Uri, Phase::RequestHeaders)?;

        let decoded = urlencoding::decode(&self.uri)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| self.uri.clone());
        let uri = self.uri.clone();
        let headers = std::mem::take(&mut self.headers);

        let mut targets: Vec<&str> = vec![uri.as_str(), decoded.as_str()];
        targets.extend(headers.iter().map(|(_, v)| v.as_str()));
        self.evaluate(RulePhase::RequestHeaders, &targets);

        self.headers = headers;
        Ok(())
    }

    fn process_request_body(&mut self, body: &[u8]) -> Result<(), PolicyError> {
        self.enter(Phase::RequestHeaders, Phase::RequestBody)?;
        if body.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(body);
        self.evaluate(RulePhase::RequestBody, &[text.as_ref()]);
        Ok(())
    }

    fn intervention(&self) -> Option<Intervention> {
        self.intervention.clone()
    }

    fn process_logging(&mut self) {
        if self.phase >= Phase::Logging {
            return;
        }
        self.phase = Phase::Logging;

        if let Some(intervention) = &self.intervention {
            tracing::warn!(
                request_id = %self.request_id,
                "Transaction interrupted ({}) by {}: {} for client {} on {}",
                intervention.status,
                intervention.rule_id,
                intervention.message,
                self.client,
                self.uri
            );
        } else if !self.matched.is_empty() {
            tracing::info!(
                request_id = %self.request_id,
                "Transaction matched {:?} without interruption",
                self.matched
            );
        }
    }

    fn close(&mut self) {
        self.phase = Phase::Closed;
        self.headers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"{
        "mode": "on",
        "signatures": [
            { "id": "T-100", "pattern": "../", "phase": "request_headers", "category": "PathTraversal", "severity": 100 },
            { "id": "T-200", "pattern": "(?i)union\\s+select", "is_regex": true, "phase": "request_body", "category": "SQLi", "severity": 100 },
            { "id": "T-300", "pattern": "sqlmap", "phase": "request_headers", "category": "Scanner", "action": "log" }
        ]
    }"#;

    fn engine(db: &str) -> SignatureEngine {
        SignatureEngine::from_json(db, "test").expect("valid database")
    }

    fn run_headers(tx: &mut dyn PolicyTransaction, uri: &str, headers: &[(&str, &str)]) {
        tx.process_connection("10.0.0.1", 4000, "", 0).expect("connection");
        tx.process_uri("GET", uri, "HTTP/1.1").expect("uri");
        for (name, value) in headers {
            tx.add_request_header(name, value).expect("header");
        }
        tx.process_request_headers().expect("headers");
    }

    #[test]
    fn test_header_phase_interrupts() {
        let engine = engine(DB);
        let mut tx = engine.new_transaction("r1");
        run_headers(tx.as_mut(), "/files?name=..%2F..%2Fetc", &[]);

        let intervention = tx.intervention().expect("interrupted");
        assert_eq!(intervention.rule_id, "T-100");
        assert_eq!(intervention.status, 403);
    }

    #[test]
    fn test_body_phase_interrupts() {
        let engine = engine(DB);
        let mut tx = engine.new_transaction("r2");
        run_headers(tx.as_mut(), "/search", &[("content-type", "text/plain")]);
        assert!(tx.intervention().is_none());

        tx.process_request_body(b"q=1 UNION   SELECT password").expect("body");
        assert_eq!(tx.intervention().expect("interrupted").rule_id, "T-200");
    }

    #[test]
    fn test_log_action_never_interrupts() {
        let engine = engine(DB);
        let mut tx = engine.new_transaction("r3");
        run_headers(tx.as_mut(), "/", &[("user-agent", "sqlmap/1.7")]);
        assert!(tx.intervention().is_none());
    }

    #[test]
    fn test_detection_only_mode() {
        let engine = engine(&DB.replace("\"mode\": \"on\"", "\"mode\": \"detection_only\""));
        assert_eq!(engine.mode(), EngineMode::DetectionOnly);
        let mut tx = engine.new_transaction("r4");
        run_headers(tx.as_mut(), "/../../etc/passwd", &[]);
        assert!(tx.intervention().is_none());
    }

    #[test]
    fn test_phase_order_enforced() {
        let engine = engine(DB);
        let mut tx = engine.new_transaction("r5");
        assert!(matches!(
            tx.process_request_body(b"x"),
            Err(PolicyError::PhaseOrder { .. })
        ));
        tx.process_connection("1.2.3.4", 1, "", 0).expect("connection");
        assert!(tx.process_connection("1.2.3.4", 1, "", 0).is_err(), "No phase repeats");
    }

    #[test]
    fn test_invalid_database_rejected() {
        assert!(matches!(
            SignatureEngine::from_json("{ nope", "bad"),
            Err(PolicyError::Parse { .. })
        ));
        let bad_regex = r#"{ "signatures": [ { "id": "X", "pattern": "(", "is_regex": true, "phase": "request_body" } ] }"#;
        assert!(matches!(
            SignatureEngine::from_json(bad_regex, "bad"),
            Err(PolicyError::Pattern { .. })
        ));
        assert!(matches!(SignatureEngine::from_file(""), Err(PolicyError::MissingDirectives)));
    }

    #[test]
    fn test_shipped_rules_load() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/rules/signatures.json");
        let engine = SignatureEngine::from_file(path).expect("shipped rules compile");
        assert!(engine.rule_count() > 0);
    }
}
