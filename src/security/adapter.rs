use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{PolicyEngine, PolicyError, PolicyTransaction};
use crate::pipeline::CapturedRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityDecision {
    Pass,
    /// `reason` is the interrupting rule id when one is known.
    Block { reason: Option<String> },
}

/// Owned copy of everything a transaction needs, so evaluation can move to a
/// blocking thread.
#[derive(Debug, Clone)]
pub struct TransactionInput {
    pub request_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub method: String,
    pub uri: String,
    pub protocol: String,
    /// One entry per header value, in arrival order.
    pub headers: Vec<(String, String)>,
}

impl TransactionInput {
    pub fn from_request(req: &CapturedRequest, request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            remote_addr: req.remote_addr(),
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            protocol: format!("{:?}", req.version()),
            headers: req
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        }
    }
}

/// Runs a full transaction for one request off the async executor.
pub async fn inspect(
    engine: Arc<dyn PolicyEngine>,
    input: TransactionInput,
    body: Bytes,
) -> SecurityDecision {
    let request_id = input.request_id.clone();
    match tokio::task::spawn_blocking(move || evaluate(engine.as_ref(), &input, &body)).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(request_id = %request_id, "Policy evaluation aborted: {}", e);
            SecurityDecision::Block { reason: None }
        }
    }
}

/// Synchronous evaluation. The transaction is logged and closed on every
/// exit path, including unwinding.
pub fn evaluate(engine: &dyn PolicyEngine, input: &TransactionInput, body: &[u8]) -> SecurityDecision {
    let mut guard = TransactionGuard(Some(engine.new_transaction(&input.request_id)));
    let Some(tx) = guard.0.as_mut() else {
        return SecurityDecision::Block { reason: None };
    };

    match run_phases(tx.as_mut(), input, body) {
        Ok(decision) => {
            if let SecurityDecision::Block { reason } = &decision {
                tracing::warn!(
                    request_id = %input.request_id,
                    "Request blocked by rule {}",
                    reason.as_deref().unwrap_or("<unknown>")
                );
            }
            decision
        }
        Err(e) => {
            tracing::warn!(request_id = %input.request_id, "Policy engine error: {}", e);
            SecurityDecision::Block { reason: None }
        }
    }
}

fn run_phases(
    tx: &mut dyn PolicyTransaction,
    input: &TransactionInput,
    body: &[u8],
) -> Result<SecurityDecision, PolicyError> {
    let (client_addr, client_port) = match input.remote_addr {
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => (String::new(), 0),
    };
    tx.process_connection(&client_addr, client_port, "", 0)?;
    tx.process_uri(&input.method, &input.uri, &input.protocol)?;
    for (name, value) in &input.headers {
        tx.add_request_header(name, value)?;
    }

    tx.process_request_headers()?;
    if let Some(decision) = interrupted(tx) {
        return Ok(decision);
    }

    tx.process_request_body(body)?;
    if let Some(decision) = interrupted(tx) {
        return Ok(decision);
    }

    Ok(SecurityDecision::Pass)
}

fn interrupted(tx: &dyn PolicyTransaction) -> Option<SecurityDecision> {
    tx.intervention().map(|i| SecurityDecision::Block {
        reason: (!i.rule_id.is_empty()).then_some(i.rule_id),
    })
}

struct TransactionGuard(Option<Box<dyn PolicyTransaction>>);

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if let Some(mut tx) = self.0.take() {
            tx.process_logging();
            tx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Intervention, Phase};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        calls: Arc<Mutex<Vec<&'static str>>>,
        interrupt_at: Option<Phase>,
        fail_at: Option<Phase>,
        panic_at: Option<Phase>,
    }

    struct FakeEngine(Script);

    struct FakeTransaction {
        calls: Arc<Mutex<Vec<&'static str>>>,
        interrupt_at: Option<Phase>,
        fail_at: Option<Phase>,
        panic_at: Option<Phase>,
        interrupted: bool,
    }

    impl FakeTransaction {
        fn step(&mut self, phase: Phase, label: &'static str) -> Result<(), PolicyError> {
            self.calls.lock().expect("lock").push(label);
            if self.panic_at == Some(phase) {
                panic!("engine crashed");
            }
            if self.fail_at == Some(phase) {
                return Err(PolicyError::PhaseOrder {
                    current: Phase::New,
                    requested: phase,
                });
            }
            if self.interrupt_at == Some(phase) {
                self.interrupted = true;
            }
            Ok(())
        }
    }

    impl PolicyEngine for FakeEngine {
        fn new_transaction(&self, _request_id: &str) -> Box<dyn PolicyTransaction> {
            Box::new(FakeTransaction {
                calls: self.0.calls.clone(),
                interrupt_at: self.0.interrupt_at,
                fail_at: self.0.fail_at,
                panic_at: self.0.panic_at,
                interrupted: false,
            })
        }

        fn rule_count(&self) -> usize {
            0
        }
    }

    impl PolicyTransaction for FakeTransaction {
        fn process_connection(&mut self, _: &str, _: u16, _: &str, _: u16) -> Result<(), PolicyError> {
            self.step(Phase::Connection, "connection")
        }
        fn process_uri(&mut self, _: &str, _: &str, _: &str) -> Result<(), PolicyError> {
            self.step(Phase::Uri, "uri")
        }
        fn add_request_header(&mut self, _: &str, _: &str) -> Result<(), PolicyError> {
            self.calls.lock().expect("lock").push("header");
            Ok(())
        }
        fn process_request_headers(&mut self) -> Result<(), PolicyError> {
            self.step(Phase::RequestHeaders, "headers")
        }
        fn process_request_body(&mut self, _: &[u8]) -> Result<(), PolicyError> {
            self.step(Phase::RequestBody, "body")
        }
        fn intervention(&self) -> Option<Intervention> {
            self.interrupted.then(|| Intervention {
                status: 403,
                rule_id: "F-1".into(),
                message: "fake".into(),
            })
        }
        fn process_logging(&mut self) {
            self.calls.lock().expect("lock").push("logging");
        }
        fn close(&mut self) {
            self.calls.lock().expect("lock").push("close");
        }
    }

    fn input() -> TransactionInput {
        TransactionInput {
            request_id: "r".into(),
            remote_addr: Some("10.0.0.7:51234".parse().expect("addr")),
            method: "POST".into(),
            uri: "/upload?x=1".into(),
            protocol: "HTTP/1.1".into(),
            headers: vec![("host".into(), "app".into()), ("accept".into(), "*/*".into())],
        }
    }

    async fn run(script: Script) -> (SecurityDecision, Vec<&'static str>) {
        let calls = script.calls.clone();
        let decision = inspect(Arc::new(FakeEngine(script)), input(), Bytes::from_static(b"body")).await;
        let calls = calls.lock().expect("lock").clone();
        (decision, calls)
    }

    #[tokio::test]
    async fn test_pass_walks_every_phase_once() {
        let (decision, calls) = run(Script::default()).await;
        assert_eq!(decision, SecurityDecision::Pass);
        assert_eq!(
            calls,
            vec!["connection", "uri", "header", "header", "headers", "body", "logging", "close"]
        );
    }

    #[tokio::test]
    async fn test_header_interruption_skips_body() {
        let (decision, calls) = run(Script {
            interrupt_at: Some(Phase::RequestHeaders),
            ..Script::default()
        })
        .await;
        assert_eq!(decision, SecurityDecision::Block { reason: Some("F-1".into()) });
        assert!(!calls.contains(&"body"), "Body phase must not run after a header block");
        assert_eq!(calls.iter().filter(|c| **c == "close").count(), 1);
    }

    #[tokio::test]
    async fn test_body_interruption_blocks() {
        let (decision, calls) = run(Script {
            interrupt_at: Some(Phase::RequestBody),
            ..Script::default()
        })
        .await;
        assert!(matches!(decision, SecurityDecision::Block { .. }));
        assert_eq!(calls.last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_engine_error_fails_closed() {
        let (decision, calls) = run(Script {
            fail_at: Some(Phase::Uri),
            ..Script::default()
        })
        .await;
        assert_eq!(decision, SecurityDecision::Block { reason: None });
        assert_eq!(calls, vec!["connection", "uri", "logging", "close"]);
    }

    #[tokio::test]
    async fn test_panicking_engine_still_finalized() {
        let (decision, calls) = run(Script {
            panic_at: Some(Phase::RequestBody),
            ..Script::default()
        })
        .await;
        assert_eq!(decision, SecurityDecision::Block { reason: None });
        assert_eq!(calls.iter().filter(|c| **c == "logging").count(), 1);
        assert_eq!(calls.last(), Some(&"close"));
    }
}
