//! Security-policy engine capability.
//!
//! The engine is shared by all requests; each request gets its own
//! [`PolicyTransaction`], which walks strictly forward through
//! connection, URI, header and body phases before it is logged and closed.

pub mod adapter;
pub mod engine;

pub use adapter::{inspect, SecurityDecision, TransactionInput};
pub use engine::SignatureEngine;

/// Transaction phases, in the only order they may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    New,
    Connection,
    Uri,
    RequestHeaders,
    RequestBody,
    Logging,
    Closed,
}

/// Why a transaction was interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervention {
    pub status: u16,
    pub rule_id: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("cannot enter {requested:?} from {current:?}")]
    PhaseOrder { current: Phase, requested: Phase },
    #[error("directives path is empty")]
    MissingDirectives,
    #[error("failed to read directives {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse directives {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("rule {id} has an invalid pattern: {source}")]
    Pattern { id: String, source: regex::Error },
}

pub trait PolicyEngine: Send + Sync {
    /// Starts an independent transaction for one request.
    fn new_transaction(&self, request_id: &str) -> Box<dyn PolicyTransaction>;

    fn rule_count(&self) -> usize;
}

pub trait PolicyTransaction: Send {
    fn process_connection(
        &mut self,
        client_addr: &str,
        client_port: u16,
        server_addr: &str,
        server_port: u16,
    ) -> Result<(), PolicyError>;

    fn process_uri(&mut self, method: &str, uri: &str, protocol: &str) -> Result<(), PolicyError>;

    /// Adds one header value; repeated names are added once per value.
    fn add_request_header(&mut self, name: &str, value: &str) -> Result<(), PolicyError>;

    fn process_request_headers(&mut self) -> Result<(), PolicyError>;

    fn process_request_body(&mut self, body: &[u8]) -> Result<(), PolicyError>;

    /// `Some` once the transaction has been interrupted.
    fn intervention(&self) -> Option<Intervention>;

    fn process_logging(&mut self);

    fn close(&mut self);
}
