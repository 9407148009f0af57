//! Bridge envelopes: the request/response pair exchanged between runtimes.
//!
//! A [`RequestEnvelope`] asks some runtime to execute one operation; the
//! [`ResponseEnvelope`] carrying the same id reports the outcome. The
//! [`Direction`] tag selects which runtime executes the request.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which runtime should execute a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Forward to the connected peer.
    #[serde(rename = "to-peer")]
    ToPeer,
    /// Execute in this runtime.
    #[serde(rename = "to-local")]
    ToLocal,
}

impl Direction {
    /// Wire spelling of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToPeer => "to-peer",
            Direction::ToLocal => "to-local",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to-peer" => Ok(Direction::ToPeer),
            "to-local" => Ok(Direction::ToLocal),
            other => Err(BridgeError::MalformedFrame(format!(
                "unknown direction tag '{other}'"
            ))),
        }
    }
}

/// The closed set of operations a runtime will execute on behalf of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Submit code to the local evaluator.
    Eval,
    /// Read a file as text.
    FileRead,
    /// Write text to a file.
    FileWrite,
    /// Run an external process.
    Shell,
}

impl OperationKind {
    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Eval => "eval",
            OperationKind::FileRead => "file-read",
            OperationKind::FileWrite => "file-write",
            OperationKind::Shell => "shell",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eval" | "evaluate" => Ok(OperationKind::Eval),
            "file-read" => Ok(OperationKind::FileRead),
            "file-write" => Ok(OperationKind::FileWrite),
            "shell" => Ok(OperationKind::Shell),
            other => Err(BridgeError::UnsupportedOperation(other.to_string())),
        }
    }
}

/// Operation argument: either a single text blob or an argument list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Code to evaluate, or a path.
    Text(String),
    /// Command line, or `[path, contents]` for writes.
    Args(Vec<String>),
}

impl Payload {
    /// View the payload as an argument list. Text is split on whitespace.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Payload::Text(s) => s.split_whitespace().map(String::from).collect(),
            Payload::Args(args) => args.clone(),
        }
    }

    /// View the payload as a single string. Lists are joined with spaces.
    pub fn to_text(&self) -> String {
        match self {
            Payload::Text(s) => s.clone(),
            Payload::Args(args) => args.join(" "),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Vec<String>> for Payload {
    fn from(args: Vec<String>) -> Self {
        Payload::Args(args)
    }
}

/// A request for one runtime to execute an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, echoed by the response.
    pub id: String,
    /// Which runtime executes the request.
    pub direction: Direction,
    /// Operation name as received. Kept verbatim so unknown names can be
    /// reported back to the caller.
    pub op: String,
    /// Operation argument.
    pub code: Payload,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl RequestEnvelope {
    /// Build a request for a known operation, stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        direction: Direction,
        op: OperationKind,
        code: impl Into<Payload>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            op: op.as_str().to_string(),
            code: code.into(),
            timestamp: now_ms(),
        }
    }

    /// Resolve the operation name against the supported vocabulary.
    pub fn kind(&self) -> Result<OperationKind, BridgeError> {
        self.op.parse()
    }
}

/// Outcome class of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

impl ResponseStatus {
    /// Wire spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for ResponseStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResponseStatus::Success),
            "error" => Ok(ResponseStatus::Error),
            "timeout" => Ok(ResponseStatus::Timeout),
            other => Err(BridgeError::MalformedFrame(format!(
                "unknown response status '{other}'"
            ))),
        }
    }
}

/// The outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id of the request this answers.
    pub id: String,
    pub status: ResponseStatus,
    /// Printed result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Descriptive message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ResponseEnvelope {
    /// A successful response carrying a printed value.
    pub fn success(id: impl Into<String>, value: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Success,
            value: Some(value.into()),
            error: None,
            execution_time_ms: Some(elapsed_ms),
        }
    }

    /// An error response carrying a descriptive message.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            value: None,
            error: Some(message.into()),
            execution_time_ms: None,
        }
    }

    /// A response reporting that the executing side gave up waiting.
    pub fn timeout(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Timeout,
            value: None,
            error: Some(message.into()),
            execution_time_ms: None,
        }
    }

    /// Attach the elapsed execution time.
    pub fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.execution_time_ms = Some(elapsed_ms);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Anything that travels over a bridge link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Envelope {
    /// Correlation id of the enclosed envelope.
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request(r) => &r.id,
            Envelope::Response(r) => &r.id,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
