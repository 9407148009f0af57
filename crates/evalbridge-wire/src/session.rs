//! ProtocolSession: one TCP conversation with a bencode eval peer.
//!
//! A request is a single dict; the peer answers with any number of frames
//! tagged with the request id, the last of which carries `"done"` in its
//! `status` list. The session collects frames with a cooperative polling
//! loop: each poll waits a bounded interval for data, so the loop can tell
//! "nothing yet" from "peer closed" from "finished". Termination precedence
//! is terminal status, then idle-poll exhaustion, then the overall deadline.
//!
//! The connection belongs to the session and closes when it is dropped, on
//! every exit path.

use crate::bencode::WireValue;
use crate::frame::{write_frame, FramePoll, FrameReader, WireError};
use crate::id::MessageIdGenerator;
use evalbridge_types::config::SessionConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

/// Bounds for the receive loop.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Overall deadline per request (and for connecting).
    pub timeout: Duration,
    /// Longest wait for data in a single poll.
    pub poll_interval: Duration,
    /// Consecutive empty polls after which collection stops.
    pub max_idle_polls: u32,
    /// Largest frame accepted from the peer.
    pub max_frame_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            max_idle_polls: config.max_idle_polls,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl SessionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What an evaluation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalResult {
    /// Printed value of the first frame that carried one.
    Value(String),
    /// Error text of the first error frame, when no value arrived.
    Error(String),
    /// Neither a value nor an error was reported.
    NoValue,
}

impl EvalResult {
    pub fn is_value(&self) -> bool {
        matches!(self, EvalResult::Value(_))
    }
}

/// An evaluation result together with everything else the peer reported.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub result: EvalResult,
    /// Concatenated `out` frames.
    pub stdout: String,
    /// Namespace reported with the value, if any.
    pub ns: Option<String>,
    /// Every frame received for the request, in arrival order.
    pub frames: Vec<WireValue>,
}

/// Pick the result of a request from its frames: the first `value` wins,
/// then the first `err`/`error`.
pub fn select_result(frames: &[WireValue]) -> EvalResult {
    if let Some(value) = frames.iter().find_map(|f| f.get_str("value")) {
        return EvalResult::Value(value.to_string());
    }
    for key in ["err", "error"] {
        if let Some(err) = frames.iter().find_map(|f| f.get_str(key)) {
            return EvalResult::Error(err.to_string());
        }
    }
    EvalResult::NoValue
}

/// A connection to a protocol peer.
pub struct ProtocolSession {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    ids: Arc<MessageIdGenerator>,
    opts: SessionOptions,
    peer: SocketAddr,
}

impl ProtocolSession {
    /// Connect to `addr` (`host:port`). Connecting is bounded by the
    /// session timeout.
    pub async fn connect(
        addr: &str,
        ids: Arc<MessageIdGenerator>,
        opts: SessionOptions,
    ) -> Result<Self, WireError> {
        let stream = tokio::time::timeout(opts.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout(opts.timeout))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(peer = %peer, "Connected to protocol peer");
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: FrameReader::with_limit(read_half, opts.max_frame_bytes),
            writer,
            ids,
            opts,
            peer,
        })
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request dict and collect its frames.
    ///
    /// An `id` is generated when the request lacks one. Frames tagged with a
    /// different id are skipped.
    pub async fn request(&mut self, mut request: WireValue) -> Result<Vec<WireValue>, WireError> {
        if request.as_dict().is_none() {
            return Err(WireError::MalformedFrame("request must be a dict".into()));
        }
        let id = match request.get_str("id") {
            Some(id) => id.to_string(),
            None => {
                let id = self.ids.generate().to_string();
                request.insert("id", WireValue::from(id.as_str()));
                id
            }
        };
        debug!(id = %id, op = request.get_str("op").unwrap_or("?"), "Sending request");
        write_frame(&mut self.writer, &request).await?;
        self.collect(&id).await
    }

    /// Receive loop for one request.
    async fn collect(&mut self, id: &str) -> Result<Vec<WireValue>, WireError> {
        let deadline = Instant::now() + self.opts.timeout;
        let mut frames = Vec::new();
        let mut idle_polls = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WireError::Timeout(self.opts.timeout));
            }
            let wait = remaining.min(self.opts.poll_interval);

            match self.reader.poll_frame(wait).await? {
                FramePoll::Frame(frame) => {
                    idle_polls = 0;
                    if let Some(frame_id) = frame.get_str("id") {
                        if frame_id != id {
                            debug!(expected = %id, got = %frame_id, "Skipping frame for another request");
                            continue;
                        }
                    }
                    let done = frame.list_contains("status", "done");
                    frames.push(frame);
                    if done {
                        debug!(id = %id, frames = frames.len(), "Request complete");
                        return Ok(frames);
                    }
                }
                FramePoll::Partial => idle_polls = 0,
                FramePoll::Idle => {
                    idle_polls += 1;
                    if idle_polls >= self.opts.max_idle_polls {
                        debug!(
                            id = %id,
                            idle_polls,
                            frames = frames.len(),
                            "Peer idle, stopping collection"
                        );
                        return Ok(frames);
                    }
                }
                FramePoll::Closed => return Err(WireError::ConnectionClosed),
            }
        }
    }

    /// Evaluate code in the peer's default session.
    pub async fn eval(&mut self, code: &str) -> Result<EvalOutcome, WireError> {
        self.eval_in(code, None, None).await
    }

    /// Evaluate code, optionally in a namespace and a server-side session.
    pub async fn eval_in(
        &mut self,
        code: &str,
        ns: Option<&str>,
        session: Option<&str>,
    ) -> Result<EvalOutcome, WireError> {
        let mut request = WireValue::dict([
            ("op", WireValue::from("eval")),
            ("code", WireValue::from(code)),
        ]);
        if let Some(ns) = ns {
            request.insert("ns", WireValue::from(ns));
        }
        if let Some(session) = session {
            request.insert("session", WireValue::from(session));
        }
        let frames = self.request(request).await?;
        let stdout: String = frames.iter().filter_map(|f| f.get_str("out")).collect();
        let ns = frames
            .iter()
            .find(|f| f.get("value").is_some())
            .and_then(|f| f.get_str("ns"))
            .map(String::from);
        Ok(EvalOutcome {
            result: select_result(&frames),
            stdout,
            ns,
            frames,
        })
    }

    /// Ask the peer for a new server-side session and return its id.
    pub async fn clone_session(&mut self) -> Result<String, WireError> {
        let frames = self
            .request(WireValue::dict([("op", WireValue::from("clone"))]))
            .await?;
        frames
            .iter()
            .find_map(|f| f.get_str("new-session"))
            .map(String::from)
            .ok_or_else(|| WireError::MalformedFrame("clone reply lacks new-session".into()))
    }

    /// Close a server-side session.
    pub async fn close_session(&mut self, session: &str) -> Result<(), WireError> {
        self.request(WireValue::dict([
            ("op", WireValue::from("close")),
            ("session", WireValue::from(session)),
        ]))
        .await?;
        Ok(())
    }

    /// Ask the peer to describe its supported operations.
    pub async fn describe(&mut self) -> Result<WireValue, WireError> {
        let frames = self
            .request(WireValue::dict([("op", WireValue::from("describe"))]))
            .await?;
        frames
            .into_iter()
            .next()
            .ok_or_else(|| WireError::MalformedFrame("empty describe reply".into()))
    }
}

/// Open a connection to `host:port`, evaluate `code`, and close it again.
pub async fn evaluate(
    ids: Arc<MessageIdGenerator>,
    code: &str,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<EvalResult, WireError> {
    let opts = SessionOptions::default().with_timeout(timeout);
    let mut session = ProtocolSession::connect(&format!("{host}:{port}"), ids, opts).await?;
    let outcome = session.eval(code).await?;
    info!(
        peer = %session.peer_addr(),
        frames = outcome.frames.len(),
        "Evaluation finished"
    );
    Ok(outcome.result)
}
