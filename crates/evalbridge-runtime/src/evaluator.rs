//! Code evaluation collaborators.

use async_trait::async_trait;
use evalbridge_wire::session::{EvalResult, ProtocolSession, SessionOptions};
use evalbridge_wire::MessageIdGenerator;
use std::sync::Arc;
use tracing::debug;

/// Evaluates source text in some runtime and returns the printed result.
#[async_trait]
pub trait LocalEvaluator: Send + Sync + 'static {
    /// Evaluate `code`. `Err` carries the runtime's error text.
    async fn evaluate(&self, code: &str) -> Result<String, String>;
}

/// Evaluates code on a bencode protocol peer, one connection per call.
pub struct NreplEvaluator {
    addr: String,
    ids: Arc<MessageIdGenerator>,
    opts: SessionOptions,
}

impl NreplEvaluator {
    pub fn new(addr: impl Into<String>, ids: Arc<MessageIdGenerator>, opts: SessionOptions) -> Self {
        Self {
            addr: addr.into(),
            ids,
            opts,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl LocalEvaluator for NreplEvaluator {
    async fn evaluate(&self, code: &str) -> Result<String, String> {
        let mut session = ProtocolSession::connect(&self.addr, Arc::clone(&self.ids), self.opts.clone())
            .await
            .map_err(|e| format!("cannot reach evaluator at {}: {e}", self.addr))?;
        let outcome = session.eval(code).await.map_err(|e| e.to_string())?;
        debug!(
            peer = %session.peer_addr(),
            frames = outcome.frames.len(),
            stdout_bytes = outcome.stdout.len(),
            "Evaluated on protocol peer"
        );
        match outcome.result {
            EvalResult::Value(value) => Ok(value),
            EvalResult::Error(err) => Err(err),
            EvalResult::NoValue => Err("evaluator returned no value".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalbridge_wire::frame::{write_frame, FrameReader};
    use evalbridge_wire::WireValue;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Peer that answers every eval with a fixed value or error.
    async fn spawn_fixed_peer(reply: WireValue) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = FrameReader::new(read_half);
                    while let Ok(request) = reader.read_frame().await {
                        let id = request.get_str("id").unwrap_or("").to_string();
                        let mut frame = reply.clone();
                        frame.insert("id", WireValue::from(id.as_str()));
                        write_frame(&mut write_half, &frame).await.unwrap();
                        let done = WireValue::dict([
                            ("id", WireValue::from(id.as_str())),
                            ("status", WireValue::from(vec!["done".to_string()])),
                        ]);
                        write_frame(&mut write_half, &done).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    fn opts() -> SessionOptions {
        SessionOptions::default().with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_value_is_returned() {
        let addr = spawn_fixed_peer(WireValue::dict([("value", WireValue::from("6"))])).await;
        let evaluator = NreplEvaluator::new(addr, Arc::new(MessageIdGenerator::new()), opts());
        assert_eq!(evaluator.evaluate("(+ 1 2 3)").await.unwrap(), "6");
    }

    #[tokio::test]
    async fn test_error_is_returned() {
        let addr = spawn_fixed_peer(WireValue::dict([("err", WireValue::from("Divide by zero"))])).await;
        let evaluator = NreplEvaluator::new(addr, Arc::new(MessageIdGenerator::new()), opts());
        let err = evaluator.evaluate("(/ 1 0)").await.unwrap_err();
        assert!(err.contains("Divide by zero"));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let evaluator = NreplEvaluator::new(addr, Arc::new(MessageIdGenerator::new()), opts());
        let err = evaluator.evaluate("1").await.unwrap_err();
        assert!(err.contains("cannot reach evaluator"));
    }
}
