//! Executes requests addressed to this node.

use crate::evaluator::LocalEvaluator;
use crate::fs::FileSystem;
use crate::process::ProcessRunner;
use evalbridge_types::envelope::{OperationKind, Payload, RequestEnvelope, ResponseEnvelope};
use evalbridge_types::error::BridgeError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Runs one request against the local collaborators and always produces a
/// response, success or error.
#[derive(Clone)]
pub struct RemoteEvaluator {
    evaluator: Arc<dyn LocalEvaluator>,
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn ProcessRunner>,
}

impl RemoteEvaluator {
    pub fn new(
        evaluator: Arc<dyn LocalEvaluator>,
        fs: Arc<dyn FileSystem>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            evaluator,
            fs,
            runner,
        }
    }

    /// Execute `req` and build its response.
    ///
    /// The work runs on its own task so a panicking collaborator is reported
    /// as an error response instead of taking the caller down.
    pub async fn execute(&self, req: RequestEnvelope) -> ResponseEnvelope {
        let id = req.id.clone();
        let started = Instant::now();
        let this = self.clone();
        let result = match tokio::spawn(async move { this.run(&req).await }).await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::EvaluationFault(format!("operation aborted: {e}"))),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                debug!(id = %id, elapsed_ms, "Request succeeded");
                ResponseEnvelope::success(id, value, elapsed_ms)
            }
            Err(e) => {
                warn!(id = %id, elapsed_ms, error = %e, "Request failed");
                ResponseEnvelope::error(id, e.to_string()).with_elapsed(elapsed_ms)
            }
        }
    }

    async fn run(&self, req: &RequestEnvelope) -> Result<String, BridgeError> {
        match req.kind()? {
            OperationKind::Eval => self
                .evaluator
                .evaluate(&req.code.to_text())
                .await
                .map_err(BridgeError::EvaluationFault),
            OperationKind::FileRead => {
                let path = match &req.code {
                    Payload::Text(path) => path.clone(),
                    Payload::Args(args) => args.first().cloned().unwrap_or_default(),
                };
                self.fs
                    .read(&path)
                    .await
                    .map_err(BridgeError::EvaluationFault)
            }
            OperationKind::FileWrite => {
                let (path, contents) = match &req.code {
                    Payload::Args(args) if args.len() == 2 => (&args[0], &args[1]),
                    _ => {
                        return Err(BridgeError::EvaluationFault(
                            "file-write expects [path, contents]".to_string(),
                        ))
                    }
                };
                let written = self
                    .fs
                    .write(path, contents)
                    .await
                    .map_err(BridgeError::EvaluationFault)?;
                Ok(written.to_string())
            }
            OperationKind::Shell => {
                let args = req.code.to_args();
                let Some((cmd, rest)) = args.split_first() else {
                    return Err(BridgeError::EvaluationFault("shell expects a command".to_string()));
                };
                let output = self
                    .runner
                    .run(cmd, rest)
                    .await
                    .map_err(BridgeError::EvaluationFault)?;
                if output.success() {
                    Ok(output.stdout)
                } else {
                    let status = output
                        .exit_code
                        .map(|c| format!("exit code {c}"))
                        .unwrap_or_else(|| "a signal".to_string());
                    Err(BridgeError::EvaluationFault(format!(
                        "'{cmd}' terminated with {status}: {}",
                        output.stderr.trim_end()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::process::{LocalProcessRunner, ProcessOutput};
    use async_trait::async_trait;
    use evalbridge_types::envelope::{Direction, ResponseStatus};

    /// Sums `(+ a b ...)` and fails on `(/ x 0)`; panics on `(panic)`.
    pub(crate) struct ArithEvaluator;

    #[async_trait]
    impl LocalEvaluator for ArithEvaluator {
        async fn evaluate(&self, code: &str) -> Result<String, String> {
            let inner = code.trim().trim_start_matches('(').trim_end_matches(')');
            let mut parts = inner.split_whitespace();
            match parts.next() {
                Some("+") => {
                    let sum: i64 = parts.map(|p| p.parse::<i64>().unwrap_or(0)).sum();
                    Ok(sum.to_string())
                }
                Some("/") if inner.ends_with(" 0") => Err("Divide by zero".to_string()),
                Some("panic") => panic!("evaluator blew up"),
                _ => Err(format!("cannot evaluate {code}")),
            }
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl ProcessRunner for FailingRunner {
        async fn run(&self, _cmd: &str, _args: &[String]) -> Result<ProcessOutput, String> {
            Ok(ProcessOutput {
                exit_code: Some(2),
                stdout: String::new(),
                stderr: "no such file\n".to_string(),
            })
        }
    }

    pub(crate) fn evaluator_with_root(root: &std::path::Path) -> RemoteEvaluator {
        RemoteEvaluator::new(
            Arc::new(ArithEvaluator),
            Arc::new(LocalFs::confined(root)),
            Arc::new(LocalProcessRunner::default()),
        )
    }

    fn request(op: OperationKind, code: impl Into<Payload>) -> RequestEnvelope {
        RequestEnvelope::new("r-1", Direction::ToLocal, op, code)
    }

    #[tokio::test]
    async fn test_eval_success() {
        let dir = tempfile::tempdir().unwrap();
        let resp = evaluator_with_root(dir.path())
            .execute(request(OperationKind::Eval, "(+ 1 2 3)"))
            .await;
        assert_eq!(resp.status, ResponseStatus::Success);
        assert_eq!(resp.value.as_deref(), Some("6"));
        assert!(resp.execution_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_eval_fault_is_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let resp = evaluator_with_root(dir.path())
            .execute(request(OperationKind::Eval, "(/ 1 0)"))
            .await;
        assert_eq!(resp.status, ResponseStatus::Error);
        assert!(resp.error.unwrap().contains("Divide by zero"));
    }

    #[tokio::test]
    async fn test_panic_is_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let resp = evaluator_with_root(dir.path())
            .execute(request(OperationKind::Eval, "(panic)"))
            .await;
        assert_eq!(resp.status, ResponseStatus::Error);
        assert_eq!(resp.id, "r-1");
    }

    #[tokio::test]
    async fn test_unknown_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(OperationKind::Eval, "");
        req.op = "frobnicate".to_string();
        let resp = evaluator_with_root(dir.path()).execute(req).await;
        assert_eq!(resp.status, ResponseStatus::Error);
        assert!(resp.error.unwrap().contains("frobnicate"));
    }

    #[tokio::test]
    async fn test_file_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let remote = evaluator_with_root(dir.path());
        let resp = remote
            .execute(request(
                OperationKind::FileWrite,
                vec!["out.txt".to_string(), "abc".to_string()],
            ))
            .await;
        assert_eq!(resp.value.as_deref(), Some("3"));

        let resp = remote.execute(request(OperationKind::FileRead, "out.txt")).await;
        assert_eq!(resp.value.as_deref(), Some("abc"));

        let resp = remote
            .execute(request(OperationKind::FileRead, vec!["out.txt".to_string()]))
            .await;
        assert_eq!(resp.value.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_file_write_needs_two_args() {
        let dir = tempfile::tempdir().unwrap();
        let resp = evaluator_with_root(dir.path())
            .execute(request(OperationKind::FileWrite, "out.txt"))
            .await;
        assert_eq!(resp.status, ResponseStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_stdout_is_value() {
        let dir = tempfile::tempdir().unwrap();
        let resp = evaluator_with_root(dir.path())
            .execute(request(OperationKind::Shell, "echo hi"))
            .await;
        assert_eq!(resp.status, ResponseStatus::Success);
        assert_eq!(resp.value.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit_carries_stderr() {
        let remote = RemoteEvaluator::new(
            Arc::new(ArithEvaluator),
            Arc::new(LocalFs::new()),
            Arc::new(FailingRunner),
        );
        let resp = remote.execute(request(OperationKind::Shell, "ls missing")).await;
        assert_eq!(resp.status, ResponseStatus::Error);
        let error = resp.error.unwrap();
        assert!(error.contains("exit code 2"));
        assert!(error.contains("no such file"));
    }

    #[tokio::test]
    async fn test_shell_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let resp = evaluator_with_root(dir.path())
            .execute(request(OperationKind::Shell, "   "))
            .await;
        assert_eq!(resp.status, ResponseStatus::Error);
    }
}
