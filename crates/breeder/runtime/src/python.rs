//! Subprocess execution unit for candidate programs.
//!
//! Each run gets a fresh temporary directory holding the candidate source and
//! the bundled harness, and a fresh [`BridgeSession`]. The child is killed
//! when the deadline elapses or the run is dropped.

use crate::bridge::{BridgeSession, CandidateMessage, FailureKind};
use crate::executor::{check_answer_shape, preview, CandidateExecutor, CandidateProgram, TaskInput};
use crate::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use breeder_gateway::Gateway;
use breeder_store::InteractionStore;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

const HARNESS: &str = include_str!("../assets/harness.py");
const STDERR_TAIL: usize = 2_000;

/// Runs candidates with a Python interpreter.
pub struct PythonExecutor {
    interpreter: PathBuf,
    store: Arc<dyn InteractionStore>,
    gateway: Gateway,
    model: String,
}

impl PythonExecutor {
    /// Executor spawning `interpreter`. Agent calls of the candidate are
    /// answered by `model` and recorded in `store`.
    pub fn new(
        interpreter: impl Into<PathBuf>,
        store: Arc<dyn InteractionStore>,
        gateway: Gateway,
        model: impl Into<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            store,
            gateway,
            model: model.into(),
        }
    }

    /// Whether `interpreter` can be started at all.
    pub async fn interpreter_available(interpreter: &Path) -> bool {
        Command::new(interpreter)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn spawn(&self, workdir: &Path) -> RuntimeResult<Child> {
        let stderr = std::fs::File::create(workdir.join("stderr.log"))
            .map_err(|e| RuntimeError::Launch(format!("stderr log: {e}")))?;
        Command::new(&self.interpreter)
            .arg("-u")
            .arg(workdir.join("harness.py"))
            .arg(workdir.join("candidate.py"))
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::Launch(format!("{}: {e}", self.interpreter.display()))
            })
    }

    async fn drive(
        &self,
        child: &mut Child,
        session: &BridgeSession,
        input: &TaskInput,
        workdir: &Path,
    ) -> RuntimeResult<String> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Launch("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Launch("child stdout unavailable".into()))?;

        let config = json!({ "task": input.task, "answer_format": input.answer_format });
        write_line(&mut stdin, &config).await?;

        let mut lines = BufReader::new(stdout).lines();
        let mut in_flight = FuturesUnordered::new();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.map_err(|e| RuntimeError::Protocol(e.to_string()))?;
                    let Some(line) = line else {
                        return Err(exited_early(child, workdir).await);
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message: CandidateMessage = serde_json::from_str(&line)
                        .map_err(|e| RuntimeError::Protocol(format!("{e}: {}", preview(&line))))?;
                    match message {
                        CandidateMessage::Done { answer } => return finish(answer),
                        CandidateMessage::Failed { kind, message } => {
                            return Err(match kind {
                                FailureKind::Shape => RuntimeError::InvalidAnswerShape(message),
                                FailureKind::Error | FailureKind::Load => {
                                    RuntimeError::CandidateError(message)
                                }
                            });
                        }
                        call if call.is_slow() => in_flight.push(session.handle(call)),
                        call => {
                            if let Some(reply) = session.handle(call).await {
                                write_line(&mut stdin, &reply).await?;
                            }
                        }
                    }
                }
                Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(reply) = reply {
                        write_line(&mut stdin, &reply).await?;
                    }
                }
            }
        }
    }
}

/// Explain a child that closed its protocol stream without a terminal message.
async fn exited_early(child: &mut Child, workdir: &Path) -> RuntimeError {
    let status = child.wait().await.ok();
    let stderr = tokio::fs::read_to_string(workdir.join("stderr.log"))
        .await
        .unwrap_or_default();
    let chars: Vec<char> = stderr.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(STDERR_TAIL)..].iter().collect();
    debug!(?status, stderr = %tail, "candidate exited without an answer");
    let last_line = tail
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("process exited without an answer");
    RuntimeError::CandidateError(last_line.trim().to_string())
}

fn finish(answer: Value) -> RuntimeResult<String> {
    match answer {
        Value::String(text) => check_answer_shape(text),
        other => Err(RuntimeError::InvalidAnswerShape(preview(&other.to_string()))),
    }
}

async fn write_line<T: serde::Serialize>(stdin: &mut ChildStdin, value: &T) -> RuntimeResult<()> {
    let mut line =
        serde_json::to_string(value).map_err(|e| RuntimeError::Protocol(e.to_string()))?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| RuntimeError::Protocol(format!("write to candidate failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| RuntimeError::Protocol(format!("write to candidate failed: {e}")))
}

#[async_trait]
impl CandidateExecutor for PythonExecutor {
    async fn run(
        &self,
        program: &CandidateProgram,
        input: &TaskInput,
        deadline: Duration,
    ) -> RuntimeResult<String> {
        let workdir = tempfile::Builder::new()
            .prefix("breeder-candidate-")
            .tempdir()
            .map_err(|e| RuntimeError::Launch(format!("temp dir: {e}")))?;
        std::fs::write(workdir.path().join("harness.py"), HARNESS)
            .and_then(|_| std::fs::write(workdir.path().join("candidate.py"), &program.code))
            .map_err(|e| RuntimeError::Launch(format!("write candidate: {e}")))?;

        let session = BridgeSession::new(
            program.system_id,
            self.store.clone(),
            self.gateway.clone(),
            self.model.clone(),
        );
        let mut child = self.spawn(workdir.path())?;

        let outcome = tokio::time::timeout(deadline, self.drive(&mut child, &session, input, workdir.path())).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(system_id = %program.system_id, name = %program.name, "candidate timed out");
                Err(RuntimeError::CandidateTimeout { limit: deadline })
            }
        };
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "candidate already exited");
        }
        let _ = child.wait().await;
        drop(workdir);
        result
    }
}
