use crate::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use breeder_types::{System, SystemId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Default wall-clock limit for one task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(180);
/// Wall-clock limit for the generator's debug probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(720);

/// The parts of a system record needed to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateProgram {
    pub system_id: SystemId,
    pub name: String,
    pub code: String,
}

impl CandidateProgram {
    pub fn new(system_id: SystemId, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system_id,
            name: name.into(),
            code: code.into(),
        }
    }
}

impl From<&System> for CandidateProgram {
    fn from(system: &System) -> Self {
        Self::new(system.id, system.name.clone(), system.code.clone())
    }
}

/// Arguments of the candidate's entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInput {
    pub task: String,
    pub answer_format: String,
}

impl TaskInput {
    pub fn new(task: impl Into<String>, answer_format: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            answer_format: answer_format.into(),
        }
    }
}

/// Runs a candidate program once against one task.
#[async_trait]
pub trait CandidateExecutor: Send + Sync {
    async fn run(
        &self,
        program: &CandidateProgram,
        input: &TaskInput,
        deadline: Duration,
    ) -> RuntimeResult<String>;
}

/// Reject answers that are a mapping or a tuple rendered as text.
///
/// List-shaped text stays valid: trace answers are written as nested lists.
pub fn check_answer_shape(answer: String) -> RuntimeResult<String> {
    let trimmed = answer.trim();
    let mapping = trimmed.starts_with('{')
        && matches!(
            serde_json::from_str::<serde_json::Value>(trimmed),
            Ok(serde_json::Value::Object(_))
        );
    let tuple_like = trimmed.starts_with('(') && trimmed.ends_with(')') && trimmed.contains(',');
    if mapping || tuple_like {
        return Err(RuntimeError::InvalidAnswerShape(preview(trimmed)));
    }
    Ok(answer)
}

/// Whether a probe answer is usable: not a mapping or tuple, and not
/// starting with "error" (case-insensitive).
pub fn is_well_formed_answer(answer: &str) -> bool {
    let head: String = answer.trim_start().chars().take(5).collect();
    !head.eq_ignore_ascii_case("error") && check_answer_shape(answer.to_string()).is_ok()
}

pub(crate) fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(120).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

type Script = dyn Fn(&CandidateProgram, &TaskInput) -> RuntimeResult<String> + Send + Sync;

/// Executor that answers from a closure, for tests and dry runs.
pub struct ScriptedExecutor {
    script: Box<Script>,
    runs: AtomicUsize,
}

impl ScriptedExecutor {
    /// Every run calls `script` with the program and its input.
    /// Answers still go through the shape check of real runs.
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CandidateProgram, &TaskInput) -> RuntimeResult<String> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            runs: AtomicUsize::new(0),
        }
    }

    /// Every run returns `answer`.
    pub fn constant(answer: impl Into<String>) -> Self {
        let answer = answer.into();
        Self::new(move |_, _| Ok(answer.clone()))
    }

    /// Runs started so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateExecutor for ScriptedExecutor {
    async fn run(
        &self,
        program: &CandidateProgram,
        input: &TaskInput,
        _deadline: Duration,
    ) -> RuntimeResult<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.script)(program, input).and_then(check_answer_shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_are_rejected() {
        assert!(check_answer_shape(r#"{"answer": "A"}"#.into()).is_err());
        assert!(check_answer_shape("('A', 'because')".into()).is_err());
    }

    #[test]
    fn plain_answers_pass() {
        for answer in ["A", "(B) incorrect", "[[1,2],[2,1]]", "{not json", "42"] {
            assert_eq!(check_answer_shape(answer.into()).unwrap(), answer);
        }
    }

    #[test]
    fn error_answers_are_not_well_formed() {
        assert!(!is_well_formed_answer("Error: boom"));
        assert!(!is_well_formed_answer("  error while solving"));
        assert!(!is_well_formed_answer("{\"a\": 1}"));
        assert!(is_well_formed_answer("A"));
        assert!(is_well_formed_answer("Err"));
    }

    #[tokio::test]
    async fn scripted_executor_counts_runs() {
        let executor = ScriptedExecutor::constant("A");
        let program = CandidateProgram::new(SystemId::generate(), "x", "code");
        let input = TaskInput::new("q", "letter");
        assert_eq!(
            executor
                .run(&program, &input, DEFAULT_TASK_TIMEOUT)
                .await
                .unwrap(),
            "A"
        );
        assert_eq!(executor.runs(), 1);
    }
}
