use breeder_bench::{
    Benchmark, BootstrapConfig, FilterBounds, Harness, HarnessConfig, LoadOptions, Sample, Split,
    StaticDataset, TaskSpec,
};
use breeder_gateway::{Gateway, HashEmbeddingTransport, RetryPolicy, ScriptedChatTransport};
use breeder_runtime::{CandidateProgram, RuntimeError, ScriptedExecutor};
use breeder_types::SystemId;
use std::sync::Arc;

fn gateway() -> Gateway {
    Gateway::new(
        Arc::new(ScriptedChatTransport::from_replies(vec![])),
        Arc::new(HashEmbeddingTransport::new()),
        RetryPolicy::immediate(0),
    )
}

fn config() -> HarnessConfig {
    HarnessConfig {
        concurrency: 4,
        bootstrap: BootstrapConfig {
            resamples: 2_000,
            seed: Some(1),
            ..BootstrapConfig::default()
        },
        ..HarnessConfig::default()
    }
}

fn samples() -> Vec<Sample> {
    (0..8)
        .map(|i| {
            let target = if i % 2 == 0 { "A" } else { "B" };
            Sample::new(i.to_string(), format!("question {i} wants {target}"), target)
        })
        .collect()
}

#[tokio::test]
async fn accuracy_and_interval_per_task() {
    let executor = Arc::new(ScriptedExecutor::new(|_, input| {
        if input.task.contains("question 7") {
            return Err(RuntimeError::CandidateError("boom".into()));
        }
        assert!(input.answer_format.contains("single letter"));
        Ok(if input.task.ends_with('A') { "A" } else { "B" }.to_string())
    }));
    let harness = Harness::new(executor.clone(), gateway(), "judge", config());

    let dataset = StaticDataset::new("mmlu", samples());
    let loaded = Benchmark::Mmlu
        .load(&dataset, &LoadOptions::new(Split::Validation), &FilterBounds::default())
        .unwrap();
    let program = CandidateProgram::new(SystemId::generate(), "echo", "code");
    let report = harness
        .evaluate(
            std::slice::from_ref(&program),
            &[TaskSpec::new(Benchmark::Mmlu, loaded)],
        )
        .await;

    let task = &report[&program.system_id]["mmlu"];
    assert_eq!(task.sample_size, 8);
    assert_eq!(task.failures, 1);
    assert!((task.accuracy - 7.0 / 8.0).abs() < 1e-12);
    let ci = task.ci.unwrap();
    assert!(ci.lower <= ci.median && ci.median <= ci.upper);
    assert_eq!(executor.runs(), 8);
}

#[tokio::test]
async fn single_sample_has_missing_scores() {
    let harness = Harness::new(
        Arc::new(ScriptedExecutor::constant("A")),
        gateway(),
        "judge",
        config(),
    );
    let program = CandidateProgram::new(SystemId::generate(), "a", "code");
    let report = harness
        .run_task(&program, Benchmark::Gpqa, &samples()[..1])
        .await;
    assert_eq!(report.accuracy, 1.0);
    assert!(report.ci.is_none());
    assert!(report.median().is_none());
}

#[tokio::test]
async fn container_answers_score_zero() {
    let harness = Harness::new(
        Arc::new(ScriptedExecutor::constant(r#"{"answer": "A"}"#)),
        gateway(),
        "judge",
        config(),
    );
    let program = CandidateProgram::new(SystemId::generate(), "dict", "code");
    let report = harness
        .run_task(&program, Benchmark::Mmlu, &samples())
        .await;
    assert_eq!(report.accuracy, 0.0);
    assert_eq!(report.failures, 8);
}

#[tokio::test]
async fn all_failed_samples_leave_scores_missing() {
    let harness = Harness::new(
        Arc::new(ScriptedExecutor::new(|_, _| {
            Err(RuntimeError::CandidateError("boom".into()))
        })),
        gateway(),
        "judge",
        config(),
    );
    let program = CandidateProgram::new(SystemId::generate(), "crash", "code");
    let report = harness
        .run_task(&program, Benchmark::Mmlu, &samples())
        .await;
    assert_eq!(report.failures, 8);
    assert_eq!(report.sample_size, 8);
    assert_eq!(report.accuracy, 0.0);
    assert!(report.ci.is_none());
}

#[tokio::test]
async fn one_successful_sample_leaves_scores_missing() {
    let harness = Harness::new(
        Arc::new(ScriptedExecutor::new(|_, input| {
            if input.task.contains("question 0") {
                Ok("A".to_string())
            } else {
                Err(RuntimeError::CandidateError("boom".into()))
            }
        })),
        gateway(),
        "judge",
        config(),
    );
    let program = CandidateProgram::new(SystemId::generate(), "flaky", "code");
    let report = harness
        .run_task(&program, Benchmark::Mmlu, &samples())
        .await;
    assert_eq!(report.failures, 7);
    assert!((report.accuracy - 1.0 / 8.0).abs() < 1e-12);
    assert!(report.ci.is_none());
    assert!(report.median().is_none());
}
