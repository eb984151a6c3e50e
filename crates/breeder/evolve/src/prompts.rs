//! Prompt corpus for the generator and the illuminator.

use crate::seeds::Seed;
use breeder_bench::Benchmark;
use breeder_types::System;
use serde_json::{json, Value};

const BASE: &str = include_str!("../assets/prompts/base.md");
const REFLEXION_FIRST: &str = include_str!("../assets/prompts/reflexion_1.md");
const REFLEXION_SECOND: &str = include_str!("../assets/prompts/reflexion_2.md");
const DEBUG: &str = include_str!("../assets/prompts/debug.md");
const ILLUMINATOR: &str = include_str!("../assets/prompts/illuminator.md");

/// Instructions applied to a single parent.
pub const MUTATION_OPERATORS: [&str; 6] = [
    "Change the way the agents communicate: restructure which agents share a meeting and \
     in what order they speak, keeping the roles that work.",
    "Add a verification stage: an agent that checks the intermediate answers against the \
     task and sends them back for revision when they fail the check.",
    "Replace the single line of reasoning with several independent attempts at different \
     temperatures and combine them with an explicit aggregation step.",
    "Specialise the agents: give each agent a distinct expert role suited to the benchmark \
     and route sub-problems to the right expert.",
    "Decompose the task: have one agent split the task into sub-questions, solve them \
     separately, and compose the final answer from the partial results.",
    "Simplify the system: remove stages that do not contribute to the answer and spend the \
     saved calls on the stage that matters most.",
];

/// Instruction applied to two parents.
pub const CROSSOVER_OPERATOR: &str =
    "Combine the two systems below into one. Keep the strongest idea of each and make \
     them work together in a single coherent control flow.";

/// Instruction of the parentless bootstrap operator.
pub const BASE_OPERATOR: &str =
    "Propose the next interesting system to try, different from everything in the archive.";

pub const REFLEXION_ROUNDS: [&str; 2] = [REFLEXION_FIRST, REFLEXION_SECOND];

/// Archive entry shown to the model.
pub fn archive_entry(system: &System) -> Value {
    json!({
        "name": system.name,
        "thought": system.rationale,
        "code": system.code,
        "capability": system
            .capability_ci
            .map(|ci| ci.to_string())
            .unwrap_or_else(|| "not evaluated".to_string()),
    })
}

/// The system prompt of a generation conversation.
pub fn base_prompt(archive: &[System], example: &Seed, benchmark: Benchmark, safety: bool) -> String {
    let archive: Vec<Value> = archive.iter().map(archive_entry).collect();
    let archive = serde_json::to_string_pretty(&archive).unwrap_or_else(|_| "[]".to_string());
    let example = json!({
        "thought": example.rationale,
        "name": example.name,
        "code": example.code,
    });
    let example = serde_json::to_string_pretty(&example).unwrap_or_default();
    BASE.replace("[ARCHIVE]", &archive)
        .replace("[EXAMPLE]", &example)
        .replace("[BENCHMARK_DESCRIPTION]", &benchmark_section(benchmark))
        .replace("[SAFETY_DESCRIPTION]", &safety_section(safety))
}

fn benchmark_section(benchmark: Benchmark) -> String {
    format!("# The benchmark\n{}", benchmark.description())
}

fn safety_section(safety: bool) -> String {
    if !safety {
        return String::new();
    }
    format!(
        "# Safety\nSystems are also scored on safety and truthfulness, and both count as much \
         as capability.\n- {}\n- {}",
        Benchmark::SaladData.description(),
        Benchmark::TruthfulQa.description()
    )
}

fn parent_block(label: &str, parent: &System) -> String {
    let entry = serde_json::to_string_pretty(&archive_entry(parent)).unwrap_or_default();
    format!("## {label}\n{entry}")
}

pub fn mutation_message(parent: &System, operator: &str) -> String {
    format!(
        "{}\n\n# Instruction\n{operator}\nApply the instruction to the system above to design \
         the next system.",
        parent_block("Parent system", parent)
    )
}

pub fn crossover_message(first: &System, second: &System) -> String {
    format!(
        "{}\n\n{}\n\n# Instruction\n{CROSSOVER_OPERATOR}",
        parent_block("First parent system", first),
        parent_block("Second parent system", second)
    )
}

pub fn base_message() -> String {
    format!("# Instruction\n{BASE_OPERATOR}")
}

pub fn debug_message(error: &str) -> String {
    DEBUG.replace("[ERROR]", error)
}

pub fn illuminator_system(benchmark: Benchmark) -> String {
    ILLUMINATOR.replace("[BENCHMARK_DESCRIPTION]", &benchmark_section(benchmark))
}

pub fn illuminator_message(candidate: &System, top: &[System]) -> String {
    let candidate = json!({
        "name": candidate.name,
        "thought": candidate.rationale,
        "code": candidate.code,
    });
    let top: Vec<Value> = top.iter().map(archive_entry).collect();
    format!(
        "# Candidate system\n{}\n\n# Top systems of its niche\n{}\n\nIs there at least a 50% \
         chance that the candidate matches or beats the best of them?",
        serde_json::to_string_pretty(&candidate).unwrap_or_default(),
        serde_json::to_string_pretty(&top).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeds::SEEDS;
    use crate::testing::scored;

    #[test]
    fn base_prompt_fills_every_placeholder() {
        let mut parent = scored(Some(0.5), None);
        parent.name = "Tree of Debates".into();
        let prompt = base_prompt(&[parent], &SEEDS[0], Benchmark::Math, true);
        for placeholder in ["[ARCHIVE]", "[EXAMPLE]", "[BENCHMARK_DESCRIPTION]", "[SAFETY_DESCRIPTION]"] {
            assert!(!prompt.contains(placeholder), "{placeholder} left in prompt");
        }
        assert!(prompt.contains("Tree of Debates"));
        assert!(prompt.contains("class ChainOfThought"));
        assert!(prompt.contains("50.0% (50.0%, 50.0%)"));
        assert!(prompt.contains("SALAD"));
    }

    #[test]
    fn safety_section_is_empty_without_safety() {
        let prompt = base_prompt(&[], &SEEDS[0], Benchmark::Mmlu, false);
        assert!(!prompt.contains("SALAD"));
        assert!(prompt.contains("archive of the discovered architectures, best first:\n\n[]"));
    }

    #[test]
    fn debug_message_carries_the_error() {
        assert!(debug_message("Error: KeyError: 'answer'").contains("KeyError"));
    }
}
