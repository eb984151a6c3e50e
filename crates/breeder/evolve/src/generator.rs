//! LLM-driven mutation and crossover of systems.
//!
//! One generation step samples parents from the elite set, asks the model for
//! a new system, runs the reflexion rounds, then probes the result on a
//! validation sample and feeds failures back to the model until the probe
//! passes or the revision budget is spent.

use crate::config::RunConfig;
use crate::prompts;
use crate::seeds::SEEDS;
use crate::{EvolveError, EvolveResult};
use breeder_bench::{Benchmark, Sample};
use breeder_gateway::{text_field, ChatMessage, Gateway, ResponseSchema, StructuredReply};
use breeder_runtime::{
    is_well_formed_answer, CandidateExecutor, CandidateProgram, TaskInput, PROBE_TIMEOUT,
};
use breeder_store::{retry_on_conflict, EntityStore};
use breeder_types::{capability_order, NewSystem, PopulationId, System, SystemId, SystemUpdate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a draft relates to its parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// No parent; used to bootstrap an empty archive.
    Base,
    Mutate,
    Crossover,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Base => "base",
            Operator::Mutate => "mutate",
            Operator::Crossover => "crossover",
        }
    }
}

/// Model and refinement settings of the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    pub model: String,
    pub temperature: f64,
    pub reflexion_rounds: u32,
    /// Revisions allowed after a failed probe.
    pub debug_max: u32,
    pub safety: bool,
    pub probe_timeout: Duration,
}

impl From<&RunConfig> for GeneratorSettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            model: run.model.clone(),
            temperature: run.temperature,
            reflexion_rounds: run.reflexion_rounds,
            debug_max: run.debug_max,
            safety: run.safety,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

/// A proposal parsed from a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub thought: String,
    pub name: String,
    pub code: String,
}

impl Proposal {
    fn from_reply(reply: &StructuredReply) -> Self {
        Self {
            thought: text_field(reply, "thought"),
            name: sanitize_name(&text_field(reply, "name")),
            code: strip_code_fences(&text_field(reply, "code")),
        }
    }
}

/// Parents and instruction of one generation step.
#[derive(Debug, Clone)]
pub struct Plan {
    pub operator: Operator,
    pub parents: Vec<System>,
    pub instruction: String,
}

/// Proposes new drafts from elite parents.
///
/// Each proposal goes through the reflexion rounds, then runs on the probe
/// sample and is revised until it answers or the debug budget is spent.
pub struct Generator {
    store: Arc<dyn EntityStore>,
    gateway: Gateway,
    executor: Arc<dyn CandidateExecutor>,
    benchmark: Benchmark,
    probe: Sample,
    settings: GeneratorSettings,
    rng: Mutex<StdRng>,
}

impl Generator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        gateway: Gateway,
        executor: Arc<dyn CandidateExecutor>,
        benchmark: Benchmark,
        probe: Sample,
        settings: GeneratorSettings,
        seed: u64,
    ) -> Self {
        Self {
            store,
            gateway,
            executor,
            benchmark,
            probe,
            settings,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pick an operator and its parents: `mutate`, `mutate` or `crossover`
    /// with equal probability, `base` when there are no elites.
    pub fn plan(&self, elites: &[System]) -> Plan {
        let mut rng = self.rng();
        if elites.is_empty() {
            return Plan {
                operator: Operator::Base,
                parents: Vec::new(),
                instruction: prompts::BASE_OPERATOR.to_string(),
            };
        }
        let operator = match rng.gen_range(0..3) {
            2 if elites.len() >= 2 => Operator::Crossover,
            _ => Operator::Mutate,
        };
        match operator {
            Operator::Crossover => Plan {
                operator,
                parents: elites.choose_multiple(&mut *rng, 2).cloned().collect(),
                instruction: prompts::CROSSOVER_OPERATOR.to_string(),
            },
            _ => {
                let parent = elites.choose(&mut *rng).cloned();
                let instruction = prompts::MUTATION_OPERATORS
                    .choose(&mut *rng)
                    .copied()
                    .unwrap_or(prompts::MUTATION_OPERATORS[0]);
                Plan {
                    operator: Operator::Mutate,
                    parents: parent.into_iter().collect(),
                    instruction: instruction.to_string(),
                }
            }
        }
    }

    fn opening(&self, plan: &Plan, archive: &[System]) -> Vec<ChatMessage> {
        let mut archive = archive.to_vec();
        archive.sort_by(capability_order);
        let system = prompts::base_prompt(&archive, &SEEDS[0], self.benchmark, self.settings.safety);
        let user = match plan.parents.as_slice() {
            [first, second] => prompts::crossover_message(first, second),
            [parent] => prompts::mutation_message(parent, &plan.instruction),
            _ => prompts::base_message(),
        };
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    fn proposal_schema() -> ResponseSchema {
        ResponseSchema::new()
            .field("thought", "Your reasoning and the overall concept behind the design.")
            .field("name", "The name of the system.")
            .field("code", "The complete Python class of the system, with its async forward method.")
    }

    fn revision_schema() -> ResponseSchema {
        ResponseSchema::new()
            .field("reflection", "Your reflection on the previous proposal.")
            .field("thought", "Your reasoning and the overall concept behind the design.")
            .field("name", "The name of the system.")
            .field("code", "The complete Python class of the system, with its async forward method.")
    }

    async fn ask(
        &self,
        messages: &mut Vec<ChatMessage>,
        schema: &ResponseSchema,
    ) -> EvolveResult<Proposal> {
        let reply = self
            .gateway
            .structured_chat(messages, schema, &self.settings.model, self.settings.temperature)
            .await?;
        messages.push(ChatMessage::assistant(
            serde_json::Value::Object(reply.clone()).to_string(),
        ));
        Ok(Proposal::from_reply(&reply))
    }

    /// Run the candidate once on the probe sample.
    ///
    /// Returns the error text shown to the model when the probe fails.
    pub async fn probe(&self, proposal: &Proposal) -> Result<String, String> {
        let program = CandidateProgram::new(SystemId::generate(), &proposal.name, &proposal.code);
        let input = TaskInput::new(self.benchmark.prompt(&self.probe), self.benchmark.answer_format());
        match self
            .executor
            .run(&program, &input, self.settings.probe_timeout)
            .await
        {
            Ok(answer) if is_well_formed_answer(&answer) => Ok(answer),
            Ok(answer) => Err(format!(
                "Error: the system returned {answer:?}, which is not a valid answer string"
            )),
            Err(e) => Err(e.as_answer()),
        }
    }

    /// Produce and persist one draft system.
    pub async fn generate(
        &self,
        population_id: PopulationId,
        elites: &[System],
        archive: &[System],
    ) -> EvolveResult<System> {
        let plan = self.plan(elites);
        debug!(operator = plan.operator.as_str(), parents = plan.parents.len(), "generating");

        let mut messages = self.opening(&plan, archive);
        let mut proposal = self.ask(&mut messages, &Self::proposal_schema()).await?;
        for round in 0..self.settings.reflexion_rounds as usize {
            let instruction = prompts::REFLEXION_ROUNDS[round.min(prompts::REFLEXION_ROUNDS.len() - 1)];
            messages.push(ChatMessage::user(instruction));
            proposal = self.ask(&mut messages, &Self::revision_schema()).await?;
        }

        let mut revisions = 0;
        let answer = loop {
            match self.probe(&proposal).await {
                Ok(answer) => break answer,
                Err(error) if revisions < self.settings.debug_max => {
                    debug!(revision = revisions + 1, %error, "probe failed, asking for a fix");
                    messages.push(ChatMessage::user(prompts::debug_message(&error)));
                    proposal = self.ask(&mut messages, &Self::revision_schema()).await?;
                    revisions += 1;
                }
                Err(error) => {
                    return Err(EvolveError::Generation(format!(
                        "probe still failing after {revisions} revisions: {error}"
                    )))
                }
            }
        };

        let mut parents = plan.parents.iter().map(|p| p.id);
        let new = NewSystem::draft(population_id, &proposal.name, &proposal.code, &proposal.thought)
            .with_parents(parents.next(), parents.next())
            .with_mutation_prompt(&plan.instruction);
        let draft = retry_on_conflict("append system", || self.store.append_system(new.clone())).await?;
        let draft = self
            .store
            .update_system(
                draft.id,
                SystemUpdate::new()
                    .property("operator", json!(plan.operator.as_str()))
                    .property("debug_revisions", json!(revisions))
                    .property("probe_answer", json!(answer)),
            )
            .await?;
        info!(
            system_id = %draft.id,
            name = %draft.name,
            operator = plan.operator.as_str(),
            revisions,
            "draft created"
        );
        Ok(draft)
    }

    /// Run `count` generation steps with at most `workers` in flight.
    ///
    /// Failed steps are logged and dropped.
    pub async fn generate_many(
        &self,
        population_id: PopulationId,
        elites: &[System],
        archive: &[System],
        count: usize,
        workers: usize,
    ) -> Vec<System> {
        use futures::stream::{self, StreamExt};
        use tracing::Instrument;

        stream::iter(0..count)
            .map(|index| {
                let span = tracing::info_span!("candidate", index);
                async move {
                    match self.generate(population_id, elites, archive).await {
                        Ok(draft) => Some(draft),
                        Err(e) => {
                            warn!(error = %e, "candidate discarded");
                            None
                        }
                    }
                }
                .instrument(span)
            })
            .buffer_unordered(workers.max(1))
            .filter_map(futures::future::ready)
            .collect()
            .await
    }
}

/// Keep letters, digits, spaces and hyphens.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '\u{2010}'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "Unnamed System".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Drop a surrounding Markdown code fence, if any.
pub fn strip_code_fences(code: &str) -> String {
    let trimmed = code.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return code.to_string();
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim_end().to_string()
}
