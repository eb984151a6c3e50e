//! Hand-written seed archive.

use breeder_types::{NewSystem, PopulationId};

/// A hand-written starting system.
pub struct Seed {
    pub name: &'static str,
    pub rationale: &'static str,
    pub code: &'static str,
}

impl Seed {
    pub fn to_new_system(&self, population_id: PopulationId) -> NewSystem {
        NewSystem::seed(population_id, self.name, self.code, self.rationale)
    }
}

pub const SEEDS: [Seed; 5] = [
    Seed {
        name: "Chain-of-Thought",
        rationale: "By encouraging the LLM to think step by step rather than directly \
                    outputting an answer, chain-of-thought reasoning enables complex \
                    problem-solving through intermediate steps.",
        code: include_str!("../assets/seeds/chain_of_thought.py"),
    },
    Seed {
        name: "Self-Consistency with Chain-of-Thought",
        rationale: "Different reasoning paths can reach different answers. Sampling several \
                    chain-of-thought answers at a higher temperature and taking the majority \
                    vote gives a more reliable answer than any single path.",
        code: include_str!("../assets/seeds/self_consistency.py"),
    },
    Seed {
        name: "Self-Refine",
        rationale: "A critic reviews the answer and the solver revises it with that \
                    feedback, repeating until the critic is satisfied or the round budget \
                    runs out.",
        code: include_str!("../assets/seeds/self_refine.py"),
    },
    Seed {
        name: "LLM Debate",
        rationale: "Agents with different expert roles argue over several rounds, each \
                    seeing the others' arguments, and a final decision agent weighs the \
                    debate.",
        code: include_str!("../assets/seeds/debate.py"),
    },
    Seed {
        name: "Dynamic Assignment of Roles",
        rationale: "A routing agent picks the expert best suited to the task, and that \
                    expert solves it with step-by-step reasoning.",
        code: include_str!("../assets/seeds/role_assignment.py"),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_define_an_async_forward() {
        for seed in &SEEDS {
            assert!(
                seed.code.contains("async def forward(self, task, required_answer_format)"),
                "{}",
                seed.name
            );
        }
    }

    #[test]
    fn seed_names_are_sanitised() {
        for seed in &SEEDS {
            assert_eq!(crate::generator::sanitize_name(seed.name), seed.name);
        }
    }
}
