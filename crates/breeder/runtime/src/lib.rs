//! Breeder candidate runtime.
//!
//! A candidate is LLM-authored source text defining a class whose `forward`
//! method takes `(task, required_answer_format)` and returns a string. The
//! runtime materialises it in an isolated execution unit that exposes only
//! `Agent`, `Meeting` and `Chat` constructors backed by the entity store, runs
//! it under a wall-clock deadline and shape-checks the answer.
//!
//! [`PythonExecutor`] runs candidates in a `python3` subprocess talking the
//! [`bridge`] protocol. [`ScriptedExecutor`] answers from a closure.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod bridge;
mod error;
mod executor;
mod python;

pub use bridge::{BridgeReply, BridgeSession, CandidateMessage, FailureKind};
pub use error::{RuntimeError, RuntimeResult};
pub use executor::{
    check_answer_shape, is_well_formed_answer, CandidateExecutor, CandidateProgram,
    ScriptedExecutor, TaskInput, DEFAULT_TASK_TIMEOUT, PROBE_TIMEOUT,
};
pub use python::PythonExecutor;
