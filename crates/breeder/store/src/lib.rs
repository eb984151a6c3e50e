//! Breeder entity store.
//!
//! Transactional CRUD over the discovery data model:
//! - populations and their numbered generations
//! - systems with parentage and late-bound fitness/descriptor/cluster fields
//! - clusters plus the per-generation cluster assignment snapshot
//! - meetings, agents and chats created while candidates run
//!
//! Every creation or update is durable when the call returns and writers are
//! serialised at the store boundary. `InMemoryStore` is the reference
//! implementation; `SqliteStore` persists runs so they can be resumed.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod retry;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use retry::retry_on_conflict;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use traits::{ClusterStore, EntityStore, InteractionStore, PopulationStore, SystemStore};
