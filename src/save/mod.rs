//! Debounced save orchestration for editable entities.
//!
//! One [`SaveOrchestrator`] per mounted entity turns a stream of local edits
//! into remote saves, falling back to the [`crate::queue::MutationQueue`] when
//! the client is offline or the network fails.

mod handler;
mod orchestrator;
mod state;

pub use handler::{Conflict, RemoteSnapshot, SaveFailure, SaveHandler, Validation};
pub use orchestrator::{Editable, SaveContext, SaveError, SaveOptions, SaveOrchestrator};
pub use state::{SaveNotice, SaveState, SaveStatus};
