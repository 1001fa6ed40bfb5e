//! crew Core - Shared types for coding agent session orchestration
//!
//! This crate provides the domain types shared between
//! the daemon (crewd) and its clients (crew).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod cache;
pub mod error;
pub mod event;
pub mod history;
pub mod launch;
pub mod project;
pub mod queue;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use cache::{OutputCache, DEFAULT_CACHE_CAPACITY};
pub use error::{DomainError, DomainResult};
pub use event::{EventKind, Outcome, StreamEvent};
pub use history::{StoredProject, StoredSession};
pub use launch::{Intent, LaunchOptions};
pub use project::{normalize_path, validate_project_path, ProjectId, ProjectRef};
pub use queue::{EnqueueOutcome, PromptQueue, QueuedPrompt};
pub use session::{
    is_safe_id, LaunchToken, SessionId, SessionKey, SessionStatus, SessionSummary,
};
pub use sync::{StreamSynchronizer, SyncAction, SyncPhase};
