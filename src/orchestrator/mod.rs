//! Application-level orchestration.
//!
//! This module owns the run lifecycle (per-key state machine and the global
//! exclusive lock) and post-run processing such as summaries and metrics
//! refresh. The HTTP layer calls into the `Controller` facade only.

mod controller;
mod coordinator;
mod post_process;

pub use controller::{Controller, PromptOutcome, PromptRequest, RunOutcome, SettingsView};
pub use coordinator::{RunCoordinator, RunTicket};
pub use post_process::ProcessedRun;
