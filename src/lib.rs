//! Controller service for a classroom LLM security lab.
//!
//! Launches attack and defense demos as external programs, streams their
//! output into bounded per-source logs, recomputes security metrics after
//! every run, and pushes all of it to live viewers over server-sent events.

pub mod cli;
pub mod engine;
pub mod error;
pub mod events;
pub mod logs;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod server;
pub mod services;
pub mod settings;
mod text_summary;
