pub mod config;
pub mod dispatch;
pub mod graph;
pub mod history;
pub mod jobs;
pub mod pipeline;
pub mod queue;
pub mod redact;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod webhook;

pub use types::*;
