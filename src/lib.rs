//! Staged workflow orchestration.
//!
//! A run threads one [`StateDocument`](engine::StateDocument) through a graph
//! of stages. Each stage runs under a retry policy, a router picks the next
//! stage from the accumulated state, and a successful run's final artifact is
//! fanned out to delivery channels concurrently.

pub mod config;
pub mod delivery;
pub mod demo;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod router;
pub mod stage;
pub mod ui;

pub use engine::{Engine, EngineBuilder, RunResult, RunStatus, StateDocument};
pub use errors::{ConfigError, RunFailure, StageError};
pub use stage::{FnStage, Stage, StageContext};
