//! Deployment orchestration core for Labforge.
//!
//! The [`plan`] module turns a validated configuration into an ordered,
//! step-numbered stage list with a frozen total; the [`executor`] drives it
//! through a resumable execution window, provisioning compute units and
//! running their actions in order. The [`action`] module defines the unit
//! of remote work and the name lookup registry; [`verify`] probes service
//! ports once the window closes.

pub mod action;
pub mod executor;
pub mod plan;
pub mod signal;
pub mod verify;

pub use action::{Action, ActionContext, ActionFactory, ActionRegistry, Capability};
pub use executor::{ExecState, Executor, RunReport};
pub use plan::{DeployPlan, Stage, StageKind, Window};
pub use signal::{install_signal_handler, shutdown_requested};
pub use verify::{probe_services, ProbeFailure};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid window [{start}, {end}]: plan has {total} steps")]
    InvalidWindow {
        start: usize,
        end: usize,
        total: usize,
    },
    #[error("required unit '{0}' not found in configuration")]
    MissingUnit(String),
    #[error(
        "unit '{unit}' does not exist but its creation step {step} is before the window; \
         rerun with an earlier --start-step"
    )]
    MissingOnResume { unit: String, step: usize },
    #[error("unknown action '{name}'; available actions: {available}")]
    UnknownAction { name: String, available: String },
    #[error("action name '{name}' is ambiguous; candidates: {candidates}")]
    AmbiguousAction { name: String, candidates: String },
    #[error("step {step} failed in stage '{stage}' ({operation}): {detail}")]
    Step {
        stage: String,
        step: usize,
        operation: String,
        detail: String,
    },
    #[error("shutdown requested, stopped before step {0}")]
    Interrupted(usize),
    #[error("service probes failed on a full run:\n{0}")]
    ProbesFailed(String),
}
