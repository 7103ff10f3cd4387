//! Step execution engine.
//!
//! Runs an ordered list of idempotent steps from the first one on every
//! reconcile. Each step decides from live cluster state whether its work is
//! already done; the conditions written here are an audit trail only.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, Span, error, info, info_span};

use crate::crd::{UpgradeHistory, UpgradePhase};
use crate::status::{set_condition_complete, set_condition_in_progress, set_condition_start};

/// One named checkpoint of an upgrade.
#[async_trait]
pub trait UpgradeStep: Send + Sync {
    /// Condition type recorded for this step.
    fn name(&self) -> String;

    /// Returns true when the step's work is done.
    ///
    /// `history` is the current attempt; steps may stamp timestamps on it.
    async fn run(&self, history: &mut UpgradeHistory) -> Result<bool>;
}

/// How far a pass got when no step failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Every step is done.
    Completed,
    /// The named step is not done yet; later steps did not run.
    InProgress(String),
}

impl StepOutcome {
    pub const fn phase(&self) -> UpgradePhase {
        match self {
            Self::Completed => UpgradePhase::Upgraded,
            Self::InProgress(_) => UpgradePhase::Upgrading,
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::InProgress(step) => write!(f, "{step} in progress"),
        }
    }
}

/// Run `steps` in order, recording a condition per step on `history`.
///
/// Stops at the first step that is not done or that fails. A failure leaves
/// the step's condition incomplete with the error as message and is returned
/// to the caller, which still persists `history`.
pub async fn run_steps(
    steps: &[Box<dyn UpgradeStep + '_>],
    history: &mut UpgradeHistory,
    span: &Span,
    now: DateTime<Utc>,
) -> Result<StepOutcome> {
    for step in steps {
        let name = step.name();
        let step_span = info_span!(parent: span, "step", step = %name);
        info!(parent: &step_span, "running step {}", name);
        set_condition_start(history, &name, now);

        match step.run(history).instrument(step_span.clone()).await {
            Err(e) => {
                error!(parent: &step_span, error = %e, "error when {}", name);
                set_condition_in_progress(history, &name, &format!("{e:#}"), now);
                return Err(e);
            }
            Ok(false) => {
                info!(parent: &step_span, "{} not done, skip following steps", name);
                set_condition_in_progress(history, &name, &format!("{name} still in progress"), now);
                return Ok(StepOutcome::InProgress(name));
            }
            Ok(true) => set_condition_complete(history, &name, now),
        }
    }
    Ok(StepOutcome::Completed)
}
