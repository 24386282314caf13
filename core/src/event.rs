//! The run event log.
//!
//! RULE: Every state change of a simulation run is recorded as a `RunEvent`,
//! in the order it happened. The log is append-only.

use crate::types::{RunId, RuleId, ScenarioId};
use serde::{Deserialize, Serialize};

/// Every event emitted during a simulation run.
/// Variants are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        kind: String,
        scenarios: usize,
        transactions: usize,
        customers: usize,
    },
    ScenarioCompleted {
        scenario_id: ScenarioId,
        alerts: usize,
        skipped_rows: usize,
    },
    ScenarioSkipped {
        scenario_id: ScenarioId,
        reason: String,
    },
    ScenarioFailed {
        scenario_id: ScenarioId,
        kind: String,
        message: String,
    },
    RefinementCompleted {
        rules: usize,
        retained: usize,
        excluded: usize,
    },
    RuleFailed {
        rule_id: RuleId,
        kind: String,
        message: String,
    },
    RunAborted {
        completed: usize,
        total: usize,
    },
    RunCompleted {
        total_alerts: usize,
        excluded_alerts: usize,
        risk_score: Option<f64>,
    },
}

impl RunEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. }          => "run_started",
            RunEvent::ScenarioCompleted { .. }   => "scenario_completed",
            RunEvent::ScenarioSkipped { .. }     => "scenario_skipped",
            RunEvent::ScenarioFailed { .. }      => "scenario_failed",
            RunEvent::RefinementCompleted { .. } => "refinement_completed",
            RunEvent::RuleFailed { .. }          => "rule_failed",
            RunEvent::RunAborted { .. }          => "run_aborted",
            RunEvent::RunCompleted { .. }        => "run_completed",
        }
    }
}

/// A persisted row of the run event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventEntry {
    pub id: Option<i64>,
    pub run_id: RunId,
    pub seq: u32,
    pub event_type: String,
    pub payload: String, // JSON-serialized RunEvent
}

impl RunEventEntry {
    pub fn new(run_id: &str, seq: u32, event: &RunEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id: None,
            run_id: run_id.to_string(),
            seq,
            event_type: event.type_name().to_string(),
            payload: serde_json::to_string(event)?,
        })
    }

    pub fn event(&self) -> serde_json::Result<RunEvent> {
        serde_json::from_str(&self.payload)
    }
}
