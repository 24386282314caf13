//! Entities the pipeline consumes and produces.
//!
//! Transactions and customers are supplied by the ingestion collaborator,
//! already scoped to one upload batch and already TTL-filtered. Alerts are
//! produced by the scenario engine and belong to exactly one run.

use crate::types::{AttributeBag, EntityId, FieldValue, RunId, ScenarioId};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Transactions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: EntityId,
    pub customer_id: EntityId,
    pub timestamp: NaiveDateTime,
    pub amount: f64,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub beneficiary: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<NaiveDateTime>,
    /// Unmapped source columns, preserved verbatim.
    #[serde(default)]
    pub attributes: AttributeBag,
}

impl Transaction {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// Look a field up by name: first the mapped columns, then the open
    /// attribute bag. `None` when the row has no such field.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "transaction_id" => FieldValue::Text(self.transaction_id.clone()),
            "customer_id" => FieldValue::Text(self.customer_id.clone()),
            "amount" | "transaction_amount" => FieldValue::Number(self.amount),
            "narrative" | "transaction_narrative" => FieldValue::Text(self.narrative.clone()),
            "beneficiary" | "beneficiary_name" => FieldValue::Text(self.beneficiary.clone()?),
            "channel" => FieldValue::Text(self.channel.clone()?),
            "transaction_type" => FieldValue::Text(self.transaction_type.clone()?),
            "timestamp" | "transaction_date" => {
                FieldValue::Text(self.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            "batch_id" => FieldValue::Text(self.batch_id.clone()?),
            other => return self.attributes.get(other).filter(|v| !v.is_null()).cloned(),
        };
        Some(value)
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ── Customers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: EntityId,
    #[serde(default)]
    pub name: Option<String>,
    /// Segment / customer type, e.g. "Student", "Retail", "Corporate".
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub annual_income: Option<f64>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub attributes: AttributeBag,
}

impl Customer {
    pub fn new(customer_id: impl Into<EntityId>) -> Self {
        Self {
            customer_id: customer_id.into(),
            name: None,
            segment: None,
            occupation: None,
            annual_income: None,
            batch_id: None,
            expires_at: None,
            attributes: AttributeBag::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "customer_id" => FieldValue::Text(self.customer_id.clone()),
            "name" | "customer_name" => FieldValue::Text(self.name.clone()?),
            "segment" | "customer_type" => FieldValue::Text(self.segment.clone()?),
            "occupation" => FieldValue::Text(self.occupation.clone()?),
            "annual_income" | "income" => FieldValue::Number(self.annual_income?),
            "batch_id" => FieldValue::Text(self.batch_id.clone()?),
            other => return self.attributes.get(other).filter(|v| !v.is_null()).cloned(),
        };
        Some(value)
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Risk-profile flags supplied by the customer collaborator. Optional:
/// a missing profile means "no flags".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerRiskProfile {
    pub customer_id: EntityId,
    #[serde(default)]
    pub is_pep: bool,
    #[serde(default)]
    pub has_adverse_media: bool,
    #[serde(default)]
    pub high_risk_occupation: bool,
    #[serde(default)]
    pub previous_sar_count: u32,
}

/// One entry in the verified-entity whitelist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedEntity {
    pub entity_name: String,
    /// "University", "FinancialInstitution", "CryptoExchange", ...
    pub entity_type: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

// ── Alerts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

impl RiskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskClass::Low => "LOW",
            RiskClass::Medium => "MEDIUM",
            RiskClass::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(RiskClass::Low),
            "MEDIUM" => Some(RiskClass::Medium),
            "HIGH" => Some(RiskClass::High),
            _ => None,
        }
    }
}

/// What made the alert fire: the group, the window and every contributing
/// transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerDetails {
    pub group_key: BTreeMap<String, String>,
    pub method: String,
    pub field: String,
    pub threshold_kind: String,
    pub transaction_count: usize,
    pub transaction_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: EntityId,
    pub scenario_id: ScenarioId,
    pub scenario_name: String,
    pub customer_id: EntityId,
    /// First day of the aggregation window.
    pub window_start: NaiveDate,
    /// End of the aggregation window in which the threshold was breached.
    pub alert_date: NaiveDate,
    pub aggregated_value: f64,
    pub threshold: f64,
    pub risk_class: RiskClass,
    pub trigger_details: TriggerDetails,
}

// ── Runs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Baseline,
    Refined,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Baseline => "baseline",
            RunKind::Refined => "refined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(RunKind::Baseline),
            "refined" => Some(RunKind::Refined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "aborted" => Some(RunStatus::Aborted),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// The run record. Alerts belong to exactly one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub run_id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub scenarios: Vec<ScenarioId>,
    /// Fraction of units (scenarios + refinement) completed, 0.0..=1.0.
    pub progress: f64,
    pub total_transactions: usize,
    pub total_alerts: usize,
    pub excluded_alerts: usize,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

impl SimulationRun {
    pub fn new(kind: RunKind, scenarios: Vec<ScenarioId>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: RunStatus::Pending,
            scenarios,
            progress: 0.0,
            total_transactions: 0,
            total_alerts: 0,
            excluded_alerts: 0,
            created_at: Utc::now().naive_utc(),
            completed_at: None,
        }
    }
}
