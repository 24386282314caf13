//! Comparison engine: diff a baseline alert set against a refined one.
//!
//! Alerts are matched on (customer, scenario, window end). Keys in both sets
//! are RETAINED, baseline-only keys are EXCLUDED and refined-only keys are
//! NEW_ALERT. The EXCLUDED subset is scored by the risk engine.
//!
//! RULE: percent_reduction is 0 when the baseline is empty.
//! RULE: Within one set, the first alert per key (input order) represents it.

use crate::{
    model::{Alert, RiskClass},
    refinement::ExclusionLogEntry,
    risk_engine::{RiskEngine, RiskReport, RiskSubject},
    types::EntityId,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchKey {
    pub customer_id: EntityId,
    pub scenario_id: String,
    pub window_end: NaiveDate,
}

impl MatchKey {
    pub fn of(alert: &Alert) -> Self {
        Self {
            customer_id: alert.customer_id.clone(),
            scenario_id: alert.scenario_id.clone(),
            window_end: alert.alert_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchClass {
    Retained,
    Excluded,
    NewAlert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMatch {
    pub key: MatchKey,
    pub class: MatchClass,
    pub baseline_alert_id: Option<EntityId>,
    pub refined_alert_id: Option<EntityId>,
    pub risk_class: RiskClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub baseline_count: usize,
    pub refined_count: usize,
    pub net_change: i64,
    pub percent_reduction: f64,
    pub retained: usize,
    pub excluded: usize,
    pub new_alerts: usize,
    /// Share of baseline keys still present after refinement.
    pub retention_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRiskAnalysis {
    pub total_suppressions: usize,
    pub high_risk_suppressions: usize,
    pub report: RiskReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub summary: ComparisonSummary,
    /// One entry per distinct key, in key order.
    pub matches: Vec<AlertMatch>,
    pub risk_analysis: ComparisonRiskAnalysis,
}

impl ComparisonReport {
    pub fn keys(&self, class: MatchClass) -> Vec<&MatchKey> {
        self.matches
            .iter()
            .filter(|m| m.class == class)
            .map(|m| &m.key)
            .collect()
    }
}

pub fn percent_reduction(baseline_count: usize, refined_count: usize) -> f64 {
    if baseline_count == 0 {
        return 0.0;
    }
    (baseline_count as f64 - refined_count as f64) / baseline_count as f64 * 100.0
}

fn index_by_key(alerts: &[Alert]) -> BTreeMap<MatchKey, &Alert> {
    let mut map = BTreeMap::new();
    for alert in alerts {
        map.entry(MatchKey::of(alert)).or_insert(alert);
    }
    map
}

pub struct ComparisonEngine<'a> {
    risk: &'a RiskEngine,
}

impl<'a> ComparisonEngine<'a> {
    pub fn new(risk: &'a RiskEngine) -> Self {
        Self { risk }
    }

    /// `exclusion_log` may be empty; when it names an EXCLUDED alert the
    /// risk engine scores that alert with its recorded context.
    pub fn compare(
        &self,
        baseline: &[Alert],
        refined: &[Alert],
        exclusion_log: &[ExclusionLogEntry],
    ) -> ComparisonReport {
        let base = index_by_key(baseline);
        let refi = index_by_key(refined);

        let mut matches = Vec::with_capacity(base.len() + refi.len());
        for (key, alert) in &base {
            let counterpart = refi.get(key);
            matches.push(AlertMatch {
                key: key.clone(),
                class: if counterpart.is_some() {
                    MatchClass::Retained
                } else {
                    MatchClass::Excluded
                },
                baseline_alert_id: Some(alert.alert_id.clone()),
                refined_alert_id: counterpart.map(|a| a.alert_id.clone()),
                risk_class: alert.risk_class,
            });
        }
        for (key, alert) in &refi {
            if !base.contains_key(key) {
                matches.push(AlertMatch {
                    key: key.clone(),
                    class: MatchClass::NewAlert,
                    baseline_alert_id: None,
                    refined_alert_id: Some(alert.alert_id.clone()),
                    risk_class: alert.risk_class,
                });
            }
        }
        matches.sort_by(|a, b| a.key.cmp(&b.key));

        let count = |class: MatchClass| matches.iter().filter(|m| m.class == class).count();
        let retained = count(MatchClass::Retained);
        let excluded = count(MatchClass::Excluded);
        let new_alerts = count(MatchClass::NewAlert);

        // Risk over the EXCLUDED subset, joined to the log by alert id.
        let by_alert: HashMap<&str, &ExclusionLogEntry> = exclusion_log
            .iter()
            .map(|e| (e.alert_id.as_str(), e))
            .collect();
        let subjects: Vec<RiskSubject<'_>> = base
            .iter()
            .filter(|(key, _)| !refi.contains_key(*key))
            .map(|(_, alert)| RiskSubject::new(alert, by_alert.get(alert.alert_id.as_str()).copied()))
            .collect();
        let report = self.risk.analyze(&subjects);

        let summary = ComparisonSummary {
            baseline_count: baseline.len(),
            refined_count: refined.len(),
            net_change: refined.len() as i64 - baseline.len() as i64,
            percent_reduction: percent_reduction(baseline.len(), refined.len()),
            retained,
            excluded,
            new_alerts,
            retention_rate: if base.is_empty() {
                100.0
            } else {
                retained as f64 / base.len() as f64 * 100.0
            },
        };
        log::info!(
            "compare: baseline={} refined={} retained={} excluded={} new={} reduction={:.1}%",
            summary.baseline_count,
            summary.refined_count,
            retained,
            excluded,
            new_alerts,
            summary.percent_reduction
        );

        ComparisonReport {
            summary,
            matches,
            risk_analysis: ComparisonRiskAnalysis {
                total_suppressions: report.excluded_count,
                high_risk_suppressions: report.high_risk_suppressions,
                report,
            },
        }
    }
}
