//! Risk engine: how dangerous was a set of exclusions?
//!
//! Each excluded alert earns a per-alert score from its exclusion context,
//! the risk flags refinement attached, its own risk class and the customer's
//! risk profile. The report score is baseline + Σ per-alert, saturating at 100.
//!
//! RULE: Missing reference data degrades scoring, it never fails it. No
//! profile means no profile flags. No exclusion context means unverified.
//! RULE: sample_exploits are the highest per-alert scores, ties broken by
//! alert id, bounded by the configured limit. Exclusions scoring 0 are never
//! listed, so the list can be shorter than the limit.

use crate::{
    config::{EngineConfig, RiskLevelThresholds, RiskWeights},
    model::{Alert, CustomerRiskProfile, RiskClass},
    refinement::{ExclusionLogEntry, RiskFlag},
    types::EntityId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_SCORE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Caution,
    Dangerous,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64, thresholds: &RiskLevelThresholds) -> Self {
        if score <= 0.0 {
            RiskLevel::Safe
        } else if score <= thresholds.caution_max {
            RiskLevel::Caution
        } else if score <= thresholds.dangerous_max {
            RiskLevel::Dangerous
        } else {
            RiskLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Caution => "CAUTION",
            RiskLevel::Dangerous => "DANGEROUS",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// An excluded alert and, when known, the log entry that excluded it.
#[derive(Debug, Clone, Copy)]
pub struct RiskSubject<'a> {
    pub alert: &'a Alert,
    pub exclusion: Option<&'a ExclusionLogEntry>,
}

impl<'a> RiskSubject<'a> {
    pub fn new(alert: &'a Alert, exclusion: Option<&'a ExclusionLogEntry>) -> Self {
        Self { alert, exclusion }
    }

    pub fn bare(alert: &'a Alert) -> Self {
        Self {
            alert,
            exclusion: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRiskAssessment {
    pub alert_id: EntityId,
    pub customer_id: EntityId,
    pub scenario_id: String,
    pub risk_class: RiskClass,
    pub category: Option<String>,
    pub rule_id: Option<String>,
    pub score: f64,
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub score: f64,
    pub level: RiskLevel,
    pub excluded_count: usize,
    pub high_risk_suppressions: usize,
    pub assessments: Vec<AlertRiskAssessment>,
    pub sample_exploits: Vec<String>,
}

pub struct RiskEngine {
    weights: RiskWeights,
    levels: RiskLevelThresholds,
    sample_limit: usize,
    profiles: Option<HashMap<EntityId, CustomerRiskProfile>>,
}

impl RiskEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            weights: config.risk_weights,
            levels: config.risk_levels,
            sample_limit: config.sample_exploit_limit,
            profiles: None,
        }
    }

    pub fn with_profiles(mut self, profiles: &[CustomerRiskProfile]) -> Self {
        self.profiles = Some(
            profiles
                .iter()
                .map(|p| (p.customer_id.clone(), p.clone()))
                .collect(),
        );
        self
    }

    pub fn analyze(&self, subjects: &[RiskSubject<'_>]) -> RiskReport {
        let mut assessments: Vec<AlertRiskAssessment> =
            subjects.iter().map(|s| self.assess(s)).collect();

        let total: f64 = assessments.iter().map(|a| a.score).sum();
        let score = (self.weights.baseline + total).clamp(0.0, MAX_SCORE);
        let level = RiskLevel::from_score(score, &self.levels);
        let high_risk_suppressions = subjects
            .iter()
            .filter(|s| s.alert.risk_class == RiskClass::High)
            .count();

        assessments.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.alert_id.cmp(&b.alert_id))
        });
        let sample_exploits = assessments
            .iter()
            .filter(|a| a.score > 0.0)
            .take(self.sample_limit)
            .map(describe)
            .collect();

        log::debug!(
            "risk: excluded={} score={:.1} level={}",
            subjects.len(),
            score,
            level.as_str()
        );

        RiskReport {
            score,
            level,
            excluded_count: subjects.len(),
            high_risk_suppressions,
            assessments,
            sample_exploits,
        }
    }

    fn assess(&self, subject: &RiskSubject<'_>) -> AlertRiskAssessment {
        let w = &self.weights;
        let alert = subject.alert;
        let mut score = 0.0;
        let mut factors = Vec::new();

        match subject.exclusion {
            None => {
                score += w.unverified_beneficiary;
                factors.push("no verified context".to_string());
            }
            Some(entry) => {
                let unverified_activity = entry
                    .risk_flags
                    .iter()
                    .any(|f| matches!(f, RiskFlag::UnverifiedCategoryActivity { .. }));
                let implausible_activity = entry
                    .risk_flags
                    .iter()
                    .any(|f| matches!(f, RiskFlag::ImplausibleCategoryAmount { .. }));

                if !entry.context.is_verified || unverified_activity {
                    score += w.unverified_beneficiary;
                    factors.push("unverified beneficiary".to_string());
                } else {
                    score -= w.verified_credit;
                }
                if !entry.context.amount_reasonable || implausible_activity {
                    score += w.implausible_amount;
                    factors.push(format!("implausible {} amount", entry.context.category));
                }
            }
        }

        match alert.risk_class {
            RiskClass::High => {
                score += w.high_alert;
                factors.push("HIGH alert".to_string());
            }
            RiskClass::Medium => score += w.medium_alert,
            RiskClass::Low => {}
        }

        if let Some(profile) = self
            .profiles
            .as_ref()
            .and_then(|p| p.get(&alert.customer_id))
        {
            if profile.is_pep {
                score += w.pep;
                factors.push("PEP".to_string());
            }
            if profile.has_adverse_media {
                score += w.adverse_media;
                factors.push("adverse media".to_string());
            }
            if profile.high_risk_occupation {
                score += w.high_risk_occupation;
                factors.push("high-risk occupation".to_string());
            }
            if profile.previous_sar_count > 0 {
                let counted = profile.previous_sar_count.min(w.max_counted_sars);
                score += w.per_prior_sar * f64::from(counted);
                factors.push(format!("{} prior SAR(s)", profile.previous_sar_count));
            }
        }

        AlertRiskAssessment {
            alert_id: alert.alert_id.clone(),
            customer_id: alert.customer_id.clone(),
            scenario_id: alert.scenario_id.clone(),
            risk_class: alert.risk_class,
            category: subject.exclusion.map(|e| e.context.category.clone()),
            rule_id: subject.exclusion.map(|e| e.rule_id.clone()),
            score: score.max(0.0),
            factors,
        }
    }
}

fn describe(a: &AlertRiskAssessment) -> String {
    let how = match (&a.rule_id, &a.category) {
        (Some(rule), Some(cat)) => format!("excluded by {rule} as {cat} activity"),
        _ => "excluded without recorded context".to_string(),
    };
    let factors = if a.factors.is_empty() {
        String::new()
    } else {
        format!(" [{}]", a.factors.join(", "))
    };
    format!(
        "Customer {} {} alert {} {}: risk {:.0}{}",
        a.customer_id,
        a.risk_class.as_str(),
        a.alert_id,
        how,
        a.score,
        factors
    )
}
