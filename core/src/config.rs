//! Policy constants and data-directory loading.
//!
//! Everything the pipeline treats as tunable policy lives on `EngineConfig`:
//! risk-class breakpoints, risk-score weights, risk-level thresholds and the
//! event categories. `EngineConfig::default()` carries the documented values.

use crate::{
    event_detector::{default_categories, EventCategory},
    model::{CustomerRiskProfile, RiskClass, VerifiedEntity},
    refinement::RefinementRule,
    scenario::ScenarioConfig,
};
use serde::{Deserialize, Serialize};

// ── Risk classification ──────────────────────────────────────────────────────

/// Ratio of aggregated value to threshold that moves an alert up a class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskClassBreakpoints {
    pub medium_ratio: f64,
    pub high_ratio: f64,
}

impl Default for RiskClassBreakpoints {
    fn default() -> Self {
        Self {
            medium_ratio: 1.5,
            high_ratio: 3.0,
        }
    }
}

impl RiskClassBreakpoints {
    /// ratio < medium ⇒ LOW, ratio < high ⇒ MEDIUM, otherwise HIGH.
    /// A non-positive threshold has no meaningful ratio and classifies HIGH.
    pub fn classify(&self, aggregated: f64, threshold: f64) -> RiskClass {
        if threshold <= 0.0 {
            return RiskClass::High;
        }
        let ratio = aggregated / threshold;
        if ratio < self.medium_ratio {
            RiskClass::Low
        } else if ratio < self.high_ratio {
            RiskClass::Medium
        } else {
            RiskClass::High
        }
    }
}

// ── Risk scoring ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub baseline: f64,
    pub unverified_beneficiary: f64,
    pub implausible_amount: f64,
    pub pep: f64,
    pub adverse_media: f64,
    pub high_risk_occupation: f64,
    pub per_prior_sar: f64,
    pub max_counted_sars: u32,
    pub high_alert: f64,
    pub medium_alert: f64,
    pub verified_credit: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            baseline: 0.0,
            unverified_beneficiary: 25.0,
            implausible_amount: 15.0,
            pep: 25.0,
            adverse_media: 20.0,
            high_risk_occupation: 10.0,
            per_prior_sar: 10.0,
            max_counted_sars: 3,
            high_alert: 10.0,
            medium_alert: 5.0,
            verified_credit: 5.0,
        }
    }
}

/// 0 ⇒ SAFE, ≤ caution_max ⇒ CAUTION, ≤ dangerous_max ⇒ DANGEROUS,
/// above ⇒ CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLevelThresholds {
    pub caution_max: f64,
    pub dangerous_max: f64,
}

impl Default for RiskLevelThresholds {
    fn default() -> Self {
        Self {
            caution_max: 25.0,
            dangerous_max: 60.0,
        }
    }
}

// ── Engine configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk_classes: RiskClassBreakpoints,
    pub risk_weights: RiskWeights,
    pub risk_levels: RiskLevelThresholds,
    pub sample_exploit_limit: usize,
    pub default_lookback_days: u32,
    /// Declaration order is the tie-break order for category detection.
    pub categories: Vec<EventCategory>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_classes: RiskClassBreakpoints::default(),
            risk_weights: RiskWeights::default(),
            risk_levels: RiskLevelThresholds::default(),
            sample_exploit_limit: 5,
            default_lookback_days: 30,
            categories: default_categories(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScenariosFile {
    scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Deserialize)]
struct RefinementRulesFile {
    rules: Vec<RefinementRule>,
}

#[derive(Debug, Deserialize)]
struct VerifiedEntitiesFile {
    entities: Vec<VerifiedEntity>,
}

#[derive(Debug, Deserialize)]
struct RiskProfilesFile {
    profiles: Vec<CustomerRiskProfile>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))
}

impl EngineConfig {
    /// Read `policy.json`. Omitted keys keep their defaults.
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = read_json(&format!("{data_dir}/policy.json"))?;
        config.validate()?;
        log::info!(
            "config: loaded policy from {data_dir} ({} categories)",
            config.categories.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let rc = &self.risk_classes;
        if !(rc.medium_ratio > 0.0 && rc.high_ratio >= rc.medium_ratio) {
            anyhow::bail!(
                "risk class breakpoints must satisfy 0 < medium ({}) <= high ({})",
                rc.medium_ratio,
                rc.high_ratio
            );
        }
        let rl = &self.risk_levels;
        if !(rl.caution_max > 0.0 && rl.dangerous_max >= rl.caution_max && rl.dangerous_max <= 100.0) {
            anyhow::bail!(
                "risk level thresholds must satisfy 0 < caution ({}) <= dangerous ({}) <= 100",
                rl.caution_max,
                rl.dangerous_max
            );
        }
        let mut seen = std::collections::HashSet::new();
        for cat in &self.categories {
            if !seen.insert(cat.name.as_str()) {
                anyhow::bail!("event category '{}' declared twice", cat.name);
            }
            if cat.keywords.iter().all(|k| k.trim().is_empty()) {
                anyhow::bail!("event category '{}' has no keywords", cat.name);
            }
            if cat.min_amount > cat.max_amount {
                anyhow::bail!("event category '{}' has min_amount > max_amount", cat.name);
            }
        }
        Ok(())
    }

    pub fn category(&self, name: &str) -> Option<&EventCategory> {
        self.categories.iter().find(|c| c.name == name)
    }
}

pub fn load_scenarios(data_dir: &str) -> anyhow::Result<Vec<ScenarioConfig>> {
    let file: ScenariosFile = read_json(&format!("{data_dir}/scenarios.json"))?;
    Ok(file.scenarios)
}

pub fn load_refinement_rules(data_dir: &str) -> anyhow::Result<Vec<RefinementRule>> {
    let file: RefinementRulesFile = read_json(&format!("{data_dir}/refinement_rules.json"))?;
    Ok(file.rules)
}

/// The whitelist is optional: a missing file yields `None`.
pub fn load_verified_entities(data_dir: &str) -> anyhow::Result<Option<Vec<VerifiedEntity>>> {
    let path = format!("{data_dir}/verified_entities.json");
    if !std::path::Path::new(&path).exists() {
        return Ok(None);
    }
    let file: VerifiedEntitiesFile = read_json(&path)?;
    Ok(Some(file.entities))
}

/// Risk profiles are optional: a missing file yields `None`.
pub fn load_risk_profiles(data_dir: &str) -> anyhow::Result<Option<Vec<CustomerRiskProfile>>> {
    let path = format!("{data_dir}/risk_profiles.json");
    if !std::path::Path::new(&path).exists() {
        return Ok(None);
    }
    let file: RiskProfilesFile = read_json(&path)?;
    Ok(Some(file.profiles))
}
