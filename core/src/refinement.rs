//! Refinement layer: post-hoc exclusion of alerts with legitimate context.
//!
//! Each rule runs as two set-oriented passes:
//!   1. Compile the rule's keywords once and scan every narrative, building
//!      the set of customers with at least one keyword hit.
//!   2. Visit only the non-excluded alerts whose customer is in that set, in
//!      alert-id order, and search the customer's transactions in
//!      `[alert_date - lookback, alert_date]` for a verified, amount-reasonable
//!      context of one of the rule's categories.
//!
//! RULE: An alert is excluded only on a context that is both verified and
//! amount-reasonable. Anything partial retains the alert.
//! RULE: Rules run in declaration order. The first rule to exclude an alert
//! wins; later rules never see it.
//! RULE: A malformed rule becomes a `UnitFailure`; sibling rules still run.
//! RULE: Window transactions are classified by the full detector, across every
//! configured category with the longest keyword winning. A rule only sees the
//! category a narrative resolves to, so "Tuition installment" counts as loan
//! and a rule listing only education does not exclude on it.

use crate::{
    error::{AmlError, AmlResult, UnitFailure},
    event_detector::{EventContext, EventDetector, KeywordMatcher},
    model::{Alert, RiskClass, Transaction},
    types::{EntityId, RuleId},
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Evidence worth less than this share of the alerted value is flagged.
const EVIDENCE_COVERAGE_RATIO: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRule {
    pub rule_id: RuleId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Event categories whose verified context excludes an alert.
    pub categories: Vec<String>,
    /// Falls back to the engine's default lookback when absent.
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RefinementRule {
    pub fn new(rule_id: &str, name: &str, categories: &[&str], lookback_days: u32) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            description: None,
            categories: categories.iter().map(|c| c.to_string()).collect(),
            lookback_days: Some(lookback_days),
            enabled: true,
        }
    }

    fn validate(&self, detector: &EventDetector) -> AmlResult<()> {
        let scope = format!("refinement rule '{}'", self.rule_id);
        if self.categories.is_empty() {
            return Err(AmlError::config(scope, "no event categories"));
        }
        if let Some(unknown) = self.categories.iter().find(|c| detector.category(c).is_none()) {
            return Err(AmlError::config(scope, format!("unknown event category '{unknown}'")));
        }
        Ok(())
    }
}

/// Structured observations attached to an exclusion. None of them blocked
/// the exclusion; each marks a way a stricter policy might have kept it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum RiskFlag {
    /// Same-category activity in the window went to unverified beneficiaries.
    UnverifiedCategoryActivity { count: usize },
    /// Same-category activity in the window had implausible amounts.
    ImplausibleCategoryAmount { count: usize },
    /// The suppressed alert was classified HIGH.
    HighRiskAlert,
    /// The legitimate transaction explains less than half the alerted value.
    EvidenceBelowAlertValue {
        evidence_amount: f64,
        aggregated_value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionLogEntry {
    pub log_id: String,
    pub alert_id: EntityId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub customer_id: EntityId,
    pub scenario_id: String,
    pub alert_date: NaiveDate,
    pub context: EventContext,
    pub evidence_transaction_id: EntityId,
    pub beneficiary: Option<String>,
    pub evidence_amount: f64,
    pub reason: String,
    pub risk_flags: Vec<RiskFlag>,
}

#[derive(Debug, Clone, Default)]
pub struct RefineOutcome {
    /// Alerts that survived refinement, in input order.
    pub retained: Vec<Alert>,
    /// Excluded alerts, index-aligned with `exclusion_log`.
    pub excluded: Vec<Alert>,
    pub exclusion_log: Vec<ExclusionLogEntry>,
    pub failures: Vec<UnitFailure>,
}

impl RefineOutcome {
    /// Excluded alerts paired with the log entry that excluded them.
    pub fn exclusions(&self) -> impl Iterator<Item = (&Alert, &ExclusionLogEntry)> {
        self.excluded.iter().zip(self.exclusion_log.iter())
    }
}

/// Per-customer transactions sorted by date, built once per `refine` call.
struct CustomerIndex<'a> {
    by_customer: HashMap<&'a str, Vec<&'a Transaction>>,
}

impl<'a> CustomerIndex<'a> {
    fn new(transactions: &'a [Transaction]) -> Self {
        let mut by_customer: HashMap<&str, Vec<&Transaction>> = HashMap::new();
        for txn in transactions {
            by_customer.entry(txn.customer_id.as_str()).or_default().push(txn);
        }
        for txns in by_customer.values_mut() {
            txns.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.transaction_id.cmp(&b.transaction_id))
            });
        }
        Self { by_customer }
    }

    /// Transactions dated within `[from, to]`, inclusive.
    fn window(&self, customer_id: &str, from: NaiveDate, to: NaiveDate) -> &[&'a Transaction] {
        let Some(txns) = self.by_customer.get(customer_id) else {
            return &[];
        };
        let lo = txns.partition_point(|t| t.date() < from);
        let hi = txns.partition_point(|t| t.date() <= to);
        &txns[lo..hi.max(lo)]
    }
}

pub struct RefinementLayer<'a> {
    detector: &'a EventDetector,
    default_lookback_days: u32,
}

impl<'a> RefinementLayer<'a> {
    pub fn new(detector: &'a EventDetector, default_lookback_days: u32) -> Self {
        Self {
            detector,
            default_lookback_days,
        }
    }

    pub fn refine(
        &self,
        alerts: &[Alert],
        transactions: &[Transaction],
        rules: &[RefinementRule],
    ) -> RefineOutcome {
        let mut order: Vec<usize> = (0..alerts.len()).collect();
        order.sort_by(|&a, &b| alerts[a].alert_id.cmp(&alerts[b].alert_id));

        let index = CustomerIndex::new(transactions);
        let mut excluded_by: Vec<Option<usize>> = vec![None; alerts.len()];
        let mut entries: Vec<(usize, ExclusionLogEntry)> = Vec::new();
        let mut failures = Vec::new();

        for rule in rules {
            if !rule.enabled {
                log::debug!("rule={} disabled, skipping", rule.rule_id);
                continue;
            }
            if let Err(e) = rule.validate(self.detector) {
                log::warn!("rule={} failed: {}", rule.rule_id, e);
                failures.push(UnitFailure::rule(&rule.rule_id, &e));
                continue;
            }
            let lookback = rule.lookback_days.unwrap_or(self.default_lookback_days);
            let categories: HashSet<&str> = rule.categories.iter().map(String::as_str).collect();

            // Pass 1: customers with any keyword hit for this rule.
            let rule_categories: Vec<_> = self
                .detector
                .categories()
                .iter()
                .filter(|c| categories.contains(c.name.as_str()))
                .cloned()
                .collect();
            let matcher = KeywordMatcher::new(&rule_categories);
            let candidates: HashSet<&str> = transactions
                .iter()
                .filter(|t| matcher.is_match(&t.narrative))
                .map(|t| t.customer_id.as_str())
                .collect();

            // Pass 2: only alerts of candidate customers.
            let mut rule_exclusions = 0usize;
            for &i in &order {
                let alert = &alerts[i];
                if excluded_by[i].is_some() || !candidates.contains(alert.customer_id.as_str()) {
                    continue;
                }
                let from = alert.alert_date - Duration::days(i64::from(lookback));
                let window = index.window(&alert.customer_id, from, alert.alert_date);
                if let Some(entry) = self.evaluate_window(rule, &categories, alert, window) {
                    log::debug!(
                        "rule={} excluded alert={} via txn={}",
                        rule.rule_id,
                        alert.alert_id,
                        entry.evidence_transaction_id
                    );
                    excluded_by[i] = Some(entries.len());
                    entries.push((i, entry));
                    rule_exclusions += 1;
                }
            }
            log::info!(
                "rule={} candidates={} excluded={}",
                rule.rule_id,
                candidates.len(),
                rule_exclusions
            );
        }

        let retained = alerts
            .iter()
            .zip(&excluded_by)
            .filter(|(_, ex)| ex.is_none())
            .map(|(a, _)| a.clone())
            .collect();
        let (excluded, exclusion_log) = entries
            .into_iter()
            .map(|(i, entry)| (alerts[i].clone(), entry))
            .unzip();

        RefineOutcome {
            retained,
            excluded,
            exclusion_log,
            failures,
        }
    }

    /// Scan the window; the first legitimate in-category context is the
    /// evidence. Every in-category context feeds the risk flags.
    fn evaluate_window(
        &self,
        rule: &RefinementRule,
        categories: &HashSet<&str>,
        alert: &Alert,
        window: &[&Transaction],
    ) -> Option<ExclusionLogEntry> {
        let mut evidence: Option<(&Transaction, EventContext)> = None;
        let mut unverified = 0usize;
        let mut implausible = 0usize;

        for txn in window {
            let Some(ctx) = self
                .detector
                .detect(&txn.narrative, txn.amount, txn.beneficiary.as_deref())
            else {
                continue;
            };
            if !categories.contains(ctx.category.as_str()) {
                continue;
            }
            if !ctx.is_verified {
                unverified += 1;
            }
            if !ctx.amount_reasonable {
                implausible += 1;
            }
            if evidence.is_none() && ctx.is_legitimate() {
                evidence = Some((txn, ctx));
            }
        }

        let (txn, context) = evidence?;
        let mut risk_flags = Vec::new();
        if unverified > 0 {
            risk_flags.push(RiskFlag::UnverifiedCategoryActivity { count: unverified });
        }
        if implausible > 0 {
            risk_flags.push(RiskFlag::ImplausibleCategoryAmount { count: implausible });
        }
        if alert.risk_class == RiskClass::High {
            risk_flags.push(RiskFlag::HighRiskAlert);
        }
        if txn.amount.abs() < EVIDENCE_COVERAGE_RATIO * alert.aggregated_value.abs() {
            risk_flags.push(RiskFlag::EvidenceBelowAlertValue {
                evidence_amount: txn.amount.abs(),
                aggregated_value: alert.aggregated_value,
            });
        }

        let beneficiary = txn.beneficiary.clone();
        let reason = format!(
            "Verified {} transaction to {}",
            context.category,
            beneficiary.as_deref().unwrap_or("unknown beneficiary")
        );
        Some(ExclusionLogEntry {
            log_id: format!("{}:{}", rule.rule_id, alert.alert_id),
            alert_id: alert.alert_id.clone(),
            rule_id: rule.rule_id.clone(),
            rule_name: rule.name.clone(),
            customer_id: alert.customer_id.clone(),
            scenario_id: alert.scenario_id.clone(),
            alert_date: alert.alert_date,
            context,
            evidence_transaction_id: txn.transaction_id.clone(),
            beneficiary,
            evidence_amount: txn.amount,
            reason,
            risk_flags,
        })
    }
}

/// Refine with an explicit detector and default lookback.
pub fn refine(
    detector: &EventDetector,
    alerts: &[Alert],
    transactions: &[Transaction],
    rules: &[RefinementRule],
    default_lookback_days: u32,
) -> RefineOutcome {
    RefinementLayer::new(detector, default_lookback_days).refine(alerts, transactions, rules)
}
