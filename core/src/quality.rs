//! Data-quality checks on the ingested batch.
//!
//! Informational only: a report is attached to the run result and logged,
//! it never blocks a run. Each failing check is one issue, whatever the
//! number of rows behind it.
//!
//! quality_score = max(0, 100 − 15·errors − 5·warnings)

use crate::model::{Customer, Transaction};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Constants ────────────────────────────────────────────────────────────────

const ERROR_PENALTY: f64 = 15.0;
const WARNING_PENALTY: f64 = 5.0;
const LARGE_AMOUNT: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub field: String,
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub total_rows: usize,
    pub issues: Vec<QualityIssue>,
    pub warnings: Vec<QualityIssue>,
    pub quality_score: f64,
    /// Rows not named by any issue or warning (lower bound when checks overlap).
    pub clean_rows: usize,
}

impl DataQualityReport {
    fn build(total_rows: usize, found: Vec<QualityIssue>) -> Self {
        let (issues, warnings): (Vec<_>, Vec<_>) =
            found.into_iter().partition(|i| i.severity == Severity::Error);
        let quality_score = (100.0
            - ERROR_PENALTY * issues.len() as f64
            - WARNING_PENALTY * warnings.len() as f64)
            .max(0.0);
        let flagged: usize = issues.iter().chain(&warnings).map(|i| i.count).sum();
        Self {
            total_rows,
            issues,
            warnings,
            quality_score,
            clean_rows: total_rows.saturating_sub(flagged),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

fn check(
    found: &mut Vec<QualityIssue>,
    severity: Severity,
    field: &str,
    count: usize,
    message: impl FnOnce(usize) -> String,
) {
    if count > 0 {
        found.push(QualityIssue {
            severity,
            field: field.into(),
            message: message(count),
            count,
        });
    }
}

pub fn validate_transactions(transactions: &[Transaction], now: NaiveDateTime) -> DataQualityReport {
    let mut found = Vec::new();

    let mut seen = HashSet::new();
    let dupes = transactions
        .iter()
        .filter(|t| !seen.insert(t.transaction_id.as_str()))
        .count();
    check(&mut found, Severity::Error, "transaction_id", dupes, |n| {
        format!("{n} duplicate transaction IDs found")
    });

    let missing_customer = transactions
        .iter()
        .filter(|t| t.customer_id.trim().is_empty())
        .count();
    check(&mut found, Severity::Error, "customer_id", missing_customer, |n| {
        format!("{n} transactions missing customer_id")
    });

    let bad_amount = transactions.iter().filter(|t| !t.amount.is_finite()).count();
    check(&mut found, Severity::Error, "amount", bad_amount, |n| {
        format!("{n} transactions have a non-numeric amount")
    });

    let zero = transactions.iter().filter(|t| t.amount == 0.0).count();
    check(&mut found, Severity::Warning, "amount", zero, |n| {
        format!("{n} transactions have zero amount")
    });

    let large = transactions
        .iter()
        .filter(|t| t.amount.is_finite() && t.amount.abs() > LARGE_AMOUNT)
        .count();
    check(&mut found, Severity::Warning, "amount", large, |n| {
        format!("{n} transactions exceed {LARGE_AMOUNT}")
    });

    let future = transactions.iter().filter(|t| t.timestamp > now).count();
    check(&mut found, Severity::Warning, "transaction_date", future, |n| {
        format!("{n} transactions are future-dated")
    });

    let expired = transactions.iter().filter(|t| t.is_expired(now)).count();
    check(&mut found, Severity::Warning, "expires_at", expired, |n| {
        format!("{n} transactions are past their retention expiry")
    });

    let report = DataQualityReport::build(transactions.len(), found);
    log::info!(
        "quality: transactions rows={} score={} errors={} warnings={}",
        report.total_rows,
        report.quality_score,
        report.issues.len(),
        report.warnings.len()
    );
    report
}

pub fn validate_customers(customers: &[Customer], now: NaiveDateTime) -> DataQualityReport {
    let mut found = Vec::new();

    let mut seen = HashSet::new();
    let dupes = customers
        .iter()
        .filter(|c| !seen.insert(c.customer_id.as_str()))
        .count();
    check(&mut found, Severity::Error, "customer_id", dupes, |n| {
        format!("{n} duplicate customer IDs found")
    });

    let missing_id = customers
        .iter()
        .filter(|c| c.customer_id.trim().is_empty())
        .count();
    check(&mut found, Severity::Error, "customer_id", missing_id, |n| {
        format!("{n} customers missing customer_id")
    });

    let missing_name = customers.iter().filter(|c| c.name.is_none()).count();
    check(&mut found, Severity::Warning, "customer_name", missing_name, |n| {
        format!("{n} customers missing name")
    });

    let expired = customers.iter().filter(|c| c.is_expired(now)).count();
    check(&mut found, Severity::Warning, "expires_at", expired, |n| {
        format!("{n} customers are past their retention expiry")
    });

    let report = DataQualityReport::build(customers.len(), found);
    log::info!(
        "quality: customers rows={} score={} errors={} warnings={}",
        report.total_rows,
        report.quality_score,
        report.issues.len(),
        report.warnings.len()
    );
    report
}
