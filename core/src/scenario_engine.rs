//! Scenario engine: filter → aggregate → threshold → alert.
//!
//! Runs one validated `ScenarioDefinition` against a transaction set.
//!
//! RULE: A row that cannot be evaluated (missing field, failed coercion) is
//! excluded and counted, never fatal. A group whose threshold cannot be
//! resolved fails closed and produces no alert.
//! RULE: Exceedance is strict. aggregated == threshold never alerts.
//! RULE: Output order is deterministic: groups in key order, then windows
//! by end date.

use crate::{
    config::RiskClassBreakpoints,
    error::AmlError,
    model::{Alert, Customer, Transaction, TriggerDetails},
    scenario::{ScenarioDefinition, Threshold, TimeWindow},
    types::FieldValue,
};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Row and group counters for one scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub input_rows: usize,
    pub filtered_rows: usize,
    /// Rows dropped because a field was missing or failed coercion.
    pub skipped_rows: usize,
    pub groups: usize,
    pub windows_evaluated: usize,
    /// Groups whose threshold could not be resolved.
    pub unresolved_thresholds: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioOutput {
    pub alerts: Vec<Alert>,
    pub stats: StageStats,
}

struct Row<'a> {
    txn: &'a Transaction,
    date: NaiveDate,
    value: f64,
}

pub struct ScenarioEngine {
    breakpoints: RiskClassBreakpoints,
}

impl ScenarioEngine {
    pub fn new(breakpoints: RiskClassBreakpoints) -> Self {
        Self { breakpoints }
    }

    pub fn execute(
        &self,
        scenario: &ScenarioDefinition,
        transactions: &[Transaction],
        customers: &[Customer],
    ) -> ScenarioOutput {
        let mut stats = StageStats {
            input_rows: transactions.len(),
            ..StageStats::default()
        };
        if transactions.is_empty() || customers.is_empty() {
            let what = if transactions.is_empty() { "transactions" } else { "customers" };
            log::debug!(
                "scenario={} {}, no alerts",
                scenario.scenario_id,
                AmlError::EmptyInput { what: what.into() }
            );
            return ScenarioOutput {
                alerts: Vec::new(),
                stats,
            };
        }

        let by_customer: HashMap<&str, &Customer> = customers
            .iter()
            .map(|c| (c.customer_id.as_str(), c))
            .collect();

        // Filter stage.
        let mut surviving = Vec::new();
        for txn in transactions {
            let customer = by_customer.get(txn.customer_id.as_str()).copied();
            match passes_filters(scenario, txn, customer) {
                Some(true) => surviving.push(txn),
                Some(false) => {}
                None => stats.skipped_rows += 1,
            }
        }
        stats.filtered_rows = surviving.len();

        // Aggregation stage: group rows by the group-by key.
        let agg = &scenario.aggregation;
        let mut groups: BTreeMap<Vec<String>, Vec<Row>> = BTreeMap::new();
        for txn in surviving {
            let customer = by_customer.get(txn.customer_id.as_str()).copied();
            let key: Option<Vec<String>> = agg
                .group_by
                .iter()
                .map(|g| lookup(scenario, txn, customer, g).map(|v| v.to_string()))
                .collect();
            let value = match agg.method {
                crate::scenario::AggregationMethod::Count => {
                    lookup(scenario, txn, customer, &agg.field).map(|_| 1.0)
                }
                _ => lookup(scenario, txn, customer, &agg.field).and_then(|v| v.as_f64()),
            };
            match (key, value) {
                (Some(key), Some(value)) => groups.entry(key).or_default().push(Row {
                    txn,
                    date: txn.date(),
                    value,
                }),
                _ => stats.skipped_rows += 1,
            }
        }
        stats.groups = groups.len();

        let customer_pos = agg.group_by.iter().position(|g| g == "customer_id");
        let mut alerts = Vec::new();

        for (key, mut rows) in groups {
            rows.sort_by(|a, b| {
                a.txn
                    .timestamp
                    .cmp(&b.txn.timestamp)
                    .then_with(|| a.txn.transaction_id.cmp(&b.txn.transaction_id))
            });

            let group_label = key.join("|");
            let customer_id = match customer_pos {
                Some(i) => key[i].clone(),
                None => group_label.clone(),
            };

            // Threshold stage.
            let customer = by_customer.get(customer_id.as_str()).copied();
            let Some(threshold) = resolve_threshold(scenario, customer) else {
                stats.unresolved_thresholds += 1;
                log::debug!(
                    "scenario={} group={} threshold unresolved, skipping group",
                    scenario.scenario_id,
                    group_label
                );
                continue;
            };

            for window in windows(&rows, agg.window) {
                stats.windows_evaluated += 1;
                let slice = &rows[window.range.clone()];
                let values: Vec<f64> = slice.iter().map(|r| r.value).collect();
                let aggregated = agg.method.apply(&values);
                if !aggregated.is_finite() || aggregated <= threshold {
                    continue;
                }
                if !passes_condition(scenario, aggregated) {
                    continue;
                }

                let group_key = agg
                    .group_by
                    .iter()
                    .cloned()
                    .zip(key.iter().cloned())
                    .collect();
                alerts.push(Alert {
                    alert_id: format!(
                        "ALR-{}-{}-{}",
                        scenario.scenario_id,
                        group_label,
                        window.end.format("%Y%m%d")
                    ),
                    scenario_id: scenario.scenario_id.clone(),
                    scenario_name: scenario.name.clone(),
                    customer_id: customer_id.clone(),
                    window_start: window.start,
                    alert_date: window.end,
                    aggregated_value: aggregated,
                    threshold,
                    risk_class: self.breakpoints.classify(aggregated, threshold),
                    trigger_details: TriggerDetails {
                        group_key,
                        method: agg.method.as_str().into(),
                        field: agg.field.clone(),
                        threshold_kind: scenario.threshold.kind().into(),
                        transaction_count: slice.len(),
                        transaction_ids: slice.iter().map(|r| r.txn.transaction_id.clone()).collect(),
                    },
                });
            }
        }

        if stats.skipped_rows > 0 {
            let issue = AmlError::DataQuality {
                stage: "filter/aggregate".into(),
                message: format!(
                    "{} rows failed field lookup or coercion and were skipped",
                    stats.skipped_rows
                ),
            };
            log::warn!("scenario={} {}", scenario.scenario_id, issue);
        }
        log::debug!(
            "scenario={} rows={} filtered={} groups={} windows={} alerts={}",
            scenario.scenario_id,
            stats.input_rows,
            stats.filtered_rows,
            stats.groups,
            stats.windows_evaluated,
            alerts.len()
        );

        ScenarioOutput { alerts, stats }
    }
}

/// Field lookup for one row: transaction first, then its customer. Field
/// mappings are applied before either lookup.
pub fn lookup(
    scenario: &ScenarioDefinition,
    txn: &Transaction,
    customer: Option<&Customer>,
    field: &str,
) -> Option<FieldValue> {
    let column = scenario.resolve_field(field);
    txn.field(column)
        .or_else(|| customer.and_then(|c| c.field(column)))
}

/// `Some(true)` if every filter holds, `Some(false)` if one is false,
/// `None` if a filter could not be evaluated against this row.
fn passes_filters(
    scenario: &ScenarioDefinition,
    txn: &Transaction,
    customer: Option<&Customer>,
) -> Option<bool> {
    for filter in &scenario.filters {
        let value = lookup(scenario, txn, customer, &filter.field)?;
        if !filter.evaluate(&value)? {
            return Some(false);
        }
    }
    Some(true)
}

/// The optional alert condition; a condition that cannot be evaluated
/// holds the alert back.
fn passes_condition(scenario: &ScenarioDefinition, aggregated: f64) -> bool {
    let Some(condition) = &scenario.alert_condition else {
        return true;
    };
    match condition.evaluate_condition(aggregated) {
        Ok(holds) => holds,
        Err(e) => {
            log::debug!(
                "scenario={} alert condition '{}' failed for {}: {}",
                scenario.scenario_id,
                condition.source(),
                aggregated,
                e
            );
            false
        }
    }
}

fn resolve_threshold(scenario: &ScenarioDefinition, customer: Option<&Customer>) -> Option<f64> {
    match &scenario.threshold {
        Threshold::Fixed { value } => Some(*value),
        Threshold::FieldBased {
            reference_field,
            formula,
        } => {
            let column = scenario.resolve_field(reference_field);
            let reference = customer?.field(column)?.as_f64()?;
            match formula.evaluate(reference) {
                Ok(v) => Some(v),
                Err(e) => {
                    log::debug!(
                        "scenario={} formula '{}' failed for reference {}: {}",
                        scenario.scenario_id,
                        formula.source(),
                        reference,
                        e
                    );
                    None
                }
            }
        }
        Threshold::SegmentBased {
            segment_field,
            values,
            default,
        } => {
            let column = scenario.resolve_field(segment_field);
            let segment = customer.and_then(|c| c.field(column)).map(|v| v.to_string());
            Some(
                segment
                    .and_then(|s| values.get(&s).copied())
                    .unwrap_or(*default),
            )
        }
    }
}

// ── Windows ──────────────────────────────────────────────────────────────────

struct Window {
    start: NaiveDate,
    end: NaiveDate,
    range: std::ops::Range<usize>,
}

/// Split date-sorted rows into aggregation windows.
fn windows(rows: &[Row], window: Option<TimeWindow>) -> Vec<Window> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    match window {
        None => {
            let last = rows[rows.len() - 1].date;
            vec![Window {
                start: first.date,
                end: last,
                range: 0..rows.len(),
            }]
        }
        Some(TimeWindow::Rolling { days }) => rolling_windows(rows, days),
        Some(TimeWindow::RollingMonths { months }) => rolling_month_windows(rows, months),
        Some(TimeWindow::CalendarDays { days }) => bucketed(rows, |d| day_bucket(d, days)),
        Some(TimeWindow::CalendarMonths { months }) => bucketed(rows, |d| month_bucket(d, months)),
    }
}

/// One window per distinct date d, covering (d - days, d]. A zero span is
/// treated as one day.
fn rolling_windows(rows: &[Row], days: u32) -> Vec<Window> {
    let span = Duration::days(i64::from(days.max(1)));
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < rows.len() {
        let end_date = rows[i].date;
        let mut end = i;
        while end < rows.len() && rows[end].date == end_date {
            end += 1;
        }
        let window_start = end_date - span + Duration::days(1);
        while start < end && rows[start].date < window_start {
            start += 1;
        }
        out.push(Window {
            start: window_start,
            end: end_date,
            range: start..end,
        });
        i = end;
    }
    out
}

/// One window per calendar month m from the group's first month to its last,
/// covering months (m - months, m] and dated at the end of m. Months with no
/// rows in the trailing span produce no window.
fn rolling_month_windows(rows: &[Row], months: u32) -> Vec<Window> {
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return Vec::new();
    };
    let span = i64::from(months.max(1));
    let mut out = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for m in month_index(first.date)..=month_index(last.date) {
        while end < rows.len() && month_index(rows[end].date) <= m {
            end += 1;
        }
        let from = m - span + 1;
        while start < end && month_index(rows[start].date) < from {
            start += 1;
        }
        if start == end {
            continue;
        }
        let (Some(window_start), Some(window_end)) = (month_start(from), month_end(m)) else {
            continue;
        };
        out.push(Window {
            start: window_start,
            end: window_end,
            range: start..end,
        });
    }
    out
}

fn bucketed(rows: &[Row], bucket: impl Fn(NaiveDate) -> (NaiveDate, NaiveDate)) -> Vec<Window> {
    let mut out: Vec<Window> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let (start, end) = bucket(row.date);
        match out.last_mut() {
            Some(w) if w.start == start => w.range.end = i + 1,
            _ => out.push(Window {
                start,
                end,
                range: i..i + 1,
            }),
        }
    }
    out
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn day_bucket(date: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let n = i64::from(days.max(1));
    let offset = (date - epoch()).num_days().div_euclid(n) * n;
    let start = epoch() + Duration::days(offset);
    (start, start + Duration::days(n - 1))
}

/// Months since year 0, so that month arithmetic is plain integer math.
fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn month_start(index: i64) -> Option<NaiveDate> {
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = u32::try_from(index.rem_euclid(12)).ok()? + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn month_end(index: i64) -> Option<NaiveDate> {
    month_start(index + 1).map(|next| next - Duration::days(1))
}

fn month_bucket(date: NaiveDate, months: u32) -> (NaiveDate, NaiveDate) {
    let n = i64::from(months.max(1));
    let epoch_month = month_index(epoch());
    let first = epoch_month + (month_index(date) - epoch_month).div_euclid(n) * n;
    let start = month_start(first).unwrap_or(date);
    let end = month_end(first + n - 1).unwrap_or(date);
    (start, end)
}

/// Convenience wrapper with explicit breakpoints.
pub fn execute(
    scenario: &ScenarioDefinition,
    transactions: &[Transaction],
    customers: &[Customer],
    breakpoints: RiskClassBreakpoints,
) -> Vec<Alert> {
    ScenarioEngine::new(breakpoints)
        .execute(scenario, transactions, customers)
        .alerts
}
