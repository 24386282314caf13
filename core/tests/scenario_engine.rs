//! Scenario engine: filters, aggregation windows and the three threshold kinds.

use amlsim_core::{
    config::RiskClassBreakpoints,
    error::AmlError,
    model::{Alert, Customer, RiskClass, Transaction},
    scenario::{ScenarioConfig, ScenarioDefinition, TimeWindow},
    scenario_engine::{execute, ScenarioEngine},
    types::FieldValue,
};
use chrono::{Duration, NaiveDate};
use serde_json::json;

fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
}

fn txn(id: &str, customer: &str, on: i64, amount: f64) -> Transaction {
    Transaction {
        transaction_id: id.into(),
        customer_id: customer.into(),
        timestamp: day(on).and_hms_opt(10, 0, 0).unwrap(),
        amount,
        narrative: "Online transfer".into(),
        beneficiary: None,
        channel: Some("ONLINE".into()),
        transaction_type: Some("DEBIT".into()),
        batch_id: None,
        expires_at: None,
        attributes: Default::default(),
    }
}

fn customer(id: &str, segment: Option<&str>, income: Option<f64>) -> Customer {
    let mut c = Customer::new(id);
    c.name = Some(format!("Customer {id}"));
    c.segment = segment.map(String::from);
    c.annual_income = income;
    c
}

fn definition(value: serde_json::Value) -> ScenarioDefinition {
    let config: ScenarioConfig = serde_json::from_value(value).expect("scenario json");
    ScenarioDefinition::try_from_config(&config).expect("valid scenario")
}

fn config_error(value: serde_json::Value) -> AmlError {
    let config: ScenarioConfig = serde_json::from_value(value).expect("scenario json");
    ScenarioDefinition::try_from_config(&config).expect_err("scenario should be rejected")
}

fn fixed_rolling(threshold: f64, days: u32) -> ScenarioDefinition {
    definition(json!({
        "scenario_id": "S1",
        "scenario_name": "Rolling sum",
        "aggregation": {
            "method": "sum",
            "field": "amount",
            "group_by": ["customer_id"],
            "time_window": { "value": days, "unit": "days", "type": "rolling" }
        },
        "threshold": { "type": "fixed", "fixed_value": threshold }
    }))
}

fn segment_scenario() -> ScenarioDefinition {
    definition(json!({
        "scenario_id": "SEG",
        "scenario_name": "Segment volume",
        "aggregation": { "method": "sum", "field": "amount", "group_by": ["customer_id"] },
        "threshold": {
            "type": "segment_based",
            "segment_based": {
                "segment_field": "segment",
                "values": { "Student": 2000 },
                "default": 5000
            }
        }
    }))
}

fn income_scenario() -> ScenarioDefinition {
    definition(json!({
        "scenario_id": "INC",
        "scenario_name": "Income multiple",
        "aggregation": { "method": "sum", "field": "amount", "group_by": ["customer_id"] },
        "threshold": {
            "type": "field_based",
            "field_based": {
                "reference_field": "annual_income",
                "calculation": "reference_field / 12 * 3"
            }
        }
    }))
}

/// 99 small payments over days 0..19, then one that lifts the window to 10500.
fn ramp_to_10500() -> Vec<Transaction> {
    let mut txns: Vec<Transaction> = (0..99)
        .map(|i| txn(&format!("T{i:03}"), "C001", i % 20, 95.0))
        .collect();
    txns.push(txn("T099", "C001", 20, 1095.0));
    txns
}

fn ids(alerts: &[Alert]) -> Vec<&str> {
    alerts.iter().map(|a| a.alert_id.as_str()).collect()
}

// ── Worked scenarios ─────────────────────────────────────────────────────────

/// One customer, 100 transactions, the 30-day sum reaches 10500 on day 20.
#[test]
fn rolling_sum_alerts_once_on_the_crossing_day() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scenario = fixed_rolling(10_000.0, 30);
    let txns = ramp_to_10500();
    assert_eq!(txns.len(), 100);
    let customers = vec![customer("C001", Some("Retail"), None)];

    let breakpoints = RiskClassBreakpoints {
        medium_ratio: 1.0,
        high_ratio: 2.0,
    };
    let alerts = execute(&scenario, &txns, &customers, breakpoints);

    assert_eq!(alerts.len(), 1, "exactly one window crosses 10000");
    let alert = &alerts[0];
    assert_eq!(alert.alert_date, day(20));
    assert_eq!(alert.aggregated_value, 10_500.0);
    assert_eq!(alert.threshold, 10_000.0);
    assert_eq!(alert.risk_class, RiskClass::Medium);
    assert_eq!(alert.customer_id, "C001");
    assert_eq!(alert.alert_id, "ALR-S1-C001-20240121");
    assert_eq!(alert.trigger_details.transaction_count, 100);
    assert_eq!(alert.trigger_details.threshold_kind, "fixed");
}

#[test]
fn risk_class_follows_configured_breakpoints() {
    let scenario = fixed_rolling(10_000.0, 30);
    let txns = ramp_to_10500();
    let customers = vec![customer("C001", None, None)];

    let low = execute(&scenario, &txns, &customers, RiskClassBreakpoints::default());
    assert_eq!(low[0].risk_class, RiskClass::Low, "ratio 1.05 is LOW by default");

    let high = execute(
        &scenario,
        &txns,
        &customers,
        RiskClassBreakpoints {
            medium_ratio: 1.01,
            high_ratio: 1.02,
        },
    );
    assert_eq!(high[0].risk_class, RiskClass::High);
}

#[test]
fn segment_threshold_uses_segment_then_default() {
    let scenario = segment_scenario();
    let customers = vec![
        customer("C1", Some("Student"), None),
        customer("C2", Some("Freelancer"), None),
        customer("C3", None, None),
    ];
    let txns = vec![
        txn("T1", "C1", 0, 1500.0),
        txn("T2", "C1", 3, 1000.0),
        txn("T3", "C2", 1, 4000.0),
        txn("T4", "C3", 2, 5200.0),
    ];

    let alerts = execute(&scenario, &txns, &customers, RiskClassBreakpoints::default());
    let by_customer: Vec<(&str, f64)> = alerts
        .iter()
        .map(|a| (a.customer_id.as_str(), a.threshold))
        .collect();

    assert_eq!(
        by_customer,
        vec![("C1", 2000.0), ("C3", 5000.0)],
        "student 2500 > 2000 alerts, unlisted 4000 < 5000 does not, missing segment uses default"
    );
    assert_eq!(alerts[0].aggregated_value, 2500.0);
    assert_eq!(alerts[0].window_start, day(0));
    assert_eq!(alerts[0].alert_date, day(3));
}

#[test]
fn field_based_threshold_evaluates_formula_per_customer() {
    let scenario = income_scenario();
    let customers = vec![
        customer("C1", None, Some(48_000.0)),
        customer("C2", None, Some(120_000.0)),
    ];
    let txns = vec![
        txn("T1", "C1", 0, 13_000.0),
        txn("T2", "C2", 0, 13_000.0),
    ];

    let alerts = execute(&scenario, &txns, &customers, RiskClassBreakpoints::default());
    assert_eq!(ids(&alerts), vec!["ALR-INC-C1-20240101"]);
    assert_eq!(alerts[0].threshold, 12_000.0);
    assert_eq!(alerts[0].trigger_details.threshold_kind, "field_based");
}

#[test]
fn formula_may_name_the_reference_field_directly() {
    let scenario = definition(json!({
        "scenario_id": "INC2",
        "scenario_name": "Income named directly",
        "aggregation": { "method": "sum", "group_by": ["customer_id"] },
        "threshold": {
            "type": "customer_based",
            "field_based": { "reference_field": "annual_income", "calculation": "annual_income / 12" }
        }
    }));
    let customers = vec![customer("C1", None, Some(24_000.0))];
    let alerts = execute(
        &scenario,
        &[txn("T1", "C1", 0, 2_500.0)],
        &customers,
        RiskClassBreakpoints::default(),
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].threshold, 2_000.0);
}

// ── Strict exceedance ────────────────────────────────────────────────────────

#[test]
fn equality_never_alerts_for_any_threshold_kind() {
    let bp = RiskClassBreakpoints::default();

    let fixed = fixed_rolling(1_000.0, 30);
    let c = vec![customer("C1", Some("Student"), Some(48_000.0))];
    assert!(execute(&fixed, &[txn("T1", "C1", 0, 1_000.0)], &c, bp).is_empty());
    assert_eq!(execute(&fixed, &[txn("T1", "C1", 0, 1_000.01)], &c, bp).len(), 1);

    let income = income_scenario();
    assert!(execute(&income, &[txn("T1", "C1", 0, 12_000.0)], &c, bp).is_empty());
    assert_eq!(execute(&income, &[txn("T1", "C1", 0, 12_000.01)], &c, bp).len(), 1);

    let segment = segment_scenario();
    assert!(execute(&segment, &[txn("T1", "C1", 0, 2_000.0)], &c, bp).is_empty());
    assert_eq!(execute(&segment, &[txn("T1", "C1", 0, 2_000.01)], &c, bp).len(), 1);
}

// ── Fail-closed behaviour ────────────────────────────────────────────────────

#[test]
fn missing_reference_value_fails_the_group_closed() {
    let scenario = income_scenario();
    let customers = vec![customer("C1", None, None), customer("C2", None, Some(4_000.0))];
    let txns = vec![
        txn("T1", "C1", 0, 1_000_000.0),
        txn("T2", "C2", 0, 5_000.0),
    ];

    let output = ScenarioEngine::new(RiskClassBreakpoints::default()).execute(&scenario, &txns, &customers);
    assert_eq!(ids(&output.alerts), vec!["ALR-INC-C2-20240101"]);
    assert_eq!(output.stats.unresolved_thresholds, 1);
}

#[test]
fn rows_missing_a_filter_field_are_skipped_and_counted() {
    let scenario = definition(json!({
        "scenario_id": "MCC",
        "scenario_name": "Merchant code filter",
        "filters": [ { "field": "mcc", "operator": ">", "value": 5000 } ],
        "aggregation": { "method": "sum", "group_by": ["customer_id"] },
        "threshold": { "type": "fixed", "fixed_value": 100 }
    }));
    let mut with_code = txn("T1", "C1", 0, 500.0);
    with_code.attributes.insert("mcc".into(), FieldValue::Number(6011.0));
    let mut bad_code = txn("T2", "C1", 0, 500.0);
    bad_code.attributes.insert("mcc".into(), FieldValue::Text("n/a".into()));
    let no_code = txn("T3", "C1", 0, 500.0);

    let output = ScenarioEngine::new(RiskClassBreakpoints::default()).execute(
        &scenario,
        &[with_code, bad_code, no_code],
        &[customer("C1", None, None)],
    );
    assert_eq!(output.stats.input_rows, 3);
    assert_eq!(output.stats.filtered_rows, 1);
    assert_eq!(output.stats.skipped_rows, 2);
    assert_eq!(output.alerts.len(), 1);
    assert_eq!(output.alerts[0].aggregated_value, 500.0);
}

#[test]
fn empty_inputs_yield_no_alerts() {
    let scenario = fixed_rolling(1.0, 30);
    let bp = RiskClassBreakpoints::default();
    assert!(execute(&scenario, &[], &[customer("C1", None, None)], bp).is_empty());
    assert!(execute(&scenario, &[txn("T1", "C1", 0, 50.0)], &[], bp).is_empty());
}

// ── Filters ──────────────────────────────────────────────────────────────────

/// Adding a filter can only remove rows, so it can only remove or shrink alerts.
#[test]
fn adding_a_filter_never_adds_alerts() {
    let mut txns = Vec::new();
    for i in 0..30 {
        let mut t = txn(&format!("T{i:02}"), if i % 2 == 0 { "C1" } else { "C2" }, i, 400.0);
        if i % 3 == 0 {
            t.transaction_type = Some("CREDIT".into());
        }
        if i % 5 == 0 {
            t.channel = Some("ATM".into());
        }
        txns.push(t);
    }
    let customers = vec![customer("C1", None, None), customer("C2", None, None)];
    let bp = RiskClassBreakpoints::default();

    let base = json!({
        "scenario_id": "F",
        "scenario_name": "Filtered",
        "aggregation": {
            "method": "sum",
            "group_by": ["customer_id"],
            "time_window": { "value": 10, "unit": "days", "type": "rolling" }
        },
        "threshold": { "type": "fixed", "fixed_value": 1500 }
    });
    let mut one = base.clone();
    one["filters"] = json!([{ "field": "transaction_type", "operator": "==", "value": "DEBIT" }]);
    let mut two = one.clone();
    two["filters"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "field": "channel", "operator": "not_equals", "value": "ATM" }));

    let a0 = execute(&definition(base), &txns, &customers, bp);
    let a1 = execute(&definition(one), &txns, &customers, bp);
    let a2 = execute(&definition(two), &txns, &customers, bp);

    assert!(!a0.is_empty());
    for (narrow, wide) in [(&a1, &a0), (&a2, &a1)] {
        assert!(narrow.len() <= wide.len());
        for alert in narrow.iter() {
            let wider = wide
                .iter()
                .find(|w| w.alert_id == alert.alert_id)
                .expect("a narrower filter set must not invent a window");
            assert!(alert.aggregated_value <= wider.aggregated_value);
        }
    }
}

#[test]
fn in_and_contains_operators() {
    let scenario = definition(json!({
        "scenario_id": "OPS",
        "scenario_name": "Operators",
        "filters": [
            { "field": "channel", "operator": "in", "value": ["ATM", "POS"] },
            { "field": "narrative", "operator": "contains", "value": "cash" }
        ],
        "aggregation": { "method": "count", "field": "transaction_id", "group_by": ["customer_id"] },
        "threshold": { "type": "fixed", "fixed_value": 1 }
    }));
    let mut txns = Vec::new();
    for (i, (channel, narrative)) in [
        ("ATM", "cash withdrawal"),
        ("POS", "cashback"),
        ("ONLINE", "cash transfer"),
        ("ATM", "Cash withdrawal"),
    ]
    .iter()
    .enumerate()
    {
        let mut t = txn(&format!("T{i}"), "C1", 0, 100.0);
        t.channel = Some(channel.to_string());
        t.narrative = narrative.to_string();
        txns.push(t);
    }

    let alerts = execute(&scenario, &txns, &[customer("C1", None, None)], RiskClassBreakpoints::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].aggregated_value, 2.0, "contains is case-sensitive");
    assert_eq!(alerts[0].trigger_details.transaction_ids, vec!["T0", "T1"]);
}

#[test]
fn field_mappings_redirect_to_source_columns() {
    let scenario = definition(json!({
        "scenario_id": "MAP",
        "scenario_name": "Mapped columns",
        "filters": [ { "field": "transaction_type", "operator": "==", "value": "WIRE" } ],
        "aggregation": { "method": "sum", "field": "amount", "group_by": ["customer_id"] },
        "threshold": { "type": "fixed", "fixed_value": 900 },
        "field_mappings": { "transaction_type": "txn_kind", "amount": "amount_usd" }
    }));
    let mut wire = txn("T1", "C1", 0, 1.0);
    wire.attributes.insert("txn_kind".into(), "WIRE".into());
    wire.attributes.insert("amount_usd".into(), FieldValue::Number(1_000.0));
    let mut other = txn("T2", "C1", 0, 1.0);
    other.attributes.insert("txn_kind".into(), "ACH".into());
    other.attributes.insert("amount_usd".into(), FieldValue::Number(5_000.0));

    let alerts = execute(&scenario, &[wire, other], &[customer("C1", None, None)], RiskClassBreakpoints::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].aggregated_value, 1_000.0);
}

// ── Windows ──────────────────────────────────────────────────────────────────

#[test]
fn rolling_window_drops_rows_older_than_the_span() {
    let scenario = fixed_rolling(1_000.0, 7);
    let txns = vec![
        txn("T1", "C1", 0, 600.0),
        txn("T2", "C1", 7, 600.0),
        txn("T3", "C1", 8, 600.0),
    ];
    let alerts = execute(&scenario, &txns, &[customer("C1", None, None)], RiskClassBreakpoints::default());

    // Day 7 covers days 1..=7, so day 0 has already left the window.
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_date, day(8));
    assert_eq!(alerts[0].window_start, day(2));
    assert_eq!(alerts[0].aggregated_value, 1_200.0);
}

#[test]
fn calendar_month_windows_alert_at_month_end() {
    let scenario = definition(json!({
        "scenario_id": "MON",
        "scenario_name": "Monthly",
        "aggregation": {
            "method": "sum",
            "group_by": ["customer_id"],
            "time_window": { "value": 1, "unit": "months", "type": "calendar" }
        },
        "threshold": { "type": "fixed", "fixed_value": 5000 }
    }));
    let txns = vec![
        txn("T1", "C1", 2, 3_000.0),
        txn("T2", "C1", 29, 3_000.0),
        txn("T3", "C1", 33, 3_000.0),
    ];
    let alerts = execute(&scenario, &txns, &[customer("C1", None, None)], RiskClassBreakpoints::default());

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].window_start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    assert_eq!(alerts[0].alert_date, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
    assert_eq!(alerts[0].aggregated_value, 6_000.0);
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn dated(id: &str, date: NaiveDate, amount: f64) -> Transaction {
    let mut t = txn(id, "C1", 0, amount);
    t.timestamp = date.and_hms_opt(9, 30, 0).unwrap();
    t
}

/// Three-month rolling sums are evaluated at every month end from the
/// first month to the last, including months with no activity of their own.
#[test]
fn rolling_month_windows_sum_trailing_months() {
    let scenario = definition(json!({
        "scenario_id": "M3",
        "scenario_name": "Quarterly rolling",
        "aggregation": {
            "method": "sum",
            "group_by": ["customer_id"],
            "time_window": { "value": 3, "unit": "months", "type": "rolling" }
        },
        "threshold": { "type": "fixed", "fixed_value": 6500 }
    }));
    let txns = vec![
        dated("T1", ymd(2024, 1, 15), 4_000.0),
        dated("T2", ymd(2024, 2, 10), 4_000.0),
        dated("T3", ymd(2024, 3, 5), 3_000.0),
        dated("T4", ymd(2024, 5, 20), 1_000.0),
    ];
    let alerts = execute(&scenario, &txns, &[customer("C1", None, None)], RiskClassBreakpoints::default());

    assert_eq!(
        ids(&alerts),
        vec!["ALR-M3-C1-20240229", "ALR-M3-C1-20240331", "ALR-M3-C1-20240430"]
    );
    let values: Vec<f64> = alerts.iter().map(|a| a.aggregated_value).collect();
    assert_eq!(values, vec![8_000.0, 11_000.0, 7_000.0]);
    assert_eq!(alerts[0].window_start, ymd(2023, 12, 1));
    assert_eq!(alerts[2].window_start, ymd(2024, 2, 1));
    assert_eq!(alerts[2].trigger_details.transaction_ids, vec!["T2", "T3"]);
}

/// The income formula is three months of income, so it pairs naturally
/// with a three-month window.
#[test]
fn rolling_months_with_income_threshold() {
    let scenario = definition(json!({
        "scenario_id": "INC3",
        "scenario_name": "Three months of income",
        "aggregation": {
            "method": "sum",
            "group_by": ["customer_id"],
            "time_window": { "value": 3, "unit": "months", "type": "rolling" }
        },
        "threshold": {
            "type": "field_based",
            "field_based": {
                "reference_field": "annual_income",
                "calculation": "reference_field / 12 * 3"
            }
        }
    }));
    let txns = vec![
        dated("T1", ymd(2024, 4, 2), 5_000.0),
        dated("T2", ymd(2024, 5, 2), 5_000.0),
        dated("T3", ymd(2024, 6, 2), 2_500.0),
    ];
    let alerts = execute(
        &scenario,
        &txns,
        &[customer("C1", None, Some(48_000.0))],
        RiskClassBreakpoints::default(),
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_date, ymd(2024, 6, 30));
    assert_eq!(alerts[0].threshold, 12_000.0);
    assert_eq!(alerts[0].aggregated_value, 12_500.0);
}

#[test]
fn calendar_multi_month_buckets_align_to_quarters() {
    let scenario = definition(json!({
        "scenario_id": "Q",
        "scenario_name": "Quarterly",
        "aggregation": {
            "method": "sum",
            "group_by": ["customer_id"],
            "time_window": { "value": 3, "unit": "months", "type": "calendar" }
        },
        "threshold": { "type": "fixed", "fixed_value": 6000 }
    }));
    let txns = vec![
        dated("T1", ymd(2024, 1, 15), 4_000.0),
        dated("T2", ymd(2024, 3, 5), 3_000.0),
        dated("T3", ymd(2024, 4, 2), 5_000.0),
    ];
    let alerts = execute(&scenario, &txns, &[customer("C1", None, None)], RiskClassBreakpoints::default());

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].window_start, ymd(2024, 1, 1));
    assert_eq!(alerts[0].alert_date, ymd(2024, 3, 31));
    assert_eq!(alerts[0].aggregated_value, 7_000.0);
}

/// A hand-built zero-length window behaves as the shortest valid one.
#[test]
fn zero_length_windows_are_clamped() {
    let txns = vec![
        txn("T1", "C1", 0, 600.0),
        txn("T2", "C1", 1, 600.0),
        txn("T3", "C1", 1, 600.0),
    ];
    let customers = vec![customer("C1", None, None)];

    let mut days = fixed_rolling(1_000.0, 7);
    days.aggregation.window = Some(TimeWindow::Rolling { days: 0 });
    let alerts = execute(&days, &txns, &customers, RiskClassBreakpoints::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].window_start, day(1));
    assert_eq!(alerts[0].aggregated_value, 1_200.0);

    let mut months = fixed_rolling(1_000.0, 7);
    months.aggregation.window = Some(TimeWindow::RollingMonths { months: 0 });
    let alerts = execute(&months, &txns, &customers, RiskClassBreakpoints::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].aggregated_value, 1_800.0);
}

#[test]
fn alert_condition_gates_after_the_threshold() {
    let scenario = definition(json!({
        "scenario_id": "BAND",
        "scenario_name": "Mid band",
        "aggregation": { "method": "sum", "group_by": ["customer_id"] },
        "threshold": { "type": "fixed", "fixed_value": 1000 },
        "alert_condition": { "expression": "aggregated_value < 5000" }
    }));
    let txns = vec![
        txn("T1", "C1", 0, 2_000.0),
        txn("T2", "C2", 0, 9_000.0),
        txn("T3", "C3", 0, 500.0),
    ];
    let customers = vec![
        customer("C1", None, None),
        customer("C2", None, None),
        customer("C3", None, None),
    ];
    let alerts = execute(&scenario, &txns, &customers, RiskClassBreakpoints::default());
    let who: Vec<&str> = alerts.iter().map(|a| a.customer_id.as_str()).collect();
    assert_eq!(who, vec!["C1"], "C2 fails the condition, C3 never crosses the threshold");
}

#[test]
fn no_window_aggregates_the_whole_range() {
    let scenario = segment_scenario();
    let txns = vec![txn("T1", "C1", 0, 3_000.0), txn("T2", "C1", 80, 3_000.0)];
    let alerts = execute(&scenario, &txns, &[customer("C1", None, None)], RiskClassBreakpoints::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].window_start, day(0));
    assert_eq!(alerts[0].alert_date, day(80));
}

#[test]
fn aggregation_methods() {
    let txns = vec![
        txn("T1", "C1", 0, 100.0),
        txn("T2", "C1", 1, 300.0),
        txn("T3", "C1", 2, 200.0),
    ];
    let customers = vec![customer("C1", None, None)];
    let run = |method: &str| {
        let scenario = definition(json!({
            "scenario_id": "AGG",
            "scenario_name": "Aggregation",
            "aggregation": { "method": method, "group_by": ["customer_id"] },
            "threshold": { "type": "fixed", "fixed_value": 0 }
        }));
        execute(&scenario, &txns, &customers, RiskClassBreakpoints::default())[0].aggregated_value
    };
    assert_eq!(run("sum"), 600.0);
    assert_eq!(run("count"), 3.0);
    assert_eq!(run("avg"), 200.0);
    assert_eq!(run("max"), 300.0);
    assert_eq!(run("min"), 100.0);
}

// ── Configuration validation ─────────────────────────────────────────────────

#[test]
fn malformed_scenarios_are_rejected_at_definition_time() {
    let two_thresholds = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Two payloads",
        "aggregation": { "method": "sum" },
        "threshold": {
            "type": "fixed",
            "fixed_value": 10,
            "segment_based": { "segment_field": "segment", "values": {}, "default": 1 }
        }
    }));
    assert_eq!(two_thresholds.kind(), "configuration");

    let no_customer_key = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Segment without customer",
        "aggregation": { "method": "sum", "group_by": ["channel"] },
        "threshold": {
            "type": "segment_based",
            "segment_based": { "segment_field": "segment", "values": {}, "default": 1 }
        }
    }));
    assert_eq!(no_customer_key.kind(), "configuration");

    let in_scalar = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "In with scalar",
        "filters": [ { "field": "channel", "operator": "in", "value": "ATM" } ],
        "aggregation": { "method": "sum" },
        "threshold": { "type": "fixed", "fixed_value": 10 }
    }));
    assert_eq!(in_scalar.kind(), "configuration");

    let numeric_text = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Numeric op on text",
        "filters": [ { "field": "amount", "operator": ">", "value": "big" } ],
        "aggregation": { "method": "sum" },
        "threshold": { "type": "fixed", "fixed_value": 10 }
    }));
    assert_eq!(numeric_text.kind(), "configuration");

    let weeks = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Rolling weeks",
        "aggregation": {
            "method": "sum",
            "time_window": { "value": 2, "unit": "weeks", "type": "rolling" }
        },
        "threshold": { "type": "fixed", "fixed_value": 10 }
    }));
    assert_eq!(weeks.kind(), "configuration");

    let zero_months = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Empty window",
        "aggregation": {
            "method": "sum",
            "time_window": { "value": 0, "unit": "months", "type": "rolling" }
        },
        "threshold": { "type": "fixed", "fixed_value": 10 }
    }));
    assert_eq!(zero_months.kind(), "configuration");

    let not_a_comparison = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Arithmetic condition",
        "aggregation": { "method": "sum" },
        "threshold": { "type": "fixed", "fixed_value": 10 },
        "alert_condition": { "expression": "aggregated_value * 2" }
    }));
    assert_eq!(not_a_comparison.kind(), "configuration");

    let foreign_name = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Condition on another name",
        "aggregation": { "method": "sum" },
        "threshold": { "type": "fixed", "fixed_value": 10 },
        "alert_condition": { "expression": "reference_field > 1" }
    }));
    assert_eq!(foreign_name.kind(), "evaluation");

    let unknown_method = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Median",
        "aggregation": { "method": "median" },
        "threshold": { "type": "fixed", "fixed_value": 10 }
    }));
    assert_eq!(unknown_method.kind(), "configuration");
}

#[test]
fn unsafe_formula_is_an_evaluation_error() {
    let err = config_error(json!({
        "scenario_id": "X",
        "scenario_name": "Unsafe",
        "aggregation": { "method": "sum" },
        "threshold": {
            "type": "field_based",
            "field_based": {
                "reference_field": "annual_income",
                "calculation": "__import__('os').system('true')"
            }
        }
    }));
    assert_eq!(err.kind(), "evaluation");
}
