//! Scenario definitions.
//!
//! Two shapes live here:
//!   - `ScenarioConfig`: the serde shape authored in JSON. Loose on purpose,
//!     it mirrors what rule authors write.
//!   - `ScenarioDefinition`: the validated shape the engine executes. Filter
//!     operators are typed, exactly one threshold variant exists and field
//!     formulas are already parsed.
//!
//! RULE: The scenario engine only ever sees `ScenarioDefinition`. Every
//! configuration mistake is rejected in `try_from_config`, not mid-run.

use crate::{
    error::{AmlError, AmlResult},
    expr::Formula,
    types::{FieldValue, ScenarioId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name a field-based formula uses for the customer's reference value.
pub const REFERENCE_VARIABLE: &str = "reference_field";

/// Name an alert condition uses for the window's aggregated value.
pub const CONDITION_VARIABLE: &str = "aggregated_value";

// ── Raw configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub scenario_id: ScenarioId,
    pub scenario_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    pub aggregation: AggregationConfig,
    pub threshold: ThresholdConfig,
    /// Extra gate applied after the threshold, e.g. `aggregated_value < 250000`.
    #[serde(default)]
    pub alert_condition: Option<AlertConditionConfig>,
    /// System field name -> source column name.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub method: String,
    #[serde(default = "default_agg_field")]
    pub field: String,
    #[serde(default = "default_group_by")]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub time_window: Option<TimeWindowConfig>,
}

fn default_agg_field() -> String {
    "amount".into()
}

fn default_group_by() -> Vec<String> {
    vec!["customer_id".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowConfig {
    pub value: u32,
    pub unit: String, // "days" | "months"
    #[serde(rename = "type", default = "default_window_type")]
    pub window_type: String, // "rolling" | "calendar"
}

fn default_window_type() -> String {
    "rolling".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConditionConfig {
    pub expression: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(rename = "type")]
    pub threshold_type: String, // "fixed" | "field_based" | "segment_based"
    #[serde(default)]
    pub fixed_value: Option<f64>,
    #[serde(default)]
    pub field_based: Option<FieldBasedConfig>,
    #[serde(default)]
    pub segment_based: Option<SegmentBasedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldBasedConfig {
    pub reference_field: String,
    pub calculation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentBasedConfig {
    pub segment_field: String,
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub default: f64,
}

// ── Validated definition ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    Contains,
}

impl FilterOp {
    /// Accepts both the symbolic form and the word aliases rule authors
    /// tend to write ("greater_than", "equals", ...).
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "==" | "=" | "eq" | "equals" => FilterOp::Eq,
            "!=" | "ne" | "not_equals" => FilterOp::Ne,
            ">" | "gt" | "greater_than" => FilterOp::Gt,
            "<" | "lt" | "less_than" => FilterOp::Lt,
            ">=" | "ge" | "greater_than_or_equal" => FilterOp::Ge,
            "<=" | "le" | "less_than_or_equal" => FilterOp::Le,
            "in" => FilterOp::In,
            "contains" => FilterOp::Contains,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(FieldValue),
    Set(Vec<FieldValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl Filter {
    /// Apply the predicate to one row's value.
    ///
    /// `None` means the row could not be evaluated (type coercion failed);
    /// the caller excludes such rows and counts them as skipped.
    pub fn evaluate(&self, actual: &FieldValue) -> Option<bool> {
        match (&self.op, &self.value) {
            (FilterOp::Eq, FilterValue::Scalar(expected)) => Some(values_equal(actual, expected)),
            (FilterOp::Ne, FilterValue::Scalar(expected)) => Some(!values_equal(actual, expected)),
            (FilterOp::In, FilterValue::Set(set)) => {
                Some(set.iter().any(|expected| values_equal(actual, expected)))
            }
            (FilterOp::Contains, FilterValue::Scalar(FieldValue::Text(needle))) => {
                actual.as_text().map(|hay| hay.contains(needle.as_str()))
            }
            (op, FilterValue::Scalar(expected)) if op.is_numeric() => {
                let lhs = actual.as_f64()?;
                let rhs = expected.as_f64()?;
                Some(match op {
                    FilterOp::Gt => lhs > rhs,
                    FilterOp::Lt => lhs < rhs,
                    FilterOp::Ge => lhs >= rhs,
                    _ => lhs <= rhs,
                })
            }
            _ => None,
        }
    }
}

/// Numeric comparison when both sides coerce to numbers, otherwise
/// textual equality.
fn values_equal(actual: &FieldValue, expected: &FieldValue) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => match (actual, expected) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            _ => actual.to_string() == expected.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Sum,
    Count,
    Avg,
    Max,
    Min,
}

impl AggregationMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Some(AggregationMethod::Sum),
            "count" => Some(AggregationMethod::Count),
            "avg" | "mean" | "average" => Some(AggregationMethod::Avg),
            "max" => Some(AggregationMethod::Max),
            "min" => Some(AggregationMethod::Min),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Sum => "sum",
            AggregationMethod::Count => "count",
            AggregationMethod::Avg => "avg",
            AggregationMethod::Max => "max",
            AggregationMethod::Min => "min",
        }
    }

    /// Reduce a non-empty slice of values.
    pub fn apply(&self, values: &[f64]) -> f64 {
        match self {
            AggregationMethod::Sum => values.iter().sum(),
            AggregationMethod::Count => values.len() as f64,
            AggregationMethod::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeWindow {
    /// Trailing window of `days` days ending on each transaction date.
    Rolling { days: u32 },
    /// Trailing window of `months` whole calendar months, evaluated at the
    /// end of every month from the group's first month to its last.
    RollingMonths { months: u32 },
    /// Fixed `days`-day buckets counted from 1970-01-01.
    CalendarDays { days: u32 },
    /// Fixed `months`-month buckets counted from January 1970.
    CalendarMonths { months: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub method: AggregationMethod,
    pub field: String,
    pub group_by: Vec<String>,
    /// `None` aggregates each group over the whole data range.
    pub window: Option<TimeWindow>,
}

/// Exactly one threshold variant is active.
#[derive(Debug, Clone, PartialEq)]
pub enum Threshold {
    Fixed {
        value: f64,
    },
    FieldBased {
        reference_field: String,
        formula: Formula,
    },
    SegmentBased {
        segment_field: String,
        values: BTreeMap<String, f64>,
        default: f64,
    },
}

impl Threshold {
    pub fn kind(&self) -> &'static str {
        match self {
            Threshold::Fixed { .. } => "fixed",
            Threshold::FieldBased { .. } => "field_based",
            Threshold::SegmentBased { .. } => "segment_based",
        }
    }

    pub fn needs_customer(&self) -> bool {
        !matches!(self, Threshold::Fixed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioDefinition {
    pub scenario_id: ScenarioId,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    pub enabled: bool,
    pub filters: Vec<Filter>,
    pub aggregation: Aggregation,
    pub threshold: Threshold,
    /// Comparison over `aggregated_value`, checked after the threshold.
    pub alert_condition: Option<Formula>,
    pub field_mappings: BTreeMap<String, String>,
}

impl ScenarioDefinition {
    pub fn try_from_config(config: &ScenarioConfig) -> AmlResult<Self> {
        let scope = format!("scenario '{}'", config.scenario_id);
        let err = |message: String| AmlError::config(scope.clone(), message);

        if config.scenario_id.trim().is_empty() {
            return Err(AmlError::config("scenario", "scenario_id must not be empty"));
        }

        let filters = config
            .filters
            .iter()
            .enumerate()
            .map(|(i, f)| parse_filter(f).map_err(|m| err(format!("filter #{i}: {m}"))))
            .collect::<AmlResult<Vec<_>>>()?;

        let agg = &config.aggregation;
        let method = AggregationMethod::parse(&agg.method)
            .ok_or_else(|| err(format!("unknown aggregation method '{}'", agg.method)))?;
        if agg.field.trim().is_empty() {
            return Err(err("aggregation field must not be empty".into()));
        }
        if agg.group_by.is_empty() || agg.group_by.iter().any(|g| g.trim().is_empty()) {
            return Err(err("aggregation group_by must name at least one field".into()));
        }
        let window = agg
            .time_window
            .as_ref()
            .map(parse_window)
            .transpose()
            .map_err(err)?;

        let threshold = parse_threshold(&config.threshold)?;
        if threshold.needs_customer() && !agg.group_by.iter().any(|g| g == "customer_id") {
            return Err(err(format!(
                "{} thresholds need customer_id in group_by",
                threshold.kind()
            )));
        }

        let alert_condition = match &config.alert_condition {
            Some(c) => {
                let formula = Formula::parse(&c.expression, CONDITION_VARIABLE)?;
                if !formula.is_condition() {
                    return Err(err(format!(
                        "alert_condition '{}' must be a comparison",
                        c.expression
                    )));
                }
                Some(formula)
            }
            None => None,
        };

        Ok(Self {
            scenario_id: config.scenario_id.clone(),
            name: config.scenario_name.clone(),
            description: config.description.clone(),
            version: config.version,
            enabled: config.enabled,
            filters,
            aggregation: Aggregation {
                method,
                field: agg.field.clone(),
                group_by: agg.group_by.clone(),
                window,
            },
            threshold,
            alert_condition,
            field_mappings: config.field_mappings.clone(),
        })
    }

    /// Resolve a system field name to the source column it is mapped to.
    pub fn resolve_field<'a>(&'a self, field: &'a str) -> &'a str {
        self.field_mappings
            .get(field)
            .map(String::as_str)
            .unwrap_or(field)
    }
}

impl TryFrom<&ScenarioConfig> for ScenarioDefinition {
    type Error = AmlError;

    fn try_from(config: &ScenarioConfig) -> AmlResult<Self> {
        ScenarioDefinition::try_from_config(config)
    }
}

fn json_to_field_value(v: &serde_json::Value) -> Result<FieldValue, String> {
    match v {
        serde_json::Value::Bool(b) => Ok(FieldValue::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(FieldValue::Number)
            .ok_or_else(|| format!("number {n} is not representable")),
        serde_json::Value::String(s) => Ok(FieldValue::Text(s.clone())),
        serde_json::Value::Null => Err("value must not be null".into()),
        other => Err(format!("expected a scalar value, got {other}")),
    }
}

fn parse_filter(f: &FilterConfig) -> Result<Filter, String> {
    if f.field.trim().is_empty() {
        return Err("field must not be empty".into());
    }
    let op = FilterOp::parse(&f.operator).ok_or_else(|| format!("unknown operator '{}'", f.operator))?;

    let value = match op {
        FilterOp::In => {
            let items = f
                .value
                .as_array()
                .ok_or_else(|| "'in' expects a list value".to_string())?;
            let set = items
                .iter()
                .map(json_to_field_value)
                .collect::<Result<Vec<_>, _>>()?;
            FilterValue::Set(set)
        }
        _ => FilterValue::Scalar(json_to_field_value(&f.value)?),
    };

    match (&op, &value) {
        (FilterOp::Contains, FilterValue::Scalar(FieldValue::Text(_))) => {}
        (FilterOp::Contains, _) => return Err("'contains' expects a string value".into()),
        (op, FilterValue::Scalar(v)) if op.is_numeric() && v.as_f64().is_none() => {
            return Err(format!("operator '{}' expects a numeric value", f.operator));
        }
        _ => {}
    }

    Ok(Filter {
        field: f.field.clone(),
        op,
        value,
    })
}

fn parse_window(tw: &TimeWindowConfig) -> Result<TimeWindow, String> {
    if tw.value == 0 {
        return Err("time window value must be at least 1".into());
    }
    match (tw.window_type.as_str(), tw.unit.as_str()) {
        ("rolling", "days") => Ok(TimeWindow::Rolling { days: tw.value }),
        ("rolling", "months") => Ok(TimeWindow::RollingMonths { months: tw.value }),
        ("calendar", "days") => Ok(TimeWindow::CalendarDays { days: tw.value }),
        ("calendar", "months") => Ok(TimeWindow::CalendarMonths { months: tw.value }),
        (kind, unit) => Err(format!("unsupported time window {kind}/{unit}")),
    }
}

fn parse_threshold(t: &ThresholdConfig) -> AmlResult<Threshold> {
    let scope = "threshold";
    let populated = [
        t.fixed_value.is_some(),
        t.field_based.is_some(),
        t.segment_based.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();
    if populated != 1 {
        return Err(AmlError::config(
            scope,
            format!("exactly one threshold variant must be set, found {populated}"),
        ));
    }

    match t.threshold_type.as_str() {
        "fixed" => {
            let value = t
                .fixed_value
                .ok_or_else(|| AmlError::config(scope, "fixed threshold needs fixed_value"))?;
            if !value.is_finite() {
                return Err(AmlError::config(scope, "fixed_value must be finite"));
            }
            Ok(Threshold::Fixed { value })
        }
        "field_based" | "customer_based" | "dynamic" => {
            let fb = t
                .field_based
                .as_ref()
                .ok_or_else(|| AmlError::config(scope, "field_based threshold needs field_based"))?;
            if fb.reference_field.trim().is_empty() {
                return Err(AmlError::config(scope, "reference_field must not be empty"));
            }
            let formula = parse_reference_formula(&fb.calculation, &fb.reference_field)?;
            Ok(Threshold::FieldBased {
                reference_field: fb.reference_field.clone(),
                formula,
            })
        }
        "segment_based" => {
            let sb = t
                .segment_based
                .as_ref()
                .ok_or_else(|| AmlError::config(scope, "segment_based threshold needs segment_based"))?;
            if sb.segment_field.trim().is_empty() {
                return Err(AmlError::config(scope, "segment_field must not be empty"));
            }
            if !sb.default.is_finite() || sb.values.values().any(|v| !v.is_finite()) {
                return Err(AmlError::config(scope, "segment thresholds must be finite"));
            }
            Ok(Threshold::SegmentBased {
                segment_field: sb.segment_field.clone(),
                values: sb.values.clone(),
                default: sb.default,
            })
        }
        other => Err(AmlError::config(scope, format!("unknown threshold type '{other}'"))),
    }
}

/// Formulas may name the customer value either `reference_field` or by the
/// actual attribute name (`annual_income / 12`).
fn parse_reference_formula(source: &str, reference_field: &str) -> AmlResult<Formula> {
    match Formula::parse(source, REFERENCE_VARIABLE) {
        Ok(f) => Ok(f),
        Err(crate::expr::EvalError::UnknownName { name, .. }) if name == reference_field => {
            Ok(Formula::parse(source, reference_field)?)
        }
        Err(e) => Err(e.into()),
    }
}
