//! The simulation engine: orchestration of one simulation run.
//!
//! EXECUTION ORDER (fixed, never reordered):
//!   1. Date-range scoping of the transaction batch
//!   2. Data-quality reports (informational)
//!   3. Scenarios, in the order given: validate → filter → aggregate → threshold
//!   4. Run-level de-duplication by (customer, scenario, alert date)
//!   5. Refinement over the whole run's alert set (refined runs only)
//!   6. Risk report over the excluded alerts
//!
//! RULES:
//!   - All inputs are passed in and all outputs returned; no state is
//!     shared between runs.
//!   - A failing scenario or rule becomes a `UnitFailure`; siblings still run.
//!   - The observer is told after every scenario and after refinement, and
//!     may abort between scenarios. An aborted run is never refined.
//!   - Every state change is recorded in the run's event log.

use crate::{
    comparison::{ComparisonEngine, ComparisonReport},
    config::EngineConfig,
    error::{AmlError, AmlResult, UnitFailure},
    event::RunEvent,
    event_detector::{EventDetector, VerifiedEntities},
    model::{
        Alert, Customer, CustomerRiskProfile, RunKind, RunStatus, SimulationRun, Transaction,
        VerifiedEntity,
    },
    quality::{validate_customers, validate_transactions, DataQualityReport},
    refinement::{ExclusionLogEntry, RefineOutcome, RefinementLayer, RefinementRule},
    risk_engine::{RiskEngine, RiskReport, RiskSubject},
    scenario::{ScenarioConfig, ScenarioDefinition},
    scenario_engine::{ScenarioEngine, StageStats},
    types::{RunId, ScenarioId},
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

// ── Progress and abort ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: RunId,
    pub completed_units: usize,
    pub total_units: usize,
    /// The unit that just finished: a scenario id or "refinement".
    pub unit: String,
}

impl RunProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_units == 0 {
            1.0
        } else {
            self.completed_units as f64 / self.total_units as f64
        }
    }
}

/// Step boundary hooks for a long-running execution.
pub trait RunObserver {
    fn on_progress(&mut self, _progress: &RunProgress) {}

    /// Consulted before each scenario.
    fn should_abort(&self) -> bool {
        false
    }
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

struct ProgressTracker {
    run_id: RunId,
    completed: usize,
    total: usize,
}

impl ProgressTracker {
    fn step(&mut self, unit: &str, observer: &mut dyn RunObserver) {
        self.completed += 1;
        observer.on_progress(&RunProgress {
            run_id: self.run_id.clone(),
            completed_units: self.completed,
            total_units: self.total,
            unit: unit.to_string(),
        });
    }

    fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub scenario_id: ScenarioId,
    pub status: ScenarioStatus,
    pub alerts: usize,
    pub stats: StageStats,
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioBatch {
    /// De-duplicated alerts of every completed scenario, in scenario order.
    pub alerts: Vec<Alert>,
    pub outcomes: Vec<ScenarioOutcome>,
    pub failures: Vec<UnitFailure>,
    pub skipped_rows: usize,
    pub duplicates_removed: usize,
    pub aborted: bool,
    pub events: Vec<RunEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Everything one run needs, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub kind: RunKind,
    pub scenarios: &'a [ScenarioConfig],
    pub transactions: &'a [Transaction],
    pub customers: &'a [Customer],
    /// Applied only to refined runs.
    pub rules: &'a [RefinementRule],
    pub date_range: Option<DateRange>,
}

impl<'a> RunRequest<'a> {
    pub fn baseline(
        scenarios: &'a [ScenarioConfig],
        transactions: &'a [Transaction],
        customers: &'a [Customer],
    ) -> Self {
        Self {
            kind: RunKind::Baseline,
            scenarios,
            transactions,
            customers,
            rules: &[],
            date_range: None,
        }
    }

    pub fn refined(
        scenarios: &'a [ScenarioConfig],
        transactions: &'a [Transaction],
        customers: &'a [Customer],
        rules: &'a [RefinementRule],
    ) -> Self {
        Self {
            kind: RunKind::Refined,
            rules,
            ..Self::baseline(scenarios, transactions, customers)
        }
    }

    pub fn with_date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.date_range = Some(DateRange { start, end });
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run: SimulationRun,
    /// De-duplicated scenario output before refinement.
    pub alerts: Vec<Alert>,
    pub retained: Vec<Alert>,
    pub excluded: Vec<Alert>,
    pub exclusion_log: Vec<ExclusionLogEntry>,
    pub risk_report: Option<RiskReport>,
    pub outcomes: Vec<ScenarioOutcome>,
    pub failures: Vec<UnitFailure>,
    pub skipped_rows: usize,
    pub transaction_quality: DataQualityReport,
    pub customer_quality: DataQualityReport,
    pub events: Vec<RunEvent>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SimulationEngine {
    config: EngineConfig,
    detector: EventDetector,
    risk: RiskEngine,
}

impl SimulationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let detector = EventDetector::new(config.categories.clone(), None);
        let risk = RiskEngine::new(&config);
        Self {
            config,
            detector,
            risk,
        }
    }

    /// Attach the verified-entity whitelist used by event detection.
    pub fn with_whitelist(mut self, entities: &[VerifiedEntity]) -> Self {
        let whitelist = Arc::new(VerifiedEntities::new(entities));
        self.detector = EventDetector::new(self.config.categories.clone(), Some(whitelist));
        self
    }

    /// Attach customer risk profiles used by risk scoring.
    pub fn with_profiles(mut self, profiles: &[CustomerRiskProfile]) -> Self {
        self.risk = RiskEngine::new(&self.config).with_profiles(profiles);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn detector(&self) -> &EventDetector {
        &self.detector
    }

    /// Execute every enabled scenario with per-scenario failure isolation.
    /// Fails as a whole only when the scenario list itself is malformed.
    pub fn execute_scenarios(
        &self,
        scenarios: &[ScenarioConfig],
        transactions: &[Transaction],
        customers: &[Customer],
        observer: &mut dyn RunObserver,
    ) -> AmlResult<ScenarioBatch> {
        let mut progress = ProgressTracker {
            run_id: RunId::new(),
            completed: 0,
            total: scenarios.len(),
        };
        self.execute_tracked(scenarios, transactions, customers, observer, &mut progress)
    }

    fn execute_tracked(
        &self,
        scenarios: &[ScenarioConfig],
        transactions: &[Transaction],
        customers: &[Customer],
        observer: &mut dyn RunObserver,
        progress: &mut ProgressTracker,
    ) -> AmlResult<ScenarioBatch> {
        check_unique_ids(scenarios)?;

        let engine = ScenarioEngine::new(self.config.risk_classes);
        let mut batch = ScenarioBatch::default();
        let mut seen = HashSet::new();
        let run = progress.run_id.clone();

        for config in scenarios {
            if observer.should_abort() {
                log::warn!(
                    "run={} aborted after {} of {} units",
                    run,
                    progress.completed,
                    progress.total
                );
                batch.aborted = true;
                break;
            }

            let id = config.scenario_id.clone();
            if !config.enabled {
                log::info!("run={} scenario={} disabled, skipped", run, id);
                batch.outcomes.push(ScenarioOutcome {
                    scenario_id: id.clone(),
                    status: ScenarioStatus::Skipped,
                    alerts: 0,
                    stats: StageStats::default(),
                });
                batch.events.push(RunEvent::ScenarioSkipped {
                    scenario_id: id.clone(),
                    reason: "disabled".into(),
                });
                progress.step(&id, observer);
                continue;
            }

            let definition = match ScenarioDefinition::try_from_config(config) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("run={} scenario={} failed: {}", run, id, e);
                    batch.events.push(RunEvent::ScenarioFailed {
                        scenario_id: id.clone(),
                        kind: e.kind().into(),
                        message: e.to_string(),
                    });
                    batch.failures.push(UnitFailure::scenario(&id, &e));
                    batch.outcomes.push(ScenarioOutcome {
                        scenario_id: id.clone(),
                        status: ScenarioStatus::Failed,
                        alerts: 0,
                        stats: StageStats::default(),
                    });
                    progress.step(&id, observer);
                    continue;
                }
            };

            let output = engine.execute(&definition, transactions, customers);
            let before = output.alerts.len();
            let mut kept = 0usize;
            for alert in output.alerts {
                let key = (
                    alert.customer_id.clone(),
                    alert.scenario_id.clone(),
                    alert.alert_date,
                );
                if seen.insert(key) {
                    batch.alerts.push(alert);
                    kept += 1;
                }
            }
            batch.duplicates_removed += before - kept;
            batch.skipped_rows += output.stats.skipped_rows;

            log::info!(
                "run={} scenario={} alerts={} skipped_rows={}",
                run,
                id,
                kept,
                output.stats.skipped_rows
            );
            batch.events.push(RunEvent::ScenarioCompleted {
                scenario_id: id.clone(),
                alerts: kept,
                skipped_rows: output.stats.skipped_rows,
            });
            batch.outcomes.push(ScenarioOutcome {
                scenario_id: id.clone(),
                status: ScenarioStatus::Completed,
                alerts: kept,
                stats: output.stats,
            });
            progress.step(&id, observer);
        }

        Ok(batch)
    }

    pub fn refine(
        &self,
        alerts: &[Alert],
        transactions: &[Transaction],
        rules: &[RefinementRule],
    ) -> RefineOutcome {
        RefinementLayer::new(&self.detector, self.config.default_lookback_days)
            .refine(alerts, transactions, rules)
    }

    pub fn analyze_risk(&self, excluded: &[RiskSubject<'_>]) -> RiskReport {
        self.risk.analyze(excluded)
    }

    /// Score a refine outcome's exclusions with their recorded contexts.
    pub fn analyze_outcome(&self, outcome: &RefineOutcome) -> RiskReport {
        let subjects: Vec<RiskSubject<'_>> = outcome
            .exclusions()
            .map(|(alert, entry)| RiskSubject::new(alert, Some(entry)))
            .collect();
        self.analyze_risk(&subjects)
    }

    pub fn compare(
        &self,
        baseline: &[Alert],
        refined: &[Alert],
        exclusion_log: &[ExclusionLogEntry],
    ) -> ComparisonReport {
        ComparisonEngine::new(&self.risk).compare(baseline, refined, exclusion_log)
    }

    /// Full pipeline for one simulation run.
    pub fn run(&self, request: RunRequest<'_>, observer: &mut dyn RunObserver) -> AmlResult<RunResult> {
        let scenario_ids = request
            .scenarios
            .iter()
            .map(|s| s.scenario_id.clone())
            .collect();
        let mut run = SimulationRun::new(request.kind, scenario_ids);
        run.status = RunStatus::Running;

        let transactions: Cow<'_, [Transaction]> = match request.date_range {
            Some(range) => Cow::Owned(
                request
                    .transactions
                    .iter()
                    .filter(|t| range.contains(t.date()))
                    .cloned()
                    .collect(),
            ),
            None => Cow::Borrowed(request.transactions),
        };
        run.total_transactions = transactions.len();

        let mut events = vec![RunEvent::RunStarted {
            run_id: run.run_id.clone(),
            kind: request.kind.as_str().into(),
            scenarios: request.scenarios.len(),
            transactions: transactions.len(),
            customers: request.customers.len(),
        }];
        log::info!(
            "run={} kind={} scenarios={} transactions={} customers={}",
            run.run_id,
            request.kind.as_str(),
            request.scenarios.len(),
            transactions.len(),
            request.customers.len()
        );

        let now = Utc::now().naive_utc();
        let transaction_quality = validate_transactions(&transactions, now);
        let customer_quality = validate_customers(request.customers, now);

        let refining = request.kind == RunKind::Refined;
        let mut progress = ProgressTracker {
            run_id: run.run_id.clone(),
            completed: 0,
            total: request.scenarios.len() + usize::from(refining),
        };
        let batch = self.execute_tracked(
            request.scenarios,
            &transactions,
            request.customers,
            observer,
            &mut progress,
        )?;
        events.extend(batch.events);
        let mut failures = batch.failures;
        run.total_alerts = batch.alerts.len();
        run.progress = progress.fraction();

        if batch.aborted {
            let completed = batch.outcomes.len();
            events.push(RunEvent::RunAborted {
                completed,
                total: request.scenarios.len(),
            });
            run.status = RunStatus::Aborted;
            run.completed_at = Some(Utc::now().naive_utc());
            let reason = AmlError::Aborted {
                completed,
                total: request.scenarios.len(),
            };
            log::warn!("run={} {}", run.run_id, reason);
            return Ok(RunResult {
                run,
                retained: batch.alerts.clone(),
                alerts: batch.alerts,
                excluded: Vec::new(),
                exclusion_log: Vec::new(),
                risk_report: None,
                outcomes: batch.outcomes,
                failures,
                skipped_rows: batch.skipped_rows,
                transaction_quality,
                customer_quality,
                events,
            });
        }

        let (retained, excluded, exclusion_log, risk_report) = if refining {
            let outcome = self.refine(&batch.alerts, &transactions, request.rules);
            for failure in &outcome.failures {
                events.push(RunEvent::RuleFailed {
                    rule_id: failure.unit_id().to_string(),
                    kind: failure.kind.clone(),
                    message: failure.message.clone(),
                });
            }
            events.push(RunEvent::RefinementCompleted {
                rules: request.rules.len(),
                retained: outcome.retained.len(),
                excluded: outcome.excluded.len(),
            });
            progress.step("refinement", observer);
            let report = self.analyze_outcome(&outcome);
            failures.extend(outcome.failures);
            (
                outcome.retained,
                outcome.excluded,
                outcome.exclusion_log,
                Some(report),
            )
        } else {
            (batch.alerts.clone(), Vec::new(), Vec::new(), None)
        };

        run.excluded_alerts = excluded.len();
        run.progress = progress.fraction();
        let completed_scenarios = batch
            .outcomes
            .iter()
            .filter(|o| o.status == ScenarioStatus::Completed)
            .count();
        let any_enabled = request.scenarios.iter().any(|s| s.enabled);
        run.status = if any_enabled && completed_scenarios == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        run.completed_at = Some(Utc::now().naive_utc());

        events.push(RunEvent::RunCompleted {
            total_alerts: run.total_alerts,
            excluded_alerts: run.excluded_alerts,
            risk_score: risk_report.as_ref().map(|r| r.score),
        });
        log::info!(
            "run={} status={} alerts={} excluded={} failures={}",
            run.run_id,
            run.status.as_str(),
            run.total_alerts,
            run.excluded_alerts,
            failures.len()
        );

        Ok(RunResult {
            run,
            alerts: batch.alerts,
            retained,
            excluded,
            exclusion_log,
            risk_report,
            outcomes: batch.outcomes,
            failures,
            skipped_rows: batch.skipped_rows,
            transaction_quality,
            customer_quality,
            events,
        })
    }
}

/// Duplicate scenario ids make the whole list malformed.
fn check_unique_ids(scenarios: &[ScenarioConfig]) -> AmlResult<()> {
    let mut seen = HashSet::new();
    for s in scenarios {
        if !seen.insert(s.scenario_id.as_str()) {
            return Err(AmlError::config(
                "scenario list",
                format!("scenario id '{}' appears more than once", s.scenario_id),
            ));
        }
    }
    Ok(())
}
