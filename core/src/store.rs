//! SQLite persistence layer.
//!
//! RULE: Only store.rs talks to the database.
//! The pipeline itself is pure; the runner calls store methods to persist
//! what a run returned. The exclusion log is append-only.

use crate::{
    error::{AmlError, AmlResult},
    event::RunEventEntry,
    event_detector::EventContext,
    model::{
        Alert, CustomerRiskProfile, RiskClass, RunKind, RunStatus, SimulationRun, TriggerDetails,
        VerifiedEntity,
    },
    refinement::{ExclusionLogEntry, RiskFlag},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.f";

pub struct AmlStore {
    conn: Connection,
}

impl AmlStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> AmlResult<Self> {
        let conn = Connection::open(path)?;
        // WAL only matters for real files; ignore the result elsewhere.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> AmlResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> AmlResult<()> {
        self.conn
            .execute_batch(include_str!("../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Runs ───────────────────────────────────────────────────

    pub fn insert_run(&self, run: &SimulationRun) -> AmlResult<()> {
        self.conn.execute(
            "INSERT INTO simulation_run (run_id, kind, status, scenarios, progress,
                total_transactions, total_alerts, excluded_alerts, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.run_id,
                run.kind.as_str(),
                run.status.as_str(),
                serde_json::to_string(&run.scenarios)?,
                run.progress,
                run.total_transactions as i64,
                run.total_alerts as i64,
                run.excluded_alerts as i64,
                run.created_at.format(DATETIME_FMT).to_string(),
                run.completed_at.map(|t| t.format(DATETIME_FMT).to_string()),
            ],
        )?;
        Ok(())
    }

    /// Persist status, progress, counters and completion time.
    pub fn update_run(&self, run: &SimulationRun) -> AmlResult<()> {
        let changed = self.conn.execute(
            "UPDATE simulation_run SET status = ?2, progress = ?3, total_transactions = ?4,
                total_alerts = ?5, excluded_alerts = ?6, completed_at = ?7
             WHERE run_id = ?1",
            params![
                run.run_id,
                run.status.as_str(),
                run.progress,
                run.total_transactions as i64,
                run.total_alerts as i64,
                run.excluded_alerts as i64,
                run.completed_at.map(|t| t.format(DATETIME_FMT).to_string()),
            ],
        )?;
        if changed == 0 {
            return Err(AmlError::RunNotFound {
                run_id: run.run_id.clone(),
            });
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> AmlResult<SimulationRun> {
        self.conn
            .query_row(
                "SELECT run_id, kind, status, scenarios, progress, total_transactions,
                    total_alerts, excluded_alerts, created_at, completed_at
                 FROM simulation_run WHERE run_id = ?1",
                params![run_id],
                |row| {
                    let kind: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    let scenarios: String = row.get(3)?;
                    let completed_at: Option<String> = row.get(9)?;
                    Ok(SimulationRun {
                        run_id: row.get(0)?,
                        kind: RunKind::parse(&kind).ok_or_else(|| bad_text(1, &kind))?,
                        status: RunStatus::parse(&status).ok_or_else(|| bad_text(2, &status))?,
                        scenarios: from_json(3, &scenarios)?,
                        progress: row.get(4)?,
                        total_transactions: row.get::<_, i64>(5)? as usize,
                        total_alerts: row.get::<_, i64>(6)? as usize,
                        excluded_alerts: row.get::<_, i64>(7)? as usize,
                        created_at: datetime_at(row, 8)?,
                        completed_at: completed_at
                            .map(|s| parse_datetime(9, &s))
                            .transpose()?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| AmlError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    // ── Alerts ─────────────────────────────────────────────────

    pub fn insert_alerts(&self, run_id: &str, alerts: &[Alert], excluded: bool) -> AmlResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO alert (run_id, alert_id, scenario_id, scenario_name, customer_id,
                    window_start, alert_date, aggregated_value, threshold, risk_class,
                    trigger_details, excluded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for a in alerts {
                stmt.execute(params![
                    run_id,
                    a.alert_id,
                    a.scenario_id,
                    a.scenario_name,
                    a.customer_id,
                    a.window_start.format(DATE_FMT).to_string(),
                    a.alert_date.format(DATE_FMT).to_string(),
                    a.aggregated_value,
                    a.threshold,
                    a.risk_class.as_str(),
                    serde_json::to_string(&a.trigger_details)?,
                    excluded,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Retained (non-excluded) alerts of a run, in insertion order.
    pub fn alerts_for_run(&self, run_id: &str) -> AmlResult<Vec<Alert>> {
        self.query_alerts(run_id, true)
    }

    /// Every alert of a run, retained and excluded.
    pub fn all_alerts_for_run(&self, run_id: &str) -> AmlResult<Vec<Alert>> {
        self.query_alerts(run_id, false)
    }

    fn query_alerts(&self, run_id: &str, retained_only: bool) -> AmlResult<Vec<Alert>> {
        let sql = if retained_only {
            "SELECT alert_id, scenario_id, scenario_name, customer_id, window_start, alert_date,
                aggregated_value, threshold, risk_class, trigger_details
             FROM alert WHERE run_id = ?1 AND excluded = 0 ORDER BY id ASC"
        } else {
            "SELECT alert_id, scenario_id, scenario_name, customer_id, window_start, alert_date,
                aggregated_value, threshold, risk_class, trigger_details
             FROM alert WHERE run_id = ?1 ORDER BY id ASC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let alerts = stmt
            .query_map(params![run_id], |row| {
                let risk_class: String = row.get(8)?;
                let details: String = row.get(9)?;
                Ok(Alert {
                    alert_id: row.get(0)?,
                    scenario_id: row.get(1)?,
                    scenario_name: row.get(2)?,
                    customer_id: row.get(3)?,
                    window_start: date_at(row, 4)?,
                    alert_date: date_at(row, 5)?,
                    aggregated_value: row.get(6)?,
                    threshold: row.get(7)?,
                    risk_class: RiskClass::parse(&risk_class)
                        .ok_or_else(|| bad_text(8, &risk_class))?,
                    trigger_details: from_json::<TriggerDetails>(9, &details)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    // ── Exclusion log ──────────────────────────────────────────

    pub fn append_exclusions(&self, run_id: &str, entries: &[ExclusionLogEntry]) -> AmlResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO exclusion_log (run_id, log_id, alert_id, rule_id, rule_name,
                    customer_id, scenario_id, alert_date, context, evidence_transaction_id,
                    beneficiary, evidence_amount, reason, risk_flags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for e in entries {
                stmt.execute(params![
                    run_id,
                    e.log_id,
                    e.alert_id,
                    e.rule_id,
                    e.rule_name,
                    e.customer_id,
                    e.scenario_id,
                    e.alert_date.format(DATE_FMT).to_string(),
                    serde_json::to_string(&e.context)?,
                    e.evidence_transaction_id,
                    e.beneficiary,
                    e.evidence_amount,
                    e.reason,
                    serde_json::to_string(&e.risk_flags)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn exclusions_for_run(&self, run_id: &str) -> AmlResult<Vec<ExclusionLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT log_id, alert_id, rule_id, rule_name, customer_id, scenario_id, alert_date,
                context, evidence_transaction_id, beneficiary, evidence_amount, reason, risk_flags
             FROM exclusion_log WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                let context: String = row.get(7)?;
                let flags: String = row.get(12)?;
                Ok(ExclusionLogEntry {
                    log_id: row.get(0)?,
                    alert_id: row.get(1)?,
                    rule_id: row.get(2)?,
                    rule_name: row.get(3)?,
                    customer_id: row.get(4)?,
                    scenario_id: row.get(5)?,
                    alert_date: date_at(row, 6)?,
                    context: from_json::<EventContext>(7, &context)?,
                    evidence_transaction_id: row.get(8)?,
                    beneficiary: row.get(9)?,
                    evidence_amount: row.get(10)?,
                    reason: row.get(11)?,
                    risk_flags: from_json::<Vec<RiskFlag>>(12, &flags)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Run event log ──────────────────────────────────────────

    pub fn append_run_event(&self, entry: &RunEventEntry) -> AmlResult<()> {
        self.conn.execute(
            "INSERT INTO run_event (run_id, seq, event_type, payload) VALUES (?1, ?2, ?3, ?4)",
            params![entry.run_id, entry.seq, entry.event_type, entry.payload],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> AmlResult<Vec<RunEventEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, event_type, payload
             FROM run_event WHERE run_id = ?1
             ORDER BY seq ASC, id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(RunEventEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    seq: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Reference data ─────────────────────────────────────────

    pub fn upsert_verified_entity(&self, entity: &VerifiedEntity) -> AmlResult<()> {
        self.conn.execute(
            "INSERT INTO verified_entity (entity_name, entity_type, country, is_active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_name, entity_type)
             DO UPDATE SET country = excluded.country, is_active = excluded.is_active",
            params![
                entity.entity_name,
                entity.entity_type,
                entity.country,
                entity.is_active
            ],
        )?;
        Ok(())
    }

    pub fn verified_entities(&self) -> AmlResult<Vec<VerifiedEntity>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_name, entity_type, country, is_active
             FROM verified_entity ORDER BY entity_type, entity_name",
        )?;
        let entities = stmt
            .query_map([], |row| {
                Ok(VerifiedEntity {
                    entity_name: row.get(0)?,
                    entity_type: row.get(1)?,
                    country: row.get(2)?,
                    is_active: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    pub fn upsert_risk_profile(&self, profile: &CustomerRiskProfile) -> AmlResult<()> {
        self.conn.execute(
            "INSERT INTO customer_risk_profile (customer_id, is_pep, has_adverse_media,
                high_risk_occupation, previous_sar_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(customer_id) DO UPDATE SET
                is_pep = excluded.is_pep,
                has_adverse_media = excluded.has_adverse_media,
                high_risk_occupation = excluded.high_risk_occupation,
                previous_sar_count = excluded.previous_sar_count",
            params![
                profile.customer_id,
                profile.is_pep,
                profile.has_adverse_media,
                profile.high_risk_occupation,
                profile.previous_sar_count,
            ],
        )?;
        Ok(())
    }

    pub fn risk_profiles(&self) -> AmlResult<Vec<CustomerRiskProfile>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, is_pep, has_adverse_media, high_risk_occupation, previous_sar_count
             FROM customer_risk_profile ORDER BY customer_id",
        )?;
        let profiles = stmt
            .query_map([], |row| {
                Ok(CustomerRiskProfile {
                    customer_id: row.get(0)?,
                    is_pep: row.get(1)?,
                    has_adverse_media: row.get(2)?,
                    high_risk_occupation: row.get(3)?,
                    previous_sar_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }
}

// ── Column conversion ────────────────────────────────────────────────────────

fn bad_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DATE_FMT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATETIME_FMT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let s: String = row.get(idx)?;
    parse_datetime(idx, &s)
}
