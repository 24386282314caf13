//! SQLite store: runs, alerts, the exclusion log and the run event log
//! survive a write/read cycle.

use amlsim_core::{
    config::EngineConfig,
    engine::{NoopObserver, RunRequest, SimulationEngine},
    error::AmlError,
    event::RunEventEntry,
    model::{
        Customer, CustomerRiskProfile, RunKind, RunStatus, SimulationRun, Transaction,
        VerifiedEntity,
    },
    refinement::RefinementRule,
    scenario::ScenarioConfig,
    store::AmlStore,
};
use chrono::NaiveDate;
use serde_json::json;

fn store() -> AmlStore {
    let store = AmlStore::in_memory().expect("in-memory db");
    store.migrate().expect("migrate");
    store
}

fn txn(id: &str, customer: &str, day: u32, amount: f64, narrative: &str, beneficiary: Option<&str>) -> Transaction {
    Transaction {
        transaction_id: id.into(),
        customer_id: customer.into(),
        timestamp: NaiveDate::from_ymd_opt(2024, 4, day)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap(),
        amount,
        narrative: narrative.into(),
        beneficiary: beneficiary.map(String::from),
        channel: None,
        transaction_type: Some("DEBIT".into()),
        batch_id: None,
        expires_at: None,
        attributes: Default::default(),
    }
}

fn university() -> VerifiedEntity {
    VerifiedEntity {
        entity_name: "State University".into(),
        entity_type: "University".into(),
        country: Some("US".into()),
        is_active: true,
    }
}

fn refined_run() -> amlsim_core::RunResult {
    let scenarios: Vec<ScenarioConfig> = serde_json::from_value(json!([{
        "scenario_id": "S1",
        "scenario_name": "Fixed",
        "aggregation": {
            "method": "sum",
            "group_by": ["customer_id"],
            "time_window": { "value": 30, "unit": "days", "type": "rolling" }
        },
        "threshold": { "type": "fixed", "fixed_value": 10000 }
    }]))
    .unwrap();
    let txns = vec![
        txn("T1", "C1", 1, 9_000.0, "tuition", Some("State University")),
        txn("T2", "C1", 2, 3_000.0, "transfer", None),
        txn("T3", "C2", 2, 12_000.0, "transfer", None),
    ];
    let customers = vec![Customer::new("C1"), Customer::new("C2")];
    let rules = vec![RefinementRule::new("EDU", "Verified tuition", &["education"], 30)];

    SimulationEngine::new(EngineConfig::default())
        .with_whitelist(&[university()])
        .run(RunRequest::refined(&scenarios, &txns, &customers, &rules), &mut NoopObserver)
        .expect("run")
}

#[test]
fn migrate_is_idempotent() {
    let store = store();
    store.migrate().expect("second migrate");
}

#[test]
fn run_round_trip_and_update() {
    let store = store();
    let mut run = SimulationRun::new(RunKind::Refined, vec!["S1".into(), "S2".into()]);
    store.insert_run(&run).unwrap();

    let loaded = store.get_run(&run.run_id).unwrap();
    assert_eq!(loaded.kind, RunKind::Refined);
    assert_eq!(loaded.status, RunStatus::Pending);
    assert_eq!(loaded.scenarios, vec!["S1", "S2"]);
    assert_eq!(loaded.created_at, run.created_at);
    assert_eq!(loaded.completed_at, None);

    run.status = RunStatus::Completed;
    run.progress = 1.0;
    run.total_alerts = 4;
    run.completed_at = Some(run.created_at);
    store.update_run(&run).unwrap();
    assert_eq!(store.get_run(&run.run_id).unwrap(), run);
}

#[test]
fn unknown_runs_are_reported() {
    let store = store();
    assert!(matches!(store.get_run("nope"), Err(AmlError::RunNotFound { .. })));

    let ghost = SimulationRun::new(RunKind::Baseline, vec![]);
    assert!(matches!(store.update_run(&ghost), Err(AmlError::RunNotFound { .. })));
}

#[test]
fn alerts_exclusions_and_events_persist() {
    let _ = env_logger::builder().is_test(true).try_init();
    let result = refined_run();
    assert_eq!(result.excluded.len(), 1);
    assert_eq!(result.retained.len(), 1);

    let store = store();
    let run_id = &result.run.run_id;
    store.insert_run(&result.run).unwrap();
    store.insert_alerts(run_id, &result.retained, false).unwrap();
    store.insert_alerts(run_id, &result.excluded, true).unwrap();
    store.append_exclusions(run_id, &result.exclusion_log).unwrap();
    for (seq, event) in result.events.iter().enumerate() {
        store
            .append_run_event(&RunEventEntry::new(run_id, seq as u32, event).unwrap())
            .unwrap();
    }

    assert_eq!(store.alerts_for_run(run_id).unwrap(), result.retained);
    assert_eq!(store.all_alerts_for_run(run_id).unwrap().len(), 2);
    assert_eq!(store.exclusions_for_run(run_id).unwrap(), result.exclusion_log);

    let events = store.events_for_run(run_id).unwrap();
    assert_eq!(events.len(), result.events.len());
    let replayed: Vec<_> = events.iter().map(|e| e.event().unwrap()).collect();
    assert_eq!(replayed, result.events);
    assert_eq!(events[0].event_type, "run_started");
}

#[test]
fn alert_ids_are_unique_per_run() {
    let result = refined_run();
    let store = store();
    store.insert_run(&result.run).unwrap();
    store.insert_alerts(&result.run.run_id, &result.retained, false).unwrap();
    assert!(store
        .insert_alerts(&result.run.run_id, &result.retained, false)
        .is_err());
}

#[test]
fn reference_data_upserts() {
    let store = store();
    let mut entity = university();
    store.upsert_verified_entity(&entity).unwrap();
    entity.is_active = false;
    store.upsert_verified_entity(&entity).unwrap();
    assert_eq!(store.verified_entities().unwrap(), vec![entity]);

    let profile = CustomerRiskProfile {
        customer_id: "C1".into(),
        is_pep: true,
        has_adverse_media: false,
        high_risk_occupation: true,
        previous_sar_count: 2,
    };
    store.upsert_risk_profile(&profile).unwrap();
    store.upsert_risk_profile(&profile).unwrap();
    assert_eq!(store.risk_profiles().unwrap(), vec![profile]);
}
