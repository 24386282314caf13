//! scenario-runner: headless baseline-vs-refined simulation runner.
//!
//! Usage:
//!   scenario-runner --data-dir ./data --db runs.db
//!   scenario-runner --data-dir ./data --synthetic --seed 7 --customers 200
//!   scenario-runner --data-dir ./data --refined-scenarios tuned.json
//!   scenario-runner --data-dir ./data --ipc-mode
//!
//! With `--synthetic` the generated whitelist is extended with any entries in
//! `<data-dir>/verified_entities.json` (generated names win on a clash).
//! Risk profiles always come from the generator.

use amlsim_core::{
    config::{self, EngineConfig},
    engine::{NoopObserver, RunRequest, RunResult, SimulationEngine},
    event::RunEventEntry,
    model::{Customer, Transaction},
    refinement::RefinementRule,
    scenario::ScenarioConfig,
    store::AmlStore,
    synth::{SyntheticDataset, SyntheticSpec},
};
use anyhow::{Context, Result};
use std::env;
use std::io::{self, BufRead, Write};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Run {
        kind: String, // "baseline" | "refined"
    },
    Compare {
        baseline_run_id: String,
        refined_run_id: String,
    },
    GetRun {
        run_id: String,
    },
    Quit,
}

#[derive(serde::Serialize)]
struct RunSummary {
    run_id: String,
    kind: String,
    status: String,
    total_transactions: usize,
    total_alerts: usize,
    retained_alerts: usize,
    excluded_alerts: usize,
    failures: usize,
    skipped_rows: usize,
    risk_score: Option<f64>,
    risk_level: Option<String>,
}

#[derive(serde::Deserialize)]
struct TransactionsFile {
    transactions: Vec<Transaction>,
}

#[derive(serde::Deserialize)]
struct CustomersFile {
    customers: Vec<Customer>,
}

#[derive(serde::Deserialize)]
struct ScenariosFile {
    scenarios: Vec<ScenarioConfig>,
}

/// Everything a session needs, loaded once.
struct Session {
    engine: SimulationEngine,
    store: AmlStore,
    baseline_scenarios: Vec<ScenarioConfig>,
    refined_scenarios: Vec<ScenarioConfig>,
    rules: Vec<RefinementRule>,
    transactions: Vec<Transaction>,
    customers: Vec<Customer>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let customer_count = parse_arg(&args, "--customers", 50usize);
    let synthetic = args.iter().any(|a| a == "--synthetic");
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = str_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = str_arg(&args, "--data-dir").unwrap_or("./data");
    let refined_path = str_arg(&args, "--refined-scenarios");

    if !ipc_mode {
        println!("AML Scenario Simulator - scenario-runner");
        println!("  data_dir:  {data_dir}");
        println!("  db:        {db}");
        if synthetic {
            println!("  synthetic: seed={seed} customers={customer_count}");
        }
        println!();
    }

    let session = load_session(data_dir, db, synthetic, seed, customer_count, refined_path)?;

    if ipc_mode {
        run_ipc_loop(&session)?;
    } else {
        let baseline = execute(&session, "baseline")?;
        let refined = execute(&session, "refined")?;
        print_summary(&session, &baseline, &refined)?;
    }

    Ok(())
}

fn load_session(
    data_dir: &str,
    db: &str,
    synthetic: bool,
    seed: u64,
    customer_count: usize,
    refined_path: Option<&str>,
) -> Result<Session> {
    let config = EngineConfig::load(data_dir)?;
    let baseline_scenarios = config::load_scenarios(data_dir)?;
    let refined_scenarios = match refined_path {
        Some(path) => {
            let content =
                std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
            serde_json::from_str::<ScenariosFile>(&content)
                .with_context(|| format!("Cannot parse {path}"))?
                .scenarios
        }
        None => baseline_scenarios.clone(),
    };
    let rules = config::load_refinement_rules(data_dir)?;

    let (transactions, customers, whitelist, profiles) = if synthetic {
        let spec = SyntheticSpec {
            customers: customer_count,
            categories: config.categories.clone(),
            ..SyntheticSpec::default()
        };
        let data = SyntheticDataset::generate(seed, &spec);
        let mut entities = data.verified_entities;
        if let Some(extra) = config::load_verified_entities(data_dir)? {
            log::info!("synthetic: merging {} verified entities from {data_dir}", extra.len());
            for entity in extra {
                if !entities.iter().any(|e| e.entity_name == entity.entity_name) {
                    entities.push(entity);
                }
            }
        }
        (
            data.transactions,
            data.customers,
            Some(entities),
            Some(data.risk_profiles),
        )
    } else {
        let txn_path = format!("{data_dir}/transactions.json");
        let content = std::fs::read_to_string(&txn_path)
            .with_context(|| format!("Cannot read {txn_path} (use --synthetic to generate data)"))?;
        let transactions = serde_json::from_str::<TransactionsFile>(&content)?.transactions;
        let cust_path = format!("{data_dir}/customers.json");
        let content = std::fs::read_to_string(&cust_path)
            .with_context(|| format!("Cannot read {cust_path}"))?;
        let customers = serde_json::from_str::<CustomersFile>(&content)?.customers;
        (
            transactions,
            customers,
            config::load_verified_entities(data_dir)?,
            config::load_risk_profiles(data_dir)?,
        )
    };

    let store = AmlStore::open(db)?;
    store.migrate()?;

    let mut engine = SimulationEngine::new(config);
    if let Some(entities) = &whitelist {
        for e in entities {
            store.upsert_verified_entity(e)?;
        }
        engine = engine.with_whitelist(entities);
    }
    if let Some(profiles) = &profiles {
        for p in profiles {
            store.upsert_risk_profile(p)?;
        }
        engine = engine.with_profiles(profiles);
    }

    Ok(Session {
        engine,
        store,
        baseline_scenarios,
        refined_scenarios,
        rules,
        transactions,
        customers,
    })
}

/// Run one pipeline and persist everything it returned.
fn execute(session: &Session, kind: &str) -> Result<RunResult> {
    let request = match kind {
        "baseline" => RunRequest::baseline(
            &session.baseline_scenarios,
            &session.transactions,
            &session.customers,
        ),
        "refined" => RunRequest::refined(
            &session.refined_scenarios,
            &session.transactions,
            &session.customers,
            &session.rules,
        ),
        other => anyhow::bail!("unknown run kind '{other}'"),
    };
    let result = session.engine.run(request, &mut NoopObserver)?;
    persist(&session.store, &result)?;
    Ok(result)
}

fn persist(store: &AmlStore, result: &RunResult) -> Result<()> {
    let run_id = &result.run.run_id;
    store.insert_run(&result.run)?;
    store.insert_alerts(run_id, &result.retained, false)?;
    store.insert_alerts(run_id, &result.excluded, true)?;
    store.append_exclusions(run_id, &result.exclusion_log)?;
    for (seq, event) in result.events.iter().enumerate() {
        store.append_run_event(&RunEventEntry::new(run_id, seq as u32, event)?)?;
    }
    log::info!("run={} persisted", run_id);
    Ok(())
}

fn summarize(result: &RunResult) -> RunSummary {
    RunSummary {
        run_id: result.run.run_id.clone(),
        kind: result.run.kind.as_str().into(),
        status: result.run.status.as_str().into(),
        total_transactions: result.run.total_transactions,
        total_alerts: result.alerts.len(),
        retained_alerts: result.retained.len(),
        excluded_alerts: result.excluded.len(),
        failures: result.failures.len(),
        skipped_rows: result.skipped_rows,
        risk_score: result.risk_report.as_ref().map(|r| r.score),
        risk_level: result.risk_report.as_ref().map(|r| r.level.as_str().to_string()),
    }
}

fn run_ipc_loop(session: &Session) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };

        let reply = match cmd {
            IpcCommand::Quit => break,
            IpcCommand::Run { kind } => {
                execute(session, &kind).map(|r| serde_json::to_value(summarize(&r)))
            }
            IpcCommand::Compare {
                baseline_run_id,
                refined_run_id,
            } => compare_stored(session, &baseline_run_id, &refined_run_id)
                .map(|report| serde_json::to_value(report)),
            IpcCommand::GetRun { run_id } => session
                .store
                .get_run(&run_id)
                .map_err(anyhow::Error::from)
                .map(|run| serde_json::to_value(run)),
        };
        let json = match reply {
            Ok(value) => value?,
            Err(e) => serde_json::json!({ "error": format!("{e:#}") }),
        };
        writeln!(stdout, "{}", json)?;
        stdout.flush()?;
    }
    Ok(())
}

fn compare_stored(
    session: &Session,
    baseline_run_id: &str,
    refined_run_id: &str,
) -> Result<amlsim_core::comparison::ComparisonReport> {
    let baseline = session.store.alerts_for_run(baseline_run_id)?;
    let refined = session.store.alerts_for_run(refined_run_id)?;
    let exclusions = session.store.exclusions_for_run(refined_run_id)?;
    Ok(session.engine.compare(&baseline, &refined, &exclusions))
}

fn print_summary(session: &Session, baseline: &RunResult, refined: &RunResult) -> Result<()> {
    for result in [baseline, refined] {
        let s = summarize(result);
        println!("=== {} RUN ===", s.kind.to_uppercase());
        println!("  run_id:        {}", s.run_id);
        println!("  status:        {}", s.status);
        println!("  transactions:  {}", s.total_transactions);
        println!("  alerts:        {}", s.total_alerts);
        println!("  retained:      {}", s.retained_alerts);
        println!("  excluded:      {}", s.excluded_alerts);
        println!("  skipped rows:  {}", s.skipped_rows);
        for failure in &result.failures {
            println!("  FAILED {:?}: {}", failure.unit, failure.message);
        }
        println!();
    }

    let report = compare_stored(session, &baseline.run.run_id, &refined.run.run_id)?;
    let s = &report.summary;
    println!("=== COMPARISON ===");
    println!("  baseline alerts:  {}", s.baseline_count);
    println!("  refined alerts:   {}", s.refined_count);
    println!("  retained:         {}", s.retained);
    println!("  excluded:         {}", s.excluded);
    println!("  new alerts:       {}", s.new_alerts);
    println!("  reduction:        {:.1}%", s.percent_reduction);

    let risk = &report.risk_analysis;
    println!();
    println!("=== SUPPRESSION RISK ===");
    println!("  suppressions:     {}", risk.total_suppressions);
    println!("  high-risk:        {}", risk.high_risk_suppressions);
    println!(
        "  score:            {:.0} ({})",
        risk.report.score,
        risk.report.level.as_str()
    );
    if risk.report.sample_exploits.is_empty() {
        println!("  (no risky exclusions)");
    }
    for line in &risk.report.sample_exploits {
        println!("  - {line}");
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
