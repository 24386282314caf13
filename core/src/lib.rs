//! AML transaction-monitoring rule simulation core.
//!
//! Transactions and customers go through declarative scenarios to produce
//! alerts. Refinement rules then suppress alerts with verified legitimate
//! context, the risk engine scores what was suppressed, and the comparison
//! engine diffs a baseline run against a refined one.

pub mod comparison;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod event_detector;
pub mod expr;
pub mod model;
pub mod quality;
pub mod refinement;
pub mod risk_engine;
pub mod scenario;
pub mod scenario_engine;
pub mod store;
pub mod synth;
pub mod types;

pub use config::EngineConfig;
pub use engine::{NoopObserver, RunObserver, RunRequest, RunResult, SimulationEngine};
pub use error::{AmlError, AmlResult, UnitFailure};
