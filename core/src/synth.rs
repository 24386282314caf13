//! Deterministic synthetic datasets.
//!
//! RULE: Nothing here may call a platform RNG. All randomness flows through
//! `DatasetRng` streams derived from one master seed, so the same seed and
//! spec always yield the same dataset.
//!
//! Each entity kind draws from its own stream (master_seed XOR stream index),
//! so changing how transactions are drawn never changes the customers.

use crate::{
    event_detector::{default_categories, EventCategory},
    model::{Customer, CustomerRiskProfile, Transaction, VerifiedEntity},
    types::FieldValue,
};
use chrono::{Duration, NaiveDate, NaiveTime};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A deterministic RNG for one stream of a synthetic dataset.
pub struct DatasetRng {
    inner: Pcg64Mcg,
}

/// Stable stream assignments. Only ever append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Stream {
    Customers = 0,
    Transactions = 1,
    Profiles = 2,
}

impl DatasetRng {
    pub fn new(master_seed: u64, stream: Stream) -> Self {
        let derived = master_seed ^ (stream as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            inner: Pcg64Mcg::seed_from_u64(derived),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll an index in [0, n). `n` must be non-zero.
    pub fn below(&mut self, n: usize) -> usize {
        (self.inner.next_u64() % n.max(1) as u64) as usize
    }

    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.below(items.len())]
    }

    /// Simplified Pareto draw; heavy right tail like real payment amounts.
    pub fn pareto(&mut self, x_min: f64, alpha: f64) -> f64 {
        let u = self.next_f64().max(1e-10);
        x_min * u.powf(-1.0 / alpha)
    }
}

// ── Spec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub customers: usize,
    pub start_date: NaiveDate,
    pub days: u32,
    pub transactions_per_customer: usize,
    /// Share of transactions that carry a category narrative.
    pub category_share: f64,
    /// Share of category transactions paid to a whitelisted beneficiary.
    pub verified_share: f64,
    pub categories: Vec<EventCategory>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            customers: 50,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or(NaiveDate::MIN),
            days: 90,
            transactions_per_customer: 40,
            category_share: 0.25,
            verified_share: 0.7,
            categories: default_categories(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticDataset {
    pub customers: Vec<Customer>,
    pub transactions: Vec<Transaction>,
    pub verified_entities: Vec<VerifiedEntity>,
    pub risk_profiles: Vec<CustomerRiskProfile>,
}

// ── Vocabulary ───────────────────────────────────────────────────────────────

const SEGMENTS: &[(&str, f64, f64)] = &[
    // (segment, income mean, amount x_min)
    ("Retail", 60_000.0, 40.0),
    ("Student", 12_000.0, 15.0),
    ("HNI", 450_000.0, 400.0),
    ("Corporate", 2_000_000.0, 1_500.0),
];

const OCCUPATIONS: &[&str] = &[
    "Engineer", "Teacher", "Student", "Trader", "Doctor", "Consultant", "Jeweller", "Retired",
];

const FIRST_NAMES: &[&str] = &["Asha", "Ben", "Chen", "Dara", "Eli", "Farah", "Goran", "Hana"];
const LAST_NAMES: &[&str] = &["Patel", "Okafor", "Silva", "Novak", "Kim", "Haddad", "Berg"];

const GENERIC_NARRATIVES: &[&str] = &[
    "POS purchase",
    "ATM withdrawal",
    "Online transfer",
    "Utility bill",
    "Card payment groceries",
    "Cash deposit",
];

const CHANNELS: &[&str] = &["ONLINE", "BRANCH", "ATM", "POS", "MOBILE"];

/// Whitelisted beneficiaries per entity type.
const ENTITIES: &[(&str, &str)] = &[
    ("University", "State University"),
    ("University", "Metro Technical College"),
    ("CryptoExchange", "Coinbase"),
    ("CryptoExchange", "Kraken Exchange"),
    ("FinancialInstitution", "First National Bank"),
    ("FinancialInstitution", "Harbor Savings"),
    ("Employer", "Acme Manufacturing"),
    ("Employer", "Northwind Traders"),
];

fn look_alike(name: &str) -> String {
    format!("{name} Services Ltd")
}

impl SyntheticDataset {
    pub fn verified_entities() -> Vec<VerifiedEntity> {
        ENTITIES
            .iter()
            .map(|(kind, name)| VerifiedEntity {
                entity_name: name.to_string(),
                entity_type: kind.to_string(),
                country: Some("US".into()),
                is_active: true,
            })
            .collect()
    }

    pub fn generate(seed: u64, spec: &SyntheticSpec) -> Self {
        let customers = generate_customers(seed, spec);
        let transactions = generate_transactions(seed, spec, &customers);
        let risk_profiles = generate_profiles(seed, &customers);
        log::info!(
            "synth: seed={} customers={} transactions={}",
            seed,
            customers.len(),
            transactions.len()
        );
        Self {
            customers,
            transactions,
            verified_entities: Self::verified_entities(),
            risk_profiles,
        }
    }
}

fn generate_customers(seed: u64, spec: &SyntheticSpec) -> Vec<Customer> {
    let mut rng = DatasetRng::new(seed, Stream::Customers);
    (0..spec.customers)
        .map(|i| {
            let (segment, income_mean, _) = *rng.pick(SEGMENTS);
            let mut c = Customer::new(format!("C{:05}", i + 1));
            c.name = Some(format!("{} {}", rng.pick(FIRST_NAMES), rng.pick(LAST_NAMES)));
            c.segment = Some(segment.to_string());
            c.occupation = Some(if segment == "Student" {
                "Student".to_string()
            } else {
                rng.pick(OCCUPATIONS).to_string()
            });
            let income = income_mean * (0.5 + rng.next_f64());
            c.annual_income = Some((income * 100.0).round() / 100.0);
            c.attributes.insert(
                "risk_rating".into(),
                FieldValue::Text(if rng.chance(0.1) { "HIGH" } else { "STANDARD" }.into()),
            );
            c
        })
        .collect()
}

fn generate_transactions(seed: u64, spec: &SyntheticSpec, customers: &[Customer]) -> Vec<Transaction> {
    let mut rng = DatasetRng::new(seed, Stream::Transactions);
    let mut out = Vec::with_capacity(customers.len() * spec.transactions_per_customer);
    let days = spec.days.max(1) as usize;

    for customer in customers {
        let x_min = SEGMENTS
            .iter()
            .find(|(s, _, _)| Some(*s) == customer.segment.as_deref())
            .map(|(_, _, x)| *x)
            .unwrap_or(40.0);
        let count = spec.transactions_per_customer / 2 + rng.below(spec.transactions_per_customer + 1);

        for n in 0..count {
            let date = spec.start_date + Duration::days(rng.below(days) as i64);
            let time = NaiveTime::from_num_seconds_from_midnight_opt(rng.below(86_400) as u32, 0)
                .unwrap_or(NaiveTime::MIN);
            let mut amount = (rng.pareto(x_min, 1.6) * 100.0).round() / 100.0;

            let (narrative, beneficiary) = if !spec.categories.is_empty() && rng.chance(spec.category_share) {
                let category = rng.pick(&spec.categories);
                let keyword = rng.pick(&category.keywords);
                let names: Vec<&str> = ENTITIES
                    .iter()
                    .filter(|(kind, _)| *kind == category.entity_type)
                    .map(|(_, name)| *name)
                    .collect();
                let beneficiary = if names.is_empty() {
                    None
                } else {
                    let name = *rng.pick(&names);
                    Some(if rng.chance(spec.verified_share) {
                        name.to_string()
                    } else {
                        look_alike(name)
                    })
                };
                // Occasionally push the amount past the category's plausible range.
                if rng.chance(0.1) {
                    amount = category.max_amount * (1.0 + rng.next_f64());
                } else {
                    amount = amount.min(category.max_amount);
                }
                (format!("{} payment ref {}", keyword, rng.below(100_000)), beneficiary)
            } else {
                (rng.pick(GENERIC_NARRATIVES).to_string(), None)
            };

            out.push(Transaction {
                transaction_id: format!("T{}-{:04}", customer.customer_id, n + 1),
                customer_id: customer.customer_id.clone(),
                timestamp: date.and_time(time),
                amount,
                narrative,
                beneficiary,
                channel: Some(rng.pick(CHANNELS).to_string()),
                transaction_type: Some(if rng.chance(0.5) { "DEBIT" } else { "CREDIT" }.into()),
                batch_id: Some(format!("SYN-{seed}")),
                expires_at: None,
                attributes: Default::default(),
            });
        }
    }
    out.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
    out
}

fn generate_profiles(seed: u64, customers: &[Customer]) -> Vec<CustomerRiskProfile> {
    let mut rng = DatasetRng::new(seed, Stream::Profiles);
    customers
        .iter()
        .map(|c| CustomerRiskProfile {
            customer_id: c.customer_id.clone(),
            is_pep: rng.chance(0.03),
            has_adverse_media: rng.chance(0.05),
            high_risk_occupation: c.occupation.as_deref() == Some("Jeweller") || rng.chance(0.02),
            previous_sar_count: if rng.chance(0.05) { 1 + rng.below(3) as u32 } else { 0 },
        })
        .collect()
}
