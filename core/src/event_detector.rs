//! Event context detection.
//!
//! Classifies a transaction narrative into an event category by keyword,
//! then checks the beneficiary against the verified-entity whitelist and
//! the amount against the category's plausible range.
//!
//! RULE: Matching is case-insensitive substring search. The longest matching
//! keyword wins; equal lengths resolve to the first-declared category.
//! RULE: No keyword match is not an error, `detect` returns `None`.
//! RULE: Without a whitelist nothing is verified.

use crate::model::VerifiedEntity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

// ── Categories ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCategory {
    pub name: String,
    pub keywords: Vec<String>,
    /// Whitelist entity type a beneficiary must carry to count as verified.
    pub entity_type: String,
    #[serde(default)]
    pub min_amount: f64,
    pub max_amount: f64,
}

impl EventCategory {
    pub fn new(name: &str, keywords: &[&str], entity_type: &str, max_amount: f64) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            entity_type: entity_type.into(),
            min_amount: 0.0,
            max_amount,
        }
    }

    pub fn amount_reasonable(&self, amount: f64) -> bool {
        let a = amount.abs();
        a.is_finite() && a >= self.min_amount && a <= self.max_amount
    }
}

pub fn default_categories() -> Vec<EventCategory> {
    vec![
        EventCategory::new(
            "education",
            &["university", "tuition", "education", "school", "college", "student fee", "semester"],
            "University",
            50_000.0,
        ),
        EventCategory::new(
            "crypto",
            &["crypto", "bitcoin", "btc", "ethereum", "binance", "coinbase", "usdt"],
            "CryptoExchange",
            10_000.0,
        ),
        EventCategory::new(
            "loan",
            &["loan", "emi", "mortgage", "repayment", "installment", "financing"],
            "FinancialInstitution",
            500_000.0,
        ),
        EventCategory::new(
            "fixed_deposit",
            &["fixed deposit", "fd", "term deposit", "investment", "fd maturity"],
            "FinancialInstitution",
            1_000_000.0,
        ),
        EventCategory::new(
            "salary",
            &["salary", "payroll", "wages", "compensation", "monthly income"],
            "Employer",
            250_000.0,
        ),
    ]
}

// ── Keyword matcher ──────────────────────────────────────────────────────────

/// Keyword set compiled once and reused across every narrative.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    /// (lowercased keyword, category index), longest keyword first, then
    /// category declaration order.
    entries: Vec<(String, usize)>,
}

/// A keyword hit: which category and which keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordHit<'a> {
    pub category: usize,
    pub keyword: &'a str,
}

impl KeywordMatcher {
    pub fn new(categories: &[EventCategory]) -> Self {
        let mut entries: Vec<(String, usize)> = categories
            .iter()
            .enumerate()
            .flat_map(|(i, c)| {
                c.keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .map(move |k| (k, i))
            })
            .collect();
        // Stable sort keeps declaration order within equal lengths.
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best hit in `text`, or `None`.
    pub fn find(&self, text: &str) -> Option<KeywordHit<'_>> {
        let lowered = text.to_lowercase();
        self.find_lowered(&lowered)
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.find(text).is_some()
    }

    fn find_lowered(&self, lowered: &str) -> Option<KeywordHit<'_>> {
        self.entries
            .iter()
            .find(|(kw, _)| lowered.contains(kw.as_str()))
            .map(|(kw, cat)| KeywordHit {
                category: *cat,
                keyword: kw.as_str(),
            })
    }
}

// ── Whitelist ────────────────────────────────────────────────────────────────

/// Active whitelist entries keyed by (entity type, normalised name).
#[derive(Debug, Clone, Default)]
pub struct VerifiedEntities {
    entries: HashSet<(String, String)>,
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl VerifiedEntities {
    pub fn new(entities: &[VerifiedEntity]) -> Self {
        let entries = entities
            .iter()
            .filter(|e| e.is_active)
            .map(|e| (e.entity_type.clone(), normalize_name(&e.entity_name)))
            .collect();
        Self { entries }
    }

    pub fn contains(&self, entity_type: &str, name: &str) -> bool {
        self.entries
            .contains(&(entity_type.to_string(), normalize_name(name)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

const BASE_CONFIDENCE: f64 = 0.5;
const VERIFIED_CONFIDENCE: f64 = 0.3;
const REASONABLE_CONFIDENCE: f64 = 0.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub category: String,
    pub matched_keyword: String,
    pub is_verified: bool,
    pub amount_reasonable: bool,
    pub confidence: f64,
}

impl EventContext {
    /// Both conditions hold; the only context that may justify an exclusion.
    pub fn is_legitimate(&self) -> bool {
        self.is_verified && self.amount_reasonable
    }
}

#[derive(Debug, Clone)]
pub struct EventDetector {
    categories: Vec<EventCategory>,
    matcher: KeywordMatcher,
    whitelist: Option<Arc<VerifiedEntities>>,
}

impl EventDetector {
    pub fn new(categories: Vec<EventCategory>, whitelist: Option<Arc<VerifiedEntities>>) -> Self {
        let matcher = KeywordMatcher::new(&categories);
        Self {
            categories,
            matcher,
            whitelist,
        }
    }

    pub fn categories(&self) -> &[EventCategory] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&EventCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn has_whitelist(&self) -> bool {
        self.whitelist.is_some()
    }

    pub fn detect(&self, narrative: &str, amount: f64, beneficiary: Option<&str>) -> Option<EventContext> {
        let hit = self.matcher.find(narrative)?;
        let category = &self.categories[hit.category];

        let is_verified = match (&self.whitelist, beneficiary) {
            (Some(list), Some(name)) if !name.trim().is_empty() => {
                list.contains(&category.entity_type, name)
            }
            _ => false,
        };
        let amount_reasonable = category.amount_reasonable(amount);

        let mut confidence = BASE_CONFIDENCE;
        if is_verified {
            confidence += VERIFIED_CONFIDENCE;
        }
        if amount_reasonable {
            confidence += REASONABLE_CONFIDENCE;
        }

        Some(EventContext {
            category: category.name.clone(),
            matched_keyword: hit.keyword.to_string(),
            is_verified,
            amount_reasonable,
            confidence,
        })
    }
}

impl Default for EventDetector {
    fn default() -> Self {
        Self::new(default_categories(), None)
    }
}
