// ===============================
// src/rules.rs (rule CRUD + evaluator)
// ===============================
//
// Kebijakan kombinasi kondisi: ANY.
//   Rule terpicu jika minimal satu kondisi yang dikenal (dengan threshold
//   valid) dilanggar. Threshold yang tidak bisa di-parse = kondisi di-skip.
//
// Kondisi yang dikenal:
//   max_volume        : event.volume        > threshold
//   max_positions     : state.open_positions > threshold
//   max_day_volume    : state.day_volume    > threshold
//   symbol_restricted : event.symbol       == threshold
//
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::{now_nanos, Event, Rule, RuleAction, UserState, MAX_SEVERITY, MIN_SEVERITY};
use crate::store::{Storage, StoreError};

pub const MAX_VOLUME: &str = "max_volume";
pub const MAX_POSITIONS: &str = "max_positions";
pub const MAX_DAY_VOLUME: &str = "max_day_volume";
pub const SYMBOL_RESTRICTED: &str = "symbol_restricted";

static RULE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    Invalid(String),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RuleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(k) => RuleError::NotFound(k),
            other => RuleError::Store(other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub conditions: BTreeMap<String, String>,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub conditions: Option<BTreeMap<String, String>>,
    pub actions: Option<Vec<RuleAction>>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

fn validate(name: &str, conditions: &BTreeMap<String, String>, actions: &[RuleAction]) -> Result<(), RuleError> {
    if name.trim().is_empty() {
        return Err(RuleError::Invalid("name is required".into()));
    }
    if conditions.is_empty() {
        return Err(RuleError::Invalid("at least one condition is required".into()));
    }
    if actions.is_empty() {
        return Err(RuleError::Invalid("at least one action is required".into()));
    }
    for a in actions {
        if a.kind.trim().is_empty() {
            return Err(RuleError::Invalid("action type is required".into()));
        }
        if !(MIN_SEVERITY..=MAX_SEVERITY).contains(&a.severity) {
            return Err(RuleError::Invalid(format!(
                "action '{}' severity {} outside {}..={}",
                a.kind, a.severity, MIN_SEVERITY, MAX_SEVERITY
            )));
        }
    }
    Ok(())
}

pub struct RuleService {
    storage: Arc<dyn Storage>,
}

impl RuleService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn create_rule(&self, req: CreateRuleRequest) -> Result<Rule, RuleError> {
        validate(&req.name, &req.conditions, &req.actions)?;
        let now = now_nanos();
        let rule = Rule {
            id: format!("rule-{now}-{}", RULE_SEQ.fetch_add(1, Ordering::Relaxed)),
            name: req.name,
            conditions: req.conditions,
            actions: req.actions,
            enabled: req.enabled,
            priority: req.priority,
            created_at: now,
            updated_at: now,
        };
        self.storage.save_rule(&rule)?;
        Ok(rule)
    }

    pub fn update_rule(&self, id: &str, req: UpdateRuleRequest) -> Result<Rule, RuleError> {
        let mut rule = self.storage.get_rule(id)?;
        if let Some(name) = req.name.filter(|n| !n.is_empty()) {
            rule.name = name;
        }
        if let Some(c) = req.conditions {
            rule.conditions = c;
        }
        if let Some(a) = req.actions {
            rule.actions = a;
        }
        if let Some(e) = req.enabled {
            rule.enabled = e;
        }
        if let Some(p) = req.priority {
            rule.priority = p;
        }
        validate(&rule.name, &rule.conditions, &rule.actions)?;
        rule.updated_at = now_nanos();
        self.storage.save_rule(&rule)?;
        Ok(rule)
    }

    pub fn delete_rule(&self, id: &str) -> Result<(), RuleError> {
        self.storage.get_rule(id)?;
        self.storage.delete_rule(id)?;
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Result<Rule, RuleError> {
        Ok(self.storage.get_rule(id)?)
    }

    /// Full rule set, highest priority first (display order only).
    pub fn get_all_rules(&self) -> Result<Vec<Rule>, RuleError> {
        let mut rules = self.storage.get_all_rules()?;
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(rules)
    }
}

/// Decide whether `rule` fires for `event` against the post-event `state`.
/// Does not look at `rule.enabled`; callers filter disabled rules.
pub fn evaluate(rule: &Rule, event: &Event, state: &UserState) -> bool {
    rule.conditions
        .iter()
        .any(|(name, threshold)| condition_violated(name, threshold, event, state))
}

fn condition_violated(name: &str, threshold: &str, event: &Event, state: &UserState) -> bool {
    match name {
        MAX_VOLUME => match threshold.trim().parse::<f64>() {
            Ok(max) => event.volume > max,
            Err(_) => skip(name, threshold),
        },
        MAX_POSITIONS => match threshold.trim().parse::<i64>() {
            Ok(max) => state.open_positions > max,
            Err(_) => skip(name, threshold),
        },
        MAX_DAY_VOLUME => match threshold.trim().parse::<f64>() {
            Ok(max) => state.day_volume > max,
            Err(_) => skip(name, threshold),
        },
        SYMBOL_RESTRICTED => event.symbol == threshold,
        _ => false,
    }
}

fn skip(name: &str, threshold: &str) -> bool {
    debug!(condition = name, threshold, "unparseable threshold, condition skipped");
    false
}
