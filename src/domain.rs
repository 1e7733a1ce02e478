// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const MIN_SEVERITY: i32 = 1;
pub const MAX_SEVERITY: i32 = 5;
pub const DEFAULT_SEVERITY: i32 = 3;

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Jenis event dari plugin DLL. Nilai yang belum dikenal tetap dibawa apa adanya.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    OrderOpen,
    OrderClose,
    BalanceUpdate,
    EquityUpdate,
    Other(String),
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ORDER_OPEN" => EventType::OrderOpen,
            "ORDER_CLOSE" => EventType::OrderClose,
            "BALANCE_UPDATE" => EventType::BalanceUpdate,
            "EQUITY_UPDATE" => EventType::EquityUpdate,
            _ => EventType::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::OrderOpen => "ORDER_OPEN".to_string(),
            EventType::OrderClose => "ORDER_CLOSE".to_string(),
            EventType::BalanceUpdate => "BALANCE_UPDATE".to_string(),
            EventType::EquityUpdate => "EQUITY_UPDATE".to_string(),
            EventType::Other(s) => s,
        }
    }
}

/// Trading activity reported by a DLL client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub timestamp: i64,
}

impl Event {
    pub fn new(user_id: &str, event_type: EventType, symbol: &str, volume: f64, price: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            event_type,
            symbol: symbol.to_string(),
            volume,
            price,
            timestamp: now_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementMessage {
    pub user_id: String,
    pub action: String,
    pub reason: String,
    pub severity: i32,
    pub timestamp: i64,
}

impl EnforcementMessage {
    /// Severity is clamped into 1..=5.
    pub fn new(user_id: &str, action: &str, reason: &str, severity: i32) -> Self {
        Self {
            user_id: user_id.to_string(),
            action: action.to_string(),
            reason: reason.to_string(),
            severity: severity.clamp(MIN_SEVERITY, MAX_SEVERITY),
            timestamp: now_secs(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleActionRepr {
    Bare(String),
    Full {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default = "default_severity")]
        severity: i32,
    },
}

fn default_severity() -> i32 {
    DEFAULT_SEVERITY
}

impl From<RuleActionRepr> for RuleAction {
    fn from(r: RuleActionRepr) -> Self {
        match r {
            RuleActionRepr::Bare(kind) => RuleAction { kind, severity: DEFAULT_SEVERITY },
            RuleActionRepr::Full { kind, severity } => RuleAction { kind, severity },
        }
    }
}

/// Aksi yang dijalankan saat rule terpicu, mis. "close_position".
/// Input boleh string polos (severity default 3) atau objek lengkap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RuleActionRepr")]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: i32,
}

impl RuleAction {
    pub fn new(kind: &str, severity: i32) -> Self {
        Self { kind: kind.to_string(), severity }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

/// Per-user risk state. Lives behind its own lock inside the user store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserState {
    pub user_id: String,
    pub balance: f64,
    pub equity: f64,
    /// Not clamped at zero: an unmatched ORDER_CLOSE drives it negative.
    pub open_positions: i64,
    pub day_volume: f64,
    pub last_activity: i64,
    pub risk_level: String,
    pub violation_count: i64,
    pub custom_data: BTreeMap<String, String>,
}

impl UserState {
    pub fn new(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub active: bool,
    pub last_ping: i64,
}

/// Envelope `{type, data}` untuk klien WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_keeps_unknown_names() {
        let ev: Event = serde_json::from_str(
            r#"{"user_id":"u1","event_type":"MARGIN_CALL","symbol":"EURUSD","volume":1.0,"price":1.1,"timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(ev.event_type, EventType::Other("MARGIN_CALL".into()));
        let back = serde_json::to_value(&ev).unwrap();
        assert_eq!(back["event_type"], "MARGIN_CALL");
    }

    #[test]
    fn event_missing_numeric_fields_default_to_zero() {
        let ev: Event = serde_json::from_str(r#"{"user_id":"u1","event_type":"ORDER_CLOSE"}"#).unwrap();
        assert_eq!(ev.event_type, EventType::OrderClose);
        assert_eq!(ev.volume, 0.0);
        assert!(ev.symbol.is_empty());
    }

    #[test]
    fn rule_actions_accept_bare_strings_and_objects() {
        let rule: Rule = serde_json::from_str(
            r#"{"id":"r1","name":"big","conditions":{"max_volume":"10"},
                "actions":["close_position",{"type":"restrict_symbol","severity":5}],"enabled":true}"#,
        )
        .unwrap();
        assert_eq!(rule.actions[0], RuleAction::new("close_position", DEFAULT_SEVERITY));
        assert_eq!(rule.actions[1], RuleAction::new("restrict_symbol", 5));
    }

    #[test]
    fn enforcement_severity_is_clamped() {
        assert_eq!(EnforcementMessage::new("u", "a", "r", 9).severity, MAX_SEVERITY);
        assert_eq!(EnforcementMessage::new("u", "a", "r", 0).severity, MIN_SEVERITY);
        assert_eq!(EnforcementMessage::new("u", "a", "r", 4).severity, 4);
    }

    #[test]
    fn fresh_user_state_is_zeroed() {
        let st = UserState::new("u9");
        assert_eq!(st.user_id, "u9");
        assert_eq!(st.balance, 0.0);
        assert_eq!(st.open_positions, 0);
        assert_eq!(st.violation_count, 0);
        assert!(st.custom_data.is_empty());
    }
}
