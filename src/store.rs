// ===============================
// src/store.rs (durable key-value storage)
// ===============================
//
// Kontrak penyimpanan: key string (`rule:<id>`, `user_state:<id>`), value JSON,
// last-write-wins, tanpa transaksi. `MemoryStore` menyimpan semuanya di memori
// dan bisa di-snapshot ke file (STORE_SNAPSHOT) agar selamat dari restart.
//
use std::{collections::BTreeMap, fs, io, path::Path};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{Rule, UserState};

pub const RULE_PREFIX: &str = "rule:";
pub const USER_STATE_PREFIX: &str = "user_state:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Durable storage collaborator. Implementations must be safe to call from
/// many tasks at once; callers never lock around these calls.
pub trait Storage: Send + Sync {
    fn save_rule(&self, rule: &Rule) -> Result<(), StoreError>;
    fn get_rule(&self, id: &str) -> Result<Rule, StoreError>;
    fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError>;
    fn delete_rule(&self, id: &str) -> Result<(), StoreError>;
    fn save_user_state(&self, state: &UserState) -> Result<(), StoreError>;
    fn get_user_state(&self, user_id: &str) -> Result<UserState, StoreError>;
    /// Flush whatever the backend buffers. Default: nothing to do.
    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub fn rule_key(id: &str) -> String {
    format!("{RULE_PREFIX}{id}")
}

pub fn user_state_key(user_id: &str) -> String {
    format!("{USER_STATE_PREFIX}{user_id}")
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, String>>,
    snapshot: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a snapshot file. A missing file starts empty.
    pub fn with_snapshot(path: &str) -> Result<Self, StoreError> {
        let data = if Path::new(path).exists() {
            let raw = fs::read_to_string(path)?;
            let map: BTreeMap<String, String> = serde_json::from_str(&raw)?;
            info!(%path, keys = map.len(), "store: snapshot loaded");
            map
        } else {
            BTreeMap::new()
        };
        Ok(Self { data: RwLock::new(data), snapshot: Some(path.to_string()) })
    }

    fn put(&self, key: String, value: String) {
        self.data.write().insert(key, value);
    }

    fn fetch(&self, key: &str) -> Result<String, StoreError> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Rewrite the snapshot file (write to temp, then rename).
    pub fn write_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else { return Ok(()) };
        let body = serde_json::to_vec(&*self.data.read())?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = format!("{path}.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        debug!(%path, keys = self.len(), "store: snapshot written");
        Ok(())
    }
}

impl Storage for MemoryStore {
    fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let value = serde_json::to_string(rule)?;
        self.put(rule_key(&rule.id), value);
        Ok(())
    }

    fn get_rule(&self, id: &str) -> Result<Rule, StoreError> {
        let raw = self.fetch(&rule_key(id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let raws: Vec<(String, String)> = self
            .data
            .read()
            .range(RULE_PREFIX.to_string()..)
            .take_while(|(k, _)| k.starts_with(RULE_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut rules = Vec::with_capacity(raws.len());
        for (key, raw) in raws {
            match serde_json::from_str::<Rule>(&raw) {
                Ok(r) => rules.push(r),
                Err(e) => warn!(?e, %key, "store: skip undecodable rule"),
            }
        }
        Ok(rules)
    }

    fn delete_rule(&self, id: &str) -> Result<(), StoreError> {
        self.data.write().remove(&rule_key(id));
        Ok(())
    }

    fn save_user_state(&self, state: &UserState) -> Result<(), StoreError> {
        let value = serde_json::to_string(state)?;
        self.put(user_state_key(&state.user_id), value);
        Ok(())
    }

    fn get_user_state(&self, user_id: &str) -> Result<UserState, StoreError> {
        let raw = self.fetch(&user_state_key(user_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn close(&self) -> Result<(), StoreError> {
        self.write_snapshot()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// MemoryStore whose rule listing and user loads can be switched to fail.
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: MemoryStore,
        pub fail_rules: AtomicBool,
        pub fail_user_loads: AtomicBool,
    }

    impl FlakyStore {
        pub fn set_failing(&self, on: bool) {
            self.fail_rules.store(on, Ordering::SeqCst);
        }

        pub fn set_user_loads_failing(&self, on: bool) {
            self.fail_user_loads.store(on, Ordering::SeqCst);
        }
    }

    impl Storage for FlakyStore {
        fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
            self.inner.save_rule(rule)
        }
        fn get_rule(&self, id: &str) -> Result<Rule, StoreError> {
            self.inner.get_rule(id)
        }
        fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError> {
            if self.fail_rules.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("rules offline".into()));
            }
            self.inner.get_all_rules()
        }
        fn delete_rule(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_rule(id)
        }
        fn save_user_state(&self, state: &UserState) -> Result<(), StoreError> {
            self.inner.save_user_state(state)
        }
        fn get_user_state(&self, user_id: &str) -> Result<UserState, StoreError> {
            if self.fail_user_loads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("user states offline".into()));
            }
            self.inner.get_user_state(user_id)
        }
    }

    /// MemoryStore that stalls saves of a state with an odd position count,
    /// so concurrent write-backs finish out of order.
    #[derive(Default)]
    pub struct SlowStore {
        pub inner: MemoryStore,
    }

    impl Storage for SlowStore {
        fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
            self.inner.save_rule(rule)
        }
        fn get_rule(&self, id: &str) -> Result<Rule, StoreError> {
            self.inner.get_rule(id)
        }
        fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError> {
            self.inner.get_all_rules()
        }
        fn delete_rule(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_rule(id)
        }
        fn save_user_state(&self, state: &UserState) -> Result<(), StoreError> {
            if state.open_positions % 2 != 0 {
                std::thread::sleep(Duration::from_millis(60));
            }
            self.inner.save_user_state(state)
        }
        fn get_user_state(&self, user_id: &str) -> Result<UserState, StoreError> {
            self.inner.get_user_state(user_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuleAction;

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            conditions: [("max_volume".to_string(), "10".to_string())].into_iter().collect(),
            actions: vec![RuleAction::new("close_position", 3)],
            enabled: true,
            priority: 1,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn rules_are_listed_by_prefix_only() {
        let s = MemoryStore::new();
        s.save_rule(&rule("a")).unwrap();
        s.save_rule(&rule("b")).unwrap();
        s.save_user_state(&UserState::new("rule-ish")).unwrap();

        let ids: Vec<String> = s.get_all_rules().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn last_write_wins_and_delete_removes() {
        let s = MemoryStore::new();
        let mut r = rule("x");
        s.save_rule(&r).unwrap();
        r.name = "renamed".into();
        s.save_rule(&r).unwrap();
        assert_eq!(s.get_rule("x").unwrap().name, "renamed");

        s.delete_rule("x").unwrap();
        assert!(matches!(s.get_rule("x"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn user_state_round_trips_through_json() {
        let s = MemoryStore::new();
        let mut st = UserState::new("u1");
        st.balance = 250.0;
        st.custom_data.insert("desk".into(), "fx".into());
        s.save_user_state(&st).unwrap();
        assert_eq!(s.get_user_state("u1").unwrap(), st);
        assert!(s.get_user_state("nobody").is_err());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("dll_guard_store_{}", std::process::id()));
        let path = dir.join("snap.json");
        let path = path.to_string_lossy().to_string();

        let s = MemoryStore::with_snapshot(&path).unwrap();
        s.save_rule(&rule("persisted")).unwrap();
        s.close().unwrap();

        let reopened = MemoryStore::with_snapshot(&path).unwrap();
        assert_eq!(reopened.get_rule("persisted").unwrap().name, "rule persisted");
        let _ = std::fs::remove_dir_all(dir);
    }
}
