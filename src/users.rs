// ===============================
// src/users.rs (per-user risk state)
// ===============================
use std::{collections::BTreeMap, sync::Arc};

use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::{now_secs, Event, EventType, UserState};
use crate::keyed::ShardedMap;
use crate::store::{StoreError, Storage};

/// Shared handle: lock dan data selalu berjalan bersama.
pub type UserHandle = Arc<RwLock<UserState>>;

/// Partial update from the admin surface; absent fields stay untouched.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserStateRequest {
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub open_positions: Option<i64>,
    pub day_volume: Option<f64>,
    pub risk_level: Option<String>,
    pub violation_count: Option<i64>,
    pub custom_data: Option<BTreeMap<String, String>>,
}

pub struct UserStore {
    states: ShardedMap<UserHandle>,
    // satu lock write-back per user: save untuk user yang sama tidak pernah balapan
    write_back: ShardedMap<Arc<Mutex<()>>>,
    storage: Arc<dyn Storage>,
}

impl UserStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { states: ShardedMap::new(), write_back: ShardedMap::new(), storage }
    }

    /// Memory first, then durable storage. Never creates.
    /// `Ok(None)` only when storage reports the user as absent; any other
    /// storage failure is returned so callers never mistake an outage for
    /// a new user.
    pub fn get(&self, user_id: &str) -> Result<Option<UserHandle>, StoreError> {
        if let Some(h) = self.states.get(user_id) {
            return Ok(Some(h));
        }
        match self.storage.get_user_state(user_id) {
            Ok(loaded) => Ok(Some(self.states.get_or_insert(user_id, Arc::new(RwLock::new(loaded))))),
            Err(StoreError::NotFound(_)) => {
                debug!(user_id, "user state not in storage");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch-or-create. Concurrent callers for an unseen user all end up with
    /// the same handle. A fresh state is created only on a confirmed miss.
    pub fn get_or_create(&self, user_id: &str) -> Result<UserHandle, StoreError> {
        if let Some(h) = self.get(user_id)? {
            return Ok(h);
        }
        let fresh: UserHandle = Arc::new(RwLock::new(UserState::new(user_id)));
        let stored = self.states.get_or_insert(user_id, fresh.clone());
        if Arc::ptr_eq(&stored, &fresh) {
            self.spawn_save(&stored);
        }
        Ok(stored)
    }

    /// Apply one DLL event and return the post-mutation copy used for rule
    /// evaluation.
    pub fn apply_event(&self, handle: &UserHandle, event: &Event) -> UserState {
        let snapshot = {
            let mut st = handle.write();
            let now = now_secs();
            roll_day(&mut st, now);

            match &event.event_type {
                EventType::OrderOpen => {
                    st.day_volume += event.volume;
                    st.open_positions += 1;
                }
                EventType::OrderClose => {
                    st.open_positions -= 1;
                }
                EventType::BalanceUpdate => st.balance = event.price,
                EventType::EquityUpdate => st.equity = event.price,
                EventType::Other(kind) => {
                    debug!(user_id = %st.user_id, %kind, "event type without state effect");
                }
            }
            st.last_activity = now;
            st.clone()
        };
        self.spawn_save(handle);
        snapshot
    }

    /// Manual update; only the fields present in `req` change.
    pub fn update(&self, user_id: &str, req: UpdateUserStateRequest) -> Result<UserState, StoreError> {
        let handle = self.get_or_create(user_id)?;
        let snapshot = {
            let mut st = handle.write();
            if let Some(v) = req.balance {
                st.balance = v;
            }
            if let Some(v) = req.equity {
                st.equity = v;
            }
            if let Some(v) = req.open_positions {
                st.open_positions = v;
            }
            if let Some(v) = req.day_volume {
                st.day_volume = v;
            }
            if let Some(v) = req.risk_level {
                st.risk_level = v;
            }
            if let Some(v) = req.violation_count {
                st.violation_count = v;
            }
            if let Some(extra) = req.custom_data {
                st.custom_data.extend(extra);
            }
            st.last_activity = now_secs();
            st.clone()
        };
        self.spawn_save(&handle);
        Ok(snapshot)
    }

    pub fn record_violation(&self, handle: &UserHandle) {
        {
            let mut st = handle.write();
            st.violation_count += 1;
            st.last_activity = now_secs();
        }
        self.spawn_save(handle);
    }

    pub fn user_count(&self) -> usize {
        self.states.len()
    }

    /// Persist every in-memory state synchronously. Returns how many failed.
    pub fn sync_all(&self) -> usize {
        let mut failed = 0;
        for handle in self.states.values() {
            let lock = self.write_lock(&handle.read().user_id);
            let _guard = lock.lock();
            let snapshot = handle.read().clone();
            if let Err(e) = self.storage.save_user_state(&snapshot) {
                failed += 1;
                warn!(user_id = %snapshot.user_id, ?e, "state sync failed");
            }
        }
        failed
    }

    fn write_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        match self.write_back.get(user_id) {
            Some(lock) => lock,
            None => self.write_back.get_or_insert(user_id, Arc::new(Mutex::new(()))),
        }
    }

    // Write-back di background: caller tidak menunggu, kegagalan hanya di-log.
    // Snapshot diambil di dalam lock per-user, jadi save yang selesai terakhir
    // selalu membawa state terbaru.
    fn spawn_save(&self, handle: &UserHandle) {
        let storage = self.storage.clone();
        let handle = handle.clone();
        let lock = self.write_lock(&handle.read().user_id);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let snapshot = handle.read().clone();
            if let Err(e) = storage.save_user_state(&snapshot) {
                warn!(user_id = %snapshot.user_id, ?e, "user state write-back failed");
            }
        });
    }
}

/// Reset day volume when the last activity happened on an earlier UTC day.
fn roll_day(st: &mut UserState, now: i64) {
    let day = |ts: i64| Utc.timestamp_opt(ts, 0).single().map(|d| d.date_naive());
    if day(st.last_activity) != day(now) {
        st.day_volume = 0.0;
    }
}
