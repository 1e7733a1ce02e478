// ===============================
// src/app.rs (service wiring)
// ===============================
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connections::ConnectionManager;
use crate::notify::NotificationHub;
use crate::pipeline::{ingest_queue, EventPipeline};
use crate::recorder::Record;
use crate::rules::RuleService;
use crate::store::Storage;
use crate::users::UserStore;

/// Every long-lived service, shared by the admin API and the background tasks.
pub struct App {
    pub storage: Arc<dyn Storage>,
    pub rules: Arc<RuleService>,
    pub users: Arc<UserStore>,
    pub dll: Arc<ConnectionManager>,
    pub hub: Arc<NotificationHub>,
    pub pipeline: Arc<EventPipeline>,
}

impl App {
    pub fn new(
        storage: Arc<dyn Storage>,
        event_buffer: usize,
        enforce_buffer: usize,
        bind_host: &str,
        recorder: Option<mpsc::Sender<Record>>,
    ) -> Self {
        // antrian dibuat dulu: ConnectionManager pegang sender, pipeline pegang receiver
        let (ingest_tx, ingest_rx) = ingest_queue(event_buffer);
        let rules = Arc::new(RuleService::new(storage.clone()));
        let users = Arc::new(UserStore::new(storage.clone()));
        let dll = Arc::new(ConnectionManager::new(ingest_tx.clone(), bind_host, enforce_buffer));
        let hub = Arc::new(NotificationHub::new());
        let pipeline = Arc::new(EventPipeline::new(
            (ingest_tx, ingest_rx),
            rules.clone(),
            users.clone(),
            dll.clone(),
            hub.clone(),
            recorder,
        ));
        Self { storage, rules, users, dll, hub, pipeline }
    }

    /// Persist every user state, then let the backend flush.
    pub fn sync_state(&self) {
        let failed = self.users.sync_all();
        if failed > 0 {
            warn!(failed, "state sync finished with failures");
        }
        if let Err(e) = self.storage.close() {
            warn!(?e, "storage flush failed");
        }
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.pipeline.stop() {
            warn!(?e, "pipeline stop");
        }
        self.sync_state();
        info!(users = self.users.user_count(), "final state sync done");
    }
}
