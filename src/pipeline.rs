// ===============================
// src/pipeline.rs (ingestion queue + worker pool)
// ===============================
//
// Satu antrian bounded dibagi oleh N worker (tanpa partisi per worker):
//   take event -> get_or_create state -> apply -> ambil semua rule ->
//   evaluate rule aktif -> enforcement ke DLL + viewer.
// Urutan antar user (bahkan dalam satu user) tidak dijamin bila N > 1.
// Stop = sinyal satu kali; event yang masih antre dibuang.
//
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::connections::ConnectionManager;
use crate::domain::{EnforcementMessage, Event};
use crate::metrics::{EVENTS_ABANDONED, EVENTS_DROPPED, EVENTS_PROCESSED, QUEUE_DEPTH, RULE_TRIGGERS};
use crate::notify::NotificationHub;
use crate::recorder::Record;
use crate::rules::{evaluate, RuleService};
use crate::users::UserStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("ingestion queue full")]
    Full,
    #[error("ingestion queue closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline already stopped")]
    AlreadyStopped,
}

/// Producer side of the ingestion queue; cheap to clone.
#[derive(Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<Event>,
    capacity: usize,
}

impl IngestSender {
    /// Non-blocking offer; a full queue drops the event.
    pub fn offer(&self, ev: Event) -> Result<(), SubmitError> {
        match self.tx.try_send(ev) {
            Ok(()) => {
                QUEUE_DEPTH.set(self.depth() as i64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                EVENTS_DROPPED.inc();
                Err(SubmitError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

/// Consumer side shared by all workers.
#[derive(Clone)]
pub struct IngestQueue {
    rx: Arc<AsyncMutex<mpsc::Receiver<Event>>>,
}

impl IngestQueue {
    pub async fn recv(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }
}

pub fn ingest_queue(capacity: usize) -> (IngestSender, IngestQueue) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (IngestSender { tx, capacity }, IngestQueue { rx: Arc::new(AsyncMutex::new(rx)) })
}

pub struct EventPipeline {
    queue: IngestQueue,
    sender: IngestSender,
    rules: Arc<RuleService>,
    users: Arc<UserStore>,
    dll: Arc<ConnectionManager>,
    hub: Arc<NotificationHub>,
    recorder: Option<mpsc::Sender<Record>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventPipeline {
    pub fn new(
        (sender, queue): (IngestSender, IngestQueue),
        rules: Arc<RuleService>,
        users: Arc<UserStore>,
        dll: Arc<ConnectionManager>,
        hub: Arc<NotificationHub>,
        recorder: Option<mpsc::Sender<Record>>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { queue, sender, rules, users, dll, hub, recorder, stop_tx, workers: Mutex::new(Vec::new()) }
    }

    pub fn sender(&self) -> &IngestSender {
        &self.sender
    }

    pub fn start(self: &Arc<Self>, workers: usize) {
        let mut handles = self.workers.lock();
        for idx in 0..workers {
            handles.push(tokio::spawn(self.clone().worker(idx)));
        }
        info!(workers, "event pipeline started");
    }

    /// Fire the stop signal. Only the first call succeeds.
    pub fn stop(&self) -> Result<(), PipelineError> {
        if self.stop_tx.send_replace(true) {
            return Err(PipelineError::AlreadyStopped);
        }
        info!("event pipeline stopped");
        Ok(())
    }

    /// Wait for every started worker to exit.
    pub async fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for h in handles {
            let _ = h.await;
        }
    }

    async fn worker(self: Arc<Self>, idx: usize) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = stop.changed() => break,
                ev = self.queue.recv() => ev,
            };
            let Some(ev) = next else { break };
            QUEUE_DEPTH.set(self.sender.depth() as i64);
            self.process_event(ev).await;
        }
        debug!(worker = idx, "pipeline worker exited");
    }

    /// One evaluation cycle. Returns the enforcements that were dispatched.
    pub async fn process_event(&self, event: Event) -> Vec<EnforcementMessage> {
        let handle = match self.users.get_or_create(&event.user_id) {
            Ok(h) => h,
            Err(e) => {
                warn!(?e, user_id = %event.user_id, "user state unavailable, event abandoned");
                EVENTS_ABANDONED.inc();
                return Vec::new();
            }
        };
        let state = self.users.apply_event(&handle, &event);
        self.record(Record::Event(event.clone()));

        let rules = match self.rules.get_all_rules() {
            Ok(r) => r,
            Err(e) => {
                warn!(?e, user_id = %event.user_id, "failed to get rules, event abandoned");
                EVENTS_ABANDONED.inc();
                return Vec::new();
            }
        };

        let mut sent = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            if !evaluate(rule, &event, &state) {
                continue;
            }
            RULE_TRIGGERS.with_label_values(&[&rule.id]).inc();
            self.users.record_violation(&handle);

            let reason = format!("Rule violation: {}", rule.name);
            for action in &rule.actions {
                let msg = EnforcementMessage::new(&event.user_id, &action.kind, &reason, action.severity);
                self.dispatch(&msg);
                info!(
                    action = %action.kind,
                    user_id = %event.user_id,
                    rule = %rule.name,
                    "enforcement triggered"
                );
                sent.push(msg);
            }
        }
        EVENTS_PROCESSED.inc();
        sent
    }

    /// Send to the DLL side and the viewer side. Both are non-blocking, so a
    /// failure on one never holds up the other.
    pub fn dispatch(&self, msg: &EnforcementMessage) {
        let delivery = self.dll.send_enforcement(msg);
        debug!(?delivery, user_id = %msg.user_id, "dll enforcement dispatch");
        self.hub.send_enforcement(msg);
        self.record(Record::Enforcement(msg.clone()));
    }

    fn record(&self, rec: Record) {
        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(rec);
        }
    }
}
