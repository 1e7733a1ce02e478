// ===============================
// src/connections.rs (DLL connection manager)
// ===============================
//
// Per koneksi DLL:
//   - 1 task reader : socket -> FrameDecoder<Event> -> antrian ingest (try, drop jika penuh)
//   - 1 task writer : antrian enforcement koneksi -> encode_frame -> socket
// Reader dan writer tidak pernah saling menunggu. Writer yang gagal menulis
// memberi sinyal shutdown ke reader; reader yang keluar membersihkan registry.
// Socket tertutup setelah kedua half di-drop.
//
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc, Weak,
};

use ahash::AHashSet;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, Notify},
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};

use crate::codec::{encode_frame, FrameDecoder};
use crate::domain::{now_secs, ConnectionInfo, EnforcementMessage, Event};
use crate::keyed::ShardedMap;
use crate::metrics::{DLL_ACCEPTED, DLL_ACTIVE, ENFORCEMENTS, EVENTS_RECEIVED};
use crate::pipeline::{IngestSender, SubmitError};

pub const READ_BUF: usize = 8192;
/// A connection whose last ping is older than this (strictly) goes inactive.
pub const STALE_AFTER_SECS: i64 = 60;
/// Jeda setelah accept gagal (mis. EMFILE) supaya loop tidak spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("client id is required")]
    MissingClientId,
}

/// Outcome of `send_enforcement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Queued(String),
    NoActiveConnection,
    QueueFull(String),
    Closed(String),
}

pub struct DllConnection {
    pub id: String,
    serial: u64,
    active: AtomicBool,
    last_ping: AtomicI64,
    enforce_tx: mpsc::Sender<EnforcementMessage>,
    shutdown: Notify,
    users: RwLock<AHashSet<String>>,
}

impl DllConnection {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn last_ping(&self) -> i64 {
        self.last_ping.load(Ordering::Acquire)
    }

    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    // Traffic masuk = ping.
    fn touch(&self, now: i64) {
        self.last_ping.store(now, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    fn note_user(&self, user_id: &str) {
        if self.users.read().contains(user_id) {
            return;
        }
        self.users.write().insert(user_id.to_string());
    }

    fn serves(&self, user_id: &str) -> bool {
        self.users.read().contains(user_id)
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo { id: self.id.clone(), active: self.is_active(), last_ping: self.last_ping() }
    }
}

pub struct ConnectionManager {
    registry: ShardedMap<Arc<DllConnection>>,
    ingest: IngestSender,
    bind_host: String,
    enforce_buffer: usize,
    next_serial: AtomicU64,
}

impl ConnectionManager {
    pub fn new(ingest: IngestSender, bind_host: &str, enforce_buffer: usize) -> Self {
        Self {
            registry: ShardedMap::new(),
            ingest,
            bind_host: bind_host.to_string(),
            enforce_buffer: enforce_buffer.max(1),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Bind an ephemeral port for `client_id` and accept connections on it in
    /// the background. Returns the bound port.
    pub async fn start_listener(self: &Arc<Self>, client_id: &str) -> Result<u16, ConnectionError> {
        if client_id.trim().is_empty() {
            return Err(ConnectionError::MissingClientId);
        }
        let addr = format!("{}:0", self.bind_host);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr: addr.clone(), source })?;
        let port = listener
            .local_addr()
            .map_err(|source| ConnectionError::Bind { addr, source })?
            .port();
        info!(dll_id = client_id, port, "DLL listener started");

        let mgr = self.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move { mgr.accept_loop(listener, client_id).await });
        Ok(port)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, client_id: String) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    DLL_ACCEPTED.inc();
                    info!(dll_id = %client_id, %peer, "DLL connected");
                    self.clone().attach(&client_id, stream);
                }
                Err(e) => {
                    error!(?e, dll_id = %client_id, "DLL accept error");
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn attach(self: Arc<Self>, client_id: &str, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(?e, "set_nodelay failed");
        }
        let (rd, wr) = stream.into_split();
        let (conn, enforce_rx) = self.register(client_id);
        tokio::spawn(write_loop(Arc::downgrade(&conn), conn.id.clone(), enforce_rx, wr));
        tokio::spawn(self.read_loop(conn, rd));
    }

    /// Create and register a connection entry. An existing entry for the same
    /// id is superseded: it goes inactive and its reader is told to close.
    pub(crate) fn register(&self, client_id: &str) -> (Arc<DllConnection>, mpsc::Receiver<EnforcementMessage>) {
        let (enforce_tx, enforce_rx) = mpsc::channel(self.enforce_buffer);
        let conn = Arc::new(DllConnection {
            id: client_id.to_string(),
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            last_ping: AtomicI64::new(now_secs()),
            enforce_tx,
            shutdown: Notify::new(),
            users: RwLock::new(AHashSet::new()),
        });

        if let Some(prev) = self.registry.insert(client_id, conn.clone()) {
            prev.deactivate();
            prev.shutdown.notify_one();
            warn!(dll_id = client_id, "DLL connection superseded, closing previous transport");
        }
        DLL_ACTIVE.set(self.active_count() as i64);
        (conn, enforce_rx)
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<DllConnection>, mut rd: OwnedReadHalf) {
        let mut decoder = FrameDecoder::<Event>::new();
        let mut buf = vec![0u8; READ_BUF];

        loop {
            let n = tokio::select! {
                _ = conn.shutdown.notified() => {
                    info!(dll_id = %conn.id, "DLL reader shutting down");
                    break;
                }
                r = rd.read(&mut buf) => match r {
                    Ok(0) => {
                        info!(dll_id = %conn.id, "DLL connection closed by peer");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(dll_id = %conn.id, ?e, "DLL connection read error");
                        break;
                    }
                },
            };

            let events = match decoder.decode(&buf[..n]) {
                Ok(evs) => evs,
                Err(e) => {
                    warn!(dll_id = %conn.id, ?e, "DLL protocol violation, closing");
                    break;
                }
            };
            for ev in events {
                EVENTS_RECEIVED.inc();
                conn.note_user(&ev.user_id);
                match self.ingest.offer(ev) {
                    Ok(()) => {}
                    Err(SubmitError::Full) => {
                        warn!(dll_id = %conn.id, "event buffer full, dropping event");
                    }
                    Err(SubmitError::Closed) => {
                        warn!(dll_id = %conn.id, "ingestion closed, dropping event");
                    }
                }
            }
            conn.touch(now_secs());
            if let Some(e) = decoder.violation() {
                warn!(dll_id = %conn.id, ?e, "DLL protocol violation, closing");
                break;
            }
        }

        if decoder.buffered() > 0 {
            debug!(dll_id = %conn.id, bytes = decoder.buffered(), "partial frame discarded");
        }
        conn.deactivate();
        self.registry.remove_if(&conn.id, |c| c.serial == conn.serial);
        DLL_ACTIVE.set(self.active_count() as i64);
    }

    /// Queue `msg` on one active connection without waiting. Prefers a
    /// connection that has carried events for `msg.user_id`, otherwise the
    /// first active one in registry order.
    pub fn send_enforcement(&self, msg: &EnforcementMessage) -> Delivery {
        let target = self
            .registry
            .find(|c| c.is_active() && c.serves(&msg.user_id))
            .or_else(|| self.registry.find(|c| c.is_active()));

        let Some(conn) = target else {
            warn!(user_id = %msg.user_id, action = %msg.action, "no active DLL connection for enforcement");
            ENFORCEMENTS.with_label_values(&["dll", "no_connection"]).inc();
            return Delivery::NoActiveConnection;
        };

        let delivery = match conn.enforce_tx.try_send(msg.clone()) {
            Ok(()) => Delivery::Queued(conn.id.clone()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(dll_id = %conn.id, "enforcement channel full");
                Delivery::QueueFull(conn.id.clone())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(dll_id = %conn.id, "enforcement channel closed");
                Delivery::Closed(conn.id.clone())
            }
        };
        let outcome = match &delivery {
            Delivery::Queued(_) => "queued",
            Delivery::QueueFull(_) => "full",
            Delivery::Closed(_) => "closed",
            Delivery::NoActiveConnection => "no_connection",
        };
        ENFORCEMENTS.with_label_values(&["dll", outcome]).inc();
        delivery
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.registry.values().iter().map(|c| c.info()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.values().iter().filter(|c| c.is_active()).count()
    }

    pub fn check_health(&self) -> usize {
        self.check_health_at(now_secs())
    }

    /// Mark connections whose last ping is more than `STALE_AFTER_SECS` old
    /// as inactive. Transports stay open. Returns how many flipped.
    pub fn check_health_at(&self, now: i64) -> usize {
        let mut flipped = 0;
        self.registry.for_each_exclusive(|id, conn| {
            if now - conn.last_ping() > STALE_AFTER_SECS && conn.deactivate() {
                flipped += 1;
                info!(dll_id = id, "DLL connection marked as inactive");
            }
        });
        if flipped > 0 {
            DLL_ACTIVE.set(self.active_count() as i64);
        }
        flipped
    }
}

async fn write_loop(
    conn: Weak<DllConnection>,
    dll_id: String,
    mut rx: mpsc::Receiver<EnforcementMessage>,
    mut wr: OwnedWriteHalf,
) {
    while let Some(msg) = rx.recv().await {
        let frame = match encode_frame(&msg) {
            Ok(f) => f,
            Err(e) => {
                warn!(dll_id = %dll_id, ?e, "enforcement encode failed, skipped");
                continue;
            }
        };
        if let Err(e) = wr.write_all(&frame).await {
            warn!(dll_id = %dll_id, ?e, "enforcement write failed");
            if let Some(c) = conn.upgrade() {
                c.deactivate();
                c.shutdown.notify_one();
            }
            break;
        }
        debug!(dll_id = %dll_id, action = %msg.action, user_id = %msg.user_id, "enforcement delivered");
    }
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use crate::domain::EventType;
    use crate::pipeline::{ingest_queue, IngestQueue};
    use std::time::Duration;
    use tokio::time::timeout;

    fn manager(buffer: usize) -> (Arc<ConnectionManager>, IngestQueue) {
        let (tx, queue) = ingest_queue(64);
        (Arc::new(ConnectionManager::new(tx, "127.0.0.1", buffer)), queue)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn dial(mgr: &Arc<ConnectionManager>, id: &str) -> TcpStream {
        let port = mgr.start_listener(id).await.unwrap();
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    #[tokio::test]
    async fn frames_split_across_writes_reach_the_queue_in_order() {
        let (mgr, queue) = manager(8);
        let mut client = dial(&mgr, "dll-a").await;

        let evs = [
            Event::new("u1", EventType::OrderOpen, "EURUSD", 1.0, 1.5),
            Event::new("u1", EventType::OrderClose, "EURUSD", 1.0, 1.5),
        ];
        let bytes: Vec<u8> = evs.iter().flat_map(|e| encode_frame(e).unwrap()).collect();
        let (a, b) = bytes.split_at(7);
        client.write_all(a).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b).await.unwrap();

        for expected in &evs {
            let got = timeout(Duration::from_secs(5), queue.recv()).await.unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        wait_for(|| mgr.active_count() == 1).await;
    }

    #[tokio::test]
    async fn enforcement_is_framed_back_to_the_client() {
        let (mgr, queue) = manager(8);
        let mut client = dial(&mgr, "dll-b").await;
        client
            .write_all(&encode_frame(&Event::new("u7", EventType::OrderOpen, "X", 1.0, 1.0)).unwrap())
            .await
            .unwrap();
        timeout(Duration::from_secs(5), queue.recv()).await.unwrap().unwrap();

        let msg = EnforcementMessage::new("u7", "close_position", "Rule violation: big", 4);
        assert_eq!(mgr.send_enforcement(&msg), Delivery::Queued("dll-b".into()));

        let mut dec = FrameDecoder::<EnforcementMessage>::new();
        let mut buf = [0u8; 1024];
        let got = timeout(Duration::from_secs(5), async {
            loop {
                let n = client.read(&mut buf).await.unwrap();
                let out = dec.decode(&buf[..n]).unwrap();
                if let Some(m) = out.into_iter().next() {
                    return m;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn no_active_connection_means_no_delivery() {
        let (mgr, _queue) = manager(8);
        let msg = EnforcementMessage::new("u1", "close_position", "r", 3);
        assert_eq!(mgr.send_enforcement(&msg), Delivery::NoActiveConnection);

        let (conn, _rx) = mgr.register("idle");
        conn.deactivate();
        assert_eq!(mgr.send_enforcement(&msg), Delivery::NoActiveConnection);
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_without_blocking() {
        let (mgr, _queue) = manager(1);
        let (_conn, _rx) = mgr.register("slow");
        let msg = EnforcementMessage::new("u1", "close_position", "r", 3);
        assert_eq!(mgr.send_enforcement(&msg), Delivery::Queued("slow".into()));
        assert_eq!(mgr.send_enforcement(&msg), Delivery::QueueFull("slow".into()));
    }

    #[tokio::test]
    async fn serving_connection_is_preferred() {
        let (mgr, _queue) = manager(8);
        let (_a, _rxa) = mgr.register("dll-a");
        let (b, mut rxb) = mgr.register("dll-b");
        b.note_user("trader-9");

        let msg = EnforcementMessage::new("trader-9", "restrict_symbol", "r", 2);
        for _ in 0..5 {
            assert_eq!(mgr.send_enforcement(&msg), Delivery::Queued("dll-b".into()));
        }
        assert!(rxb.try_recv().is_ok());
    }

    #[tokio::test]
    async fn health_check_boundary_is_strictly_greater_than_sixty() {
        let (mgr, _queue) = manager(8);
        let now = 1_000_000;
        let (c61, _r1) = mgr.register("age-61");
        let (c60, _r2) = mgr.register("age-60");
        let (c59, _r3) = mgr.register("age-59");
        c61.last_ping.store(now - 61, Ordering::Release);
        c60.last_ping.store(now - 60, Ordering::Release);
        c59.last_ping.store(now - 59, Ordering::Release);

        assert_eq!(mgr.check_health_at(now), 1);
        assert!(!c61.is_active());
        assert!(c60.is_active());
        assert!(c59.is_active());
        assert_eq!(mgr.active_count(), 2);
        // entries stay registered
        assert_eq!(mgr.get_connections().len(), 3);
        // already inactive: not counted again
        assert_eq!(mgr.check_health_at(now), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_removes_registry_entry() {
        let (mgr, _queue) = manager(8);
        let client = dial(&mgr, "dll-gone").await;
        wait_for(|| mgr.get_connections().len() == 1).await;
        drop(client);
        wait_for(|| mgr.get_connections().is_empty()).await;
    }

    #[tokio::test]
    async fn reconnect_under_same_id_closes_previous_transport() {
        let (mgr, _queue) = manager(8);
        let port = mgr.start_listener("dll-dup").await.unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for(|| mgr.get_connections().len() == 1).await;
        let _second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), first.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0, "superseded transport should be closed");

        wait_for(|| mgr.active_count() == 1).await;
        assert_eq!(mgr.get_connections().len(), 1);
    }

    #[tokio::test]
    async fn events_ahead_of_an_oversized_frame_are_queued_before_close() {
        let (mgr, queue) = manager(8);
        let mut client = dial(&mgr, "dll-big").await;
        wait_for(|| mgr.get_connections().len() == 1).await;

        let ev = Event::new("u3", EventType::OrderOpen, "EURUSD", 2.0, 1.5);
        let mut bytes = encode_frame(&ev).unwrap();
        bytes.extend_from_slice(&((crate::codec::MAX_FRAME_LEN + 1) as u32).to_le_bytes());
        client.write_all(&bytes).await.unwrap();

        let got = timeout(Duration::from_secs(5), queue.recv()).await.unwrap().unwrap();
        assert_eq!(got, ev);
        wait_for(|| mgr.get_connections().is_empty()).await;
    }

    #[tokio::test]
    async fn empty_client_id_is_rejected() {
        let (mgr, _queue) = manager(8);
        assert!(matches!(mgr.start_listener(" ").await, Err(ConnectionError::MissingClientId)));
    }
}
