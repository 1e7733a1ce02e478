// ===============================
// src/mock.rs
// ===============================
//
// Mock DLL client (MOCK_DLL=1):
// - dial listener lokal milik "mock-dll"
// - kirim event acak (ORDER_OPEN/ORDER_CLOSE/BALANCE/EQUITY) untuk beberapa user sintetis
// - log setiap frame enforcement yang diterima balik
//
use std::time::Duration;

use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};
use tracing::{error, info, warn};

use crate::codec::{encode_frame, FrameDecoder};
use crate::connections::READ_BUF;
use crate::domain::{EnforcementMessage, Event, EventType};

pub const MOCK_DLL_ID: &str = "mock-dll";
const USERS: [&str; 3] = ["mock-u1", "mock-u2", "mock-u3"];
const SYMBOLS: [&str; 3] = ["EURUSD", "XAUUSD", "GBPJPY"];

/// Satu event acak.
pub fn random_event() -> Event {
    // jangan simpan ThreadRng melewati .await
    let mut rng = rand::thread_rng();
    let user = USERS[rng.gen_range(0..USERS.len())];
    let symbol = SYMBOLS[rng.gen_range(0..SYMBOLS.len())];
    let (event_type, volume, price) = match rng.gen_range(0..10) {
        0..=4 => (EventType::OrderOpen, rng.gen_range(1..=200) as f64 / 10.0, rng.gen_range(1.0..2.0)),
        5..=7 => (EventType::OrderClose, rng.gen_range(1..=200) as f64 / 10.0, rng.gen_range(1.0..2.0)),
        8 => (EventType::BalanceUpdate, 0.0, rng.gen_range(5_000.0..20_000.0)),
        _ => (EventType::EquityUpdate, 0.0, rng.gen_range(5_000.0..20_000.0)),
    };
    Event::new(user, event_type, symbol, volume, price)
}

/// Stream events to `port` every `every` until the server closes the socket.
pub async fn run(port: u16, every: Duration) {
    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(s) => s,
        Err(e) => {
            error!(?e, port, "mock dll: connect failed");
            return;
        }
    };
    info!(port, "mock dll: connected");
    let (mut rd, mut wr) = stream.into_split();

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::<EnforcementMessage>::new();
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            match decoder.decode(&buf[..n]) {
                Ok(msgs) => {
                    for m in msgs {
                        info!(user_id = %m.user_id, action = %m.action, severity = m.severity, reason = %m.reason, "mock dll: enforcement received");
                    }
                }
                Err(e) => {
                    warn!(?e, "mock dll: bad enforcement frame");
                    break;
                }
            }
        }
        info!("mock dll: reader stopped");
    });

    loop {
        let ev = random_event();
        let frame = match encode_frame(&ev) {
            Ok(f) => f,
            Err(e) => {
                warn!(?e, "mock dll: encode failed");
                continue;
            }
        };
        if let Err(e) = wr.write_all(&frame).await {
            warn!(?e, "mock dll: write failed, stopping");
            break;
        }
        sleep(every).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_events_stay_within_the_synthetic_universe() {
        for _ in 0..200 {
            let ev = random_event();
            assert!(USERS.contains(&ev.user_id.as_str()));
            assert!(SYMBOLS.contains(&ev.symbol.as_str()));
            match ev.event_type {
                EventType::OrderOpen | EventType::OrderClose => {
                    assert!(ev.volume >= 0.1 && ev.volume <= 20.0)
                }
                EventType::BalanceUpdate | EventType::EquityUpdate => assert!(ev.price >= 5_000.0),
                EventType::Other(_) => panic!("unexpected event type"),
            }
        }
    }
}
