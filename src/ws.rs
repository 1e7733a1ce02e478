// ===============================
// src/ws.rs (WebSocket viewer transport)
// ===============================
//
// ws://host:WS_PORT/?user_id=<id>
//   - handshake tanpa user_id -> HTTP 400
//   - keluar : pesan dari NotificationHub (text frame JSON)
//   - masuk  : {"type":"ping"} -> {"type":"pong","data":null}; tipe lain diabaikan
//
use std::{net::SocketAddr, sync::Arc};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::domain::WsMessage;
use crate::notify::NotificationHub;

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "websocket server listening");
    Ok(listener)
}

pub async fn serve(listener: TcpListener, hub: Arc<NotificationHub>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, hub.clone()));
            }
            Err(e) => warn!(?e, "websocket accept error"),
        }
    }
}

fn user_id_from(req: &Request) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "user_id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.trim().is_empty())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<NotificationHub>) {
    let mut user_id = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match user_id_from(req) {
            Some(id) => {
                user_id = Some(id);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("user_id is required".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, ?e, "websocket handshake rejected");
            return;
        }
    };
    let Some(user_id) = user_id else {
        return;
    };

    let (session, mut rx) = hub.add_client(&user_id);
    info!(%user_id, %peer, "websocket client connected");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            out = rx.recv() => {
                // None = sesi digantikan klien baru dengan user_id sama
                let Some(text) = out else { break };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(%user_id, ?e, "websocket write failed");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WsMessage>(&text) {
                        Ok(m) if m.kind == "ping" => {
                            let pong = WsMessage { kind: "pong".into(), data: serde_json::Value::Null };
                            let Ok(body) = serde_json::to_string(&pong) else { continue };
                            if sink.send(Message::Text(body)).await.is_err() {
                                break;
                            }
                        }
                        Ok(m) => debug!(%user_id, kind = %m.kind, "websocket message ignored"),
                        Err(e) => warn!(%user_id, ?e, "websocket message unparseable"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%user_id, ?e, "websocket read error");
                    break;
                }
            },
        }
    }

    hub.remove_client(&user_id, session);
    info!(%user_id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnforcementMessage;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    async fn start() -> (u16, Arc<NotificationHub>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hub = Arc::new(NotificationHub::new());
        tokio::spawn(serve(listener, hub.clone()));
        (port, hub)
    }

    async fn wait_clients(hub: &NotificationHub, n: usize) {
        timeout(Duration::from_secs(5), async {
            while hub.client_count() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count not reached");
    }

    #[tokio::test]
    async fn missing_user_id_is_rejected_with_400() {
        let (port, hub) = start().await;
        let err = connect_async(format!("ws://127.0.0.1:{port}/")).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), StatusCode::BAD_REQUEST)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn enforcement_and_pong_reach_the_viewer() {
        let (port, hub) = start().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/?user_id=u1")).await.unwrap();
        wait_clients(&hub, 1).await;

        hub.send_enforcement(&EnforcementMessage::new("u1", "close_position", "Rule violation: x", 4));
        let msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(v["type"], "enforcement");
        assert_eq!(v["data"]["user_id"], "u1");

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        let msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(v["type"], "pong");
        assert!(v["data"].is_null());

        ws.close(None).await.unwrap();
        wait_clients(&hub, 0).await;
    }
}
