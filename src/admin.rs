// ===============================
// src/admin.rs (admin HTTP API + /metrics)
// ===============================
//
// Routes:
//   POST   /dll/connect?dll_id=X
//   GET    /admin/rules            POST /admin/rules
//   PUT    /admin/rules/{id}       DELETE /admin/rules/{id}
//   GET    /admin/users/{id}/state PUT /admin/users/{id}/state
//   GET    /admin/connections
//   GET    /admin/metrics
//   POST   /admin/enforce/{user_id}
//   GET    /metrics                (Prometheus text)
//
// Error body selalu {"error": "..."}.
//
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    server::{conn::AddrIncoming, Builder},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::app::App;
use crate::domain::{now_secs, EnforcementMessage, MAX_SEVERITY, MIN_SEVERITY};
use crate::metrics::encode_metrics;
use crate::rules::{CreateRuleRequest, RuleError, UpdateRuleRequest};
use crate::users::UpdateUserStateRequest;

#[derive(Debug, Deserialize)]
pub struct EnforceRequest {
    pub action: String,
    #[serde(default)]
    pub reason: String,
    pub severity: i32,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub active_dll_connections: usize,
    pub websocket_clients: usize,
    pub user_states: usize,
    pub event_buffer_size: usize,
    pub event_queue_depth: usize,
    pub timestamp: i64,
}

pub fn bind(port: u16) -> Result<Builder<AddrIncoming>, hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let builder = Server::try_bind(&addr)?;
    info!(port, "admin api listening");
    Ok(builder)
}

pub async fn serve(builder: Builder<AddrIncoming>, app: Arc<App>) {
    let make_svc = make_service_fn(move |_conn| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(app.clone(), req))) }
    });
    if let Err(e) = builder.serve(make_svc).await {
        warn!(?e, "admin server error");
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn ok<T: Serialize>(body: &T) -> Response<Body> {
    json_response(StatusCode::OK, body)
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    json_response(status, &json!({ "error": msg.into() }))
}

fn rule_error(e: RuleError) -> Response<Body> {
    match e {
        RuleError::Invalid(m) => error(StatusCode::BAD_REQUEST, m),
        RuleError::NotFound(_) => error(StatusCode::NOT_FOUND, "Rule not found"),
        RuleError::Store(e) => {
            warn!(?e, "rule storage error");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid body"))?;
    serde_json::from_slice(&bytes).map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid JSON"))
}

fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let q = req.uri().query()?;
    url::form_urlencoded::parse(q.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

pub async fn handle(app: Arc<App>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(route(&app, req).await)
}

async fn route(app: &App, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    // decode per segmen setelah split, supaya "%2F" tetap bagian dari id
    let decoded: Result<Vec<String>, _> = req
        .uri()
        .path()
        .trim_matches('/')
        .split('/')
        .map(|seg| urlencoding::decode(seg).map(|s| s.into_owned()))
        .collect();
    let Ok(decoded) = decoded else {
        return error(StatusCode::BAD_REQUEST, "Invalid path encoding");
    };
    let segs: Vec<&str> = decoded.iter().map(String::as_str).collect();

    match (&method, segs.as_slice()) {
        (&Method::POST, ["dll", "connect"]) => {
            let Some(dll_id) = query_param(&req, "dll_id") else {
                return error(StatusCode::BAD_REQUEST, "dll_id required");
            };
            match app.dll.start_listener(&dll_id).await {
                Ok(port) => ok(&json!({ "status": "listening", "dll_id": dll_id, "port": port })),
                Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }

        (&Method::GET, ["admin", "rules"]) => match app.rules.get_all_rules() {
            Ok(rules) => ok(&rules),
            Err(e) => rule_error(e),
        },
        (&Method::POST, ["admin", "rules"]) => {
            let body: CreateRuleRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            match app.rules.create_rule(body) {
                Ok(rule) => {
                    info!(rule_id = %rule.id, name = %rule.name, "rule created");
                    ok(&rule)
                }
                Err(e) => rule_error(e),
            }
        }
        (&Method::PUT, ["admin", "rules", id]) => {
            let id = id.to_string();
            let body: UpdateRuleRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            match app.rules.update_rule(&id, body) {
                Ok(rule) => ok(&rule),
                Err(e) => rule_error(e),
            }
        }
        (&Method::DELETE, ["admin", "rules", id]) => match app.rules.delete_rule(id) {
            Ok(()) => ok(&json!({ "message": "Rule deleted" })),
            Err(e) => rule_error(e),
        },

        (&Method::GET, ["admin", "users", id, "state"]) => match app.users.get(id) {
            Ok(Some(handle)) => ok(&*handle.read()),
            Ok(None) => error(StatusCode::NOT_FOUND, "User state not found"),
            Err(e) => {
                warn!(user_id = %id, ?e, "user state load failed");
                error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        (&Method::PUT, ["admin", "users", id, "state"]) => {
            let id = id.to_string();
            let body: UpdateUserStateRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            match app.users.update(&id, body) {
                Ok(state) => ok(&state),
                Err(e) => {
                    warn!(user_id = %id, ?e, "user state update failed");
                    error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
            }
        }

        (&Method::GET, ["admin", "connections"]) => ok(&app.dll.get_connections()),
        (&Method::GET, ["admin", "metrics"]) => {
            let sender = app.pipeline.sender();
            ok(&MetricsResponse {
                active_dll_connections: app.dll.active_count(),
                websocket_clients: app.hub.client_count(),
                user_states: app.users.user_count(),
                event_buffer_size: sender.capacity(),
                event_queue_depth: sender.depth(),
                timestamp: now_secs(),
            })
        }

        (&Method::POST, ["admin", "enforce", user_id]) => {
            let user_id = user_id.to_string();
            let body: EnforceRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            if body.action.trim().is_empty() {
                return error(StatusCode::BAD_REQUEST, "action is required");
            }
            if !(MIN_SEVERITY..=MAX_SEVERITY).contains(&body.severity) {
                return error(
                    StatusCode::BAD_REQUEST,
                    format!("severity must be between {MIN_SEVERITY} and {MAX_SEVERITY}"),
                );
            }
            let msg = EnforcementMessage::new(&user_id, &body.action, &body.reason, body.severity);
            app.pipeline.dispatch(&msg);
            info!(%user_id, action = %msg.action, "manual enforcement sent");
            ok(&json!({ "status": "sent", "enforcement": msg }))
        }

        (&Method::GET, ["metrics"]) => {
            let mut resp = Response::new(Body::from(encode_metrics()));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            resp
        }

        _ => error(StatusCode::NOT_FOUND, "Not found"),
    }
}
