//! The thin boundary layer between a real WebSocket transport and
//! `realtime_server`'s in-process `Server`. Grounded on the teacher's
//! `td/web` axum binary for the HTTP/router shape, and on the
//! `AsyncNomad-wsPrism` gateway's connection handling for the per-session
//! writer task / ping-interval / idle-timeout split.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use realtime_core::{Envelope, RealtimeError, UserId, WireFormat};
use realtime_server::pipeline::Caller;
use realtime_server::session::OutboundFrame;
use realtime_server::Server;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::Instrument;

/// Query string a client supplies on the upgrade request: which wire format
/// it wants and, until a real auth collaborator is wired in, its identity
/// directly. `user_id` is optional so a first-time caller can omit it and
/// receive a freshly minted identity back in the session-open confirmation.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub username: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "json".to_string()
}

fn parse_format(raw: &str) -> WireFormat {
    match raw {
        "binary" | "bin" => WireFormat::Binary,
        _ => WireFormat::Json,
    }
}

/// Builds the axum app: one WebSocket route plus whatever static/health
/// routes an embedding binary layers on top via `.merge`.
pub fn build_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn healthz() -> &'static str {
    "ok"
}

pub async fn serve(addr: SocketAddr, server: Arc<Server>) -> std::io::Result<()> {
    let app = build_router(server);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "realtime gateway listening");
    axum::serve(listener, app).await
}

async fn ws_upgrade(
    State(server): State<Arc<Server>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(server, query, socket))
}

async fn handle_socket(server: Arc<Server>, query: ConnectQuery, socket: WebSocket) {
    let format = parse_format(&query.format);
    let user_id = match query.user_id.as_deref().map(UserId::from_str) {
        Some(Ok(id)) => id,
        Some(Err(_)) => {
            tracing::warn!(raw = %query.username, "bad user_id on connect, minting a new identity");
            UserId::new()
        }
        None => UserId::new(),
    };

    let (session, outbound_rx) = match server.open_session(user_id, query.username.clone(), format) {
        Ok(pair) => pair,
        Err(error) => {
            tracing::warn!(%error, "rejected connection: server is not accepting sessions");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let span = tracing::info_span!("realtime_session", session_id = %session.id, user_id = %user_id);
    run_session(server, session, outbound_rx, socket).instrument(span).await;
}

/// Drives one connection end to end: a writer task owns the socket's send
/// half and drains both the session's outbound queue and the ping clock; the
/// calling task owns the receive half and feeds decoded envelopes into
/// `Server::dispatch`, closing the session once the socket or the idle
/// timeout gives out.
async fn run_session(
    server: Arc<Server>,
    session: Arc<realtime_server::session::Session>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<OutboundFrame>,
    socket: WebSocket,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let format = session.format;
    let ping_period = Duration::from_secs(server.config.ping_period_sec.max(1));
    let idle_timeout = ping_period * 3;

    let writer = tokio::spawn(async move {
        let mut ping_tick = tokio::time::interval(ping_period);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(OutboundFrame::Bytes(bytes)) => {
                            let message = match format {
                                WireFormat::Json => Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()),
                                WireFormat::Binary => Message::Binary(bytes.into()),
                            };
                            if ws_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundFrame::Close(_reason)) => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_tick.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut last_rx = Instant::now();
    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        dispatch_inbound(&server, &session, text.as_bytes().to_vec(), format).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_rx = Instant::now();
                        dispatch_inbound(&server, &session, bytes.to_vec(), format).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(_)) => break,
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(last_rx + idle_timeout) => {
                tracing::info!("idle timeout, closing session");
                break;
            }
        }
    }

    server.close_session(session.id, "transport-closed");
    writer.abort();
}

async fn dispatch_inbound(server: &Arc<Server>, session: &Arc<realtime_server::session::Session>, bytes: Vec<u8>, format: WireFormat) {
    let envelope = match Envelope::decode(&bytes, format) {
        Ok(envelope) => envelope,
        Err(error) => {
            let _ = session.send(&error_envelope(&error));
            return;
        }
    };
    let caller = Caller {
        session_id: session.id,
        user_id: session.user_id,
        username: session.username.clone(),
    };
    if let Some(reply) = server.dispatch(caller, envelope).await {
        let _ = session.send(&reply);
    }
}

fn error_envelope(error: &RealtimeError) -> Envelope {
    Envelope::Error {
        code: error.code(),
        message: error.reason(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_defaults_to_json_on_unknown_input() {
        assert!(matches!(parse_format("nonsense"), WireFormat::Json));
        assert!(matches!(parse_format("binary"), WireFormat::Binary));
    }
}
