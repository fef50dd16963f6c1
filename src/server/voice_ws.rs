//! The `/ws` endpoint: client-facing binary/text framing (spec.md §6.2),
//! driving the pipeline orchestrator for one connection. Built in the
//! style of `server::realtime_voice`'s message-loop shape, restructured
//! so a barge-in probe never has to wait on the turn task's hold of the
//! session lock.
//!
//! The live turn runner holds the session's `tokio::sync::Mutex` for the
//! whole STT → LLM → TTS sequence (it needs `&mut Session` throughout).
//! Barge-in detection therefore can't go through that same lock without
//! queueing behind an in-flight turn — so the ingress loop keeps its own
//! `VadGate` instance (fed from the same classifier factory) purely to
//! probe `flag_byte == 0x01` frames, and fires the session's lock-free
//! `CancelToken` directly. The turn runner's own cancellation check
//! (`pipeline::orchestrator::Orchestrator::run_turn`) notices within one
//! TTS chunk and releases the session lock, at which point the ingress
//! loop re-acquires it just to finish the state-machine bookkeeping
//! (`Session::interrupt`, segmenter/VAD reset, `StartListening`).

use super::ServerState;
use crate::pipeline::orchestrator::{ControlMessage, Orchestrator, OutboundFrame};
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::SessionState;
use crate::pipeline::vad::VadGate;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    client_id: Option<String>,
}

pub async fn upgrade_handler(ws: WebSocketUpgrade, Query(query): Query<WsQuery>, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.client_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, client_id: Option<String>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let session = state.connections.connect(&connection_id, client_id).await;
    let mut barge_in_vad = VadGate::new((state.classifier_factory)(), state.vad_config);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(64);
    state.connections.register_outbound(&connection_id, outbound_tx.clone()).await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    warn!("failed to serialize outbound frame: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(state.pipeline.clone()));
    info!(connection = %connection_id, "client_connected");

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Binary(data) => {
                if data.is_empty() {
                    continue;
                }
                let flag = data[0];
                let pcm = &data[1..];

                if flag == 0x01 {
                    handle_barge_in_probe(&session, &mut barge_in_vad, pcm, &outbound_tx).await;
                    continue;
                }

                let turn_ready = {
                    let mut guard = session.lock().await;
                    orchestrator.handle_binary_frame(&mut guard, flag, pcm, &outbound_tx).await
                };
                if turn_ready {
                    spawn_turn(&session, &orchestrator, &outbound_tx);
                }
            }
            Message::Text(text) => {
                let control: ControlMessage = match serde_json::from_str(&text) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "ignored malformed control frame");
                        continue;
                    }
                };
                let turn_ready = {
                    let mut guard = session.lock().await;
                    orchestrator.handle_control(&mut guard, control, &outbound_tx).await
                };
                if turn_ready {
                    spawn_turn(&session, &orchestrator, &outbound_tx);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.connections.disconnect(&connection_id).await;
    send_task.abort();
    info!(connection = %connection_id, "client_disconnected");
}

/// Probes one TTS-playing-flagged frame with a dedicated `VadGate`
/// (separate from the segmenter's, which the in-flight turn owns) so
/// detection never blocks on the session lock. The cancel is only set once
/// the session lock confirms a genuine barge-in (state is `Speaking`);
/// `guard.interrupt()` sets the session's own `cancel_token`, which the
/// in-flight turn notices within one TTS chunk and releases the lock.
async fn handle_barge_in_probe(
    session: &Arc<tokio::sync::Mutex<crate::pipeline::session::Session>>,
    barge_in_vad: &mut VadGate,
    pcm: &[u8],
    outbound: &mpsc::Sender<OutboundFrame>,
) {
    let decision = barge_in_vad.process(pcm);
    if !decision.is_currently_speech {
        return;
    }

    let mut guard = session.lock().await;
    if guard.state() == SessionState::Speaking {
        info!(session = %guard.id, "barge-in detected");
        guard.interrupt();
        guard.segmenter.clear();
        guard.vad.reset();
        let _ = outbound.send(OutboundFrame::Interrupt { reason: "user_speech" }).await;
        let _ = outbound.send(OutboundFrame::State { state: guard.state().as_str() }).await;
        guard.apply(SessionEvent::StartListening);
        let _ = outbound.send(OutboundFrame::State { state: guard.state().as_str() }).await;
    }
}

fn spawn_turn(
    session: &Arc<tokio::sync::Mutex<crate::pipeline::session::Session>>,
    orchestrator: &Arc<Orchestrator>,
    outbound: &mpsc::Sender<OutboundFrame>,
) {
    let session = session.clone();
    let orchestrator = orchestrator.clone();
    let outbound = outbound.clone();
    tokio::spawn(async move {
        let mut guard = session.lock().await;
        orchestrator.run_turn(&mut guard, outbound).await;
    });
}
