use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;

use common::proto;

use crate::api::AppState;
use crate::session::{Session, SessionPorts, Violation};

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let SessionPorts {
        frames,
        mut packets,
        outbound,
        stop,
        mut worker,
    } = Session::spawn(state.app.clone());

    // Task: drain session packets to the wire, in push order.
    let send_task = tokio::spawn(async move {
        while let Some(packet) = packets.recv().await {
            if ws_sender.send(Message::Binary(packet)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Feed incoming frames to the session in arrival order until either side
    // goes away.
    let mut worker_done = false;
    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(frame))) => {
                        match frames.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                // The client is outrunning its own session.
                                let _ = outbound.send(proto::kick(&Violation::PacketFlood.to_string()));
                                stop.trigger();
                                break;
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/ping frames are not part of the protocol
                    Some(Err(e)) => {
                        tracing::info!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
            _ = &mut worker, if !worker_done => {
                worker_done = true;
                break;
            }
        }
    }

    // Let the worker drain and release its subscriptions, then close the
    // write side by dropping the last packet sender.
    stop.trigger();
    drop(frames);
    if !worker_done {
        let _ = worker.await;
    }
    drop(outbound);
    let _ = send_task.await;
}
