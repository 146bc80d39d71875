//! WebSocket side of the tunnel: accepts agent connections on `GET /` and
//! pumps frames between the socket and the [`SessionRegistry`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::registry::{Outbound, Session, SessionRegistry, CLOSE_POLICY_VIOLATION};

/// Runs one agent connection until either side goes away.
pub async fn serve_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    account: Option<String>,
    address: Option<SocketAddr>,
) {
    let address = address.map(|addr| addr.to_string());
    let (session, outbound) = match registry.attach(account.as_deref(), address) {
        Ok(attached) => attached,
        Err(_) => {
            reject(socket).await;
            return;
        }
    };

    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_outbound(sender, outbound, session.account().to_string()));

    loop {
        tokio::select! {
            message = receiver.next() => {
                let Some(message) = message else {
                    break;
                };
                match message {
                    Ok(Message::Text(text)) => registry.handle_frame(&session, &text),
                    Ok(Message::Binary(bytes)) => handle_binary(&registry, &session, bytes),
                    Ok(Message::Pong(_)) => session.mark_alive(),
                    Ok(Message::Ping(_)) => {}
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(
                            account = %session.account(),
                            code = frame.as_ref().map(|frame| frame.code),
                            "agent closed tunnel"
                        );
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(account = %session.account(), error = %err, "tunnel read failed");
                        break;
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    registry.detach(&session);
    writer.abort();
}

fn handle_binary(registry: &SessionRegistry, session: &Session, bytes: Vec<u8>) {
    match String::from_utf8(bytes) {
        Ok(text) => registry.handle_frame(session, &text),
        Err(_) => {
            tracing::warn!(account = %session.account(), "dropping non-utf8 binary frame");
        }
    }
}

async fn write_outbound<S>(
    mut sender: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    account: String,
) where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(item) = outbound.recv().await {
        let message = match item {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close { code, reason } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
            Outbound::Terminate => break,
        };
        if let Err(err) = sender.send(message).await {
            tracing::warn!(account = %account, error = %err, "tunnel write failed");
            break;
        }
    }
}

async fn reject(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "Account required".into(),
        })))
        .await;
}
