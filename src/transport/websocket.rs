//! WebSocket transport
//!
//! Exposes a `Broker<Message>` to remote peers. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Create a `Client` per connection and a writer task draining its channel
//! - Translate `subscribe` / `unsubscribe` / `publish` frames into broker calls
//! - Unsubscribe everything the peer held when the connection ends
//!
//! A closed broker is reported to the peer as an `unavailable` error frame;
//! the connection itself stays open until the peer leaves.

use std::io;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, Message};
use crate::client::Client;
use crate::transport::message::{ClientMessage, ErrorCode, ServerMessage};
use crate::utils::error::BrokerError;

/// Bind `addr` and serve connections until accepting fails.
pub async fn start_websocket_server(addr: &str, broker: Broker<Message>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, broker).await
}

/// Serve connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: Broker<Message>) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "WebSocket server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let broker = broker.clone();
        spawn(handle_connection(stream, peer, broker));
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Broker<Message>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    info!(client = %client.id, %peer, "client connected");

    let writer = {
        let client_id = client.id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(client = %client_id, error = %e, "failed to send frame");
                    break;
                }
            }
            debug!(client = %client_id, "send loop closed");
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client = %client.id, error = %e, "read error");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        if let Ok(text) = msg.to_text() {
            handle_frame(&mut client, &broker, text);
        }
    }

    client.unsubscribe_all();
    writer.abort();
    info!(client = %client.id, "client disconnected");
}

/// Apply one client frame and queue the reply.
pub(crate) fn handle_frame(client: &mut Client, broker: &Broker<Message>, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { subject }) => match client.subscribe(broker, &subject) {
            Ok(_) => ServerMessage::Subscribed { subject },
            Err(e) => broker_error(&client.id, e),
        },
        Ok(ClientMessage::Unsubscribe { subject }) => {
            if client.unsubscribe(&subject) {
                debug!(client = %client.id, %subject, "client unsubscribed");
                ServerMessage::Unsubscribed { subject }
            } else {
                ServerMessage::error(
                    ErrorCode::NotSubscribed,
                    format!("not subscribed to {subject}"),
                )
            }
        }
        Ok(ClientMessage::Publish { subject, payload }) => {
            match broker.publish(&subject, Message::new(subject.as_str(), payload)) {
                Ok(()) => {
                    debug!(client = %client.id, %subject, "client published");
                    ServerMessage::Published { subject }
                }
                Err(e) => broker_error(&client.id, e),
            }
        }
        Err(err) => {
            warn!(
                client = %client.id,
                error = %err,
                frame = %text.chars().take(100).collect::<String>(),
                "invalid client frame"
            );
            ServerMessage::error(ErrorCode::InvalidFrame, err.to_string())
        }
    };
    client.send(&reply);
}

fn broker_error(client_id: &str, err: BrokerError) -> ServerMessage {
    warn!(client = %client_id, error = %err, label = err.as_label(), "broker rejected request");
    let code = if err.is_closed() {
        ErrorCode::Unavailable
    } else {
        ErrorCode::Internal
    };
    ServerMessage::error(code, err.to_string())
}
