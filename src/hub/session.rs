//! Per-connection reader and writer tasks
//!
//! Each admitted socket gets a writer task that drains the outbound queue and
//! emits keepalive pings, and a reader that decodes inbound frames and hands
//! them to the dispatcher. Both stop when the connection's cancellation token
//! fires, which happens on unregister, replacement or hub shutdown.

use crate::dispatch::MessageDispatcher;
use crate::error::Result;
use crate::hub::connection::{Connection, Frame};
use crate::hub::registry::ConnectionHub;
use crate::types::Principal;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Register a socket with the hub and run its task pair until it closes
pub async fn serve_socket<S, E>(
    socket: S,
    principal: Principal,
    hub: Arc<ConnectionHub>,
    dispatcher: Arc<MessageDispatcher>,
    keepalive: Duration,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, E>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: Display,
    E: Display,
{
    let (connection, outbound) = Connection::new(principal, hub.queue_capacity());
    hub.register(connection.clone())?;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        connection.clone(),
        hub.clone(),
        keepalive,
    ));

    read_loop(stream, connection.clone(), hub, dispatcher).await;

    if let Err(e) = writer.await {
        warn!(
            "Writer task for connection {} ended abnormally: {}",
            connection.conn_id, e
        );
    }
    Ok(())
}

/// Drain the outbound queue to the transport, pinging on an interval
///
/// A write failure tears the connection down through the hub.
pub async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<Frame>,
    connection: Arc<Connection>,
    hub: Arc<ConnectionHub>,
    keepalive: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let cancel = connection.cancellation();
    let mut keepalive = tokio::time::interval(keepalive);
    // Skip the immediate first tick
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame.as_str().into())).await {
                    warn!("Write to user {} failed: {}", connection.user_id(), e);
                    break;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    warn!("Keepalive to user {} failed: {}", connection.user_id(), e);
                    break;
                }
            }
        }
    }

    if let Err(e) = hub.unregister(&connection) {
        warn!("Failed to unregister connection {}: {}", connection.conn_id, e);
    }
    let _ = sink.close().await;
    debug!("Writer for connection {} stopped", connection.conn_id);
}

/// Decode inbound frames and route them until the transport or token closes
pub async fn read_loop<R, E>(
    mut stream: R,
    connection: Arc<Connection>,
    hub: Arc<ConnectionHub>,
    dispatcher: Arc<MessageDispatcher>,
) where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let cancel = connection.cancellation();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                dispatcher.dispatch(&connection.principal, text.as_str()).await;
            }
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => dispatcher.dispatch(&connection.principal, text).await,
                Err(_) => debug!(
                    "Ignoring non-UTF8 binary frame from user {}",
                    connection.user_id()
                ),
            },
            Some(Ok(Message::Close(_))) => {
                info!("User {} closed the connection", connection.user_id());
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                debug!("Read from user {} failed: {}", connection.user_id(), e);
                break;
            }
            None => break,
        }
    }

    if let Err(e) = hub.unregister(&connection) {
        warn!("Failed to unregister connection {}: {}", connection.conn_id, e);
    }
}
