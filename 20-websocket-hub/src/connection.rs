//! One client session: its id, its transport and its outbound queue.
//!
//! A connection runs as two independent tasks. The inbound loop owns the read
//! half and turns frames into broadcast requests; the outbound loop owns the
//! write half and drains the queue the hub fills. Each loop owns its half by
//! value, so every way out of a loop releases it.

use std::fmt::Display;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    hub::{HubHandle, Registration},
    message::Envelope,
};

pub type ConnectionId = String;

/// Mints a fresh, URL-safe connection id.
pub fn new_connection_id() -> ConnectionId {
    nanoid::nanoid!()
}

pub struct Connection<T> {
    id: ConnectionId,
    transport: T,
    queue: mpsc::Receiver<Envelope>,
}

impl<T> Connection<T> {
    /// Wraps `transport` with a new outbound queue of the given capacity.
    ///
    /// The returned [`Registration`] is the hub's half of the queue and must
    /// be handed to [`HubHandle::register`].
    pub fn open(id: ConnectionId, transport: T, capacity: usize) -> (Self, Registration) {
        let (registration, queue) = Registration::new(id.clone(), capacity);
        let connection = Self {
            id,
            transport,
            queue,
        };
        (connection, registration)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T, E> Connection<T>
where
    T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    /// Splits the transport and runs both loops as separate tasks.
    pub fn spawn(self, hub: HubHandle) -> (JoinHandle<()>, JoinHandle<()>) {
        let Connection {
            id,
            transport,
            queue,
        } = self;
        let (sink, stream) = transport.split();

        let inbound = tokio::spawn(inbound_loop(id.clone(), stream, hub));
        let outbound = tokio::spawn(outbound_loop(id, queue, sink));
        (inbound, outbound)
    }
}

/// Forwards every frame read from `stream` to the hub as a broadcast.
///
/// Ends on a close frame, end of stream or read error, and always asks the
/// hub to unregister the connection on the way out.
pub async fn inbound_loop<S, E>(id: ConnectionId, mut stream: S, hub: HubHandle)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let content = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                debug!(conn_id = %id, ?frame, "client sent close");
                break;
            }
            Some(Err(err)) => {
                debug!(conn_id = %id, error = %err, "read failed");
                break;
            }
            None => {
                debug!(conn_id = %id, "transport closed");
                break;
            }
        };

        if let Err(err) = hub.broadcast(Envelope::new(id.clone(), content)).await {
            warn!(conn_id = %id, error = ?err, "dropping message, hub unavailable");
            break;
        }
    }

    drop(stream);
    match hub.unregister(&id).await {
        Ok(true) => info!(conn_id = %id, "client disconnected"),
        Ok(false) => debug!(conn_id = %id, "client already removed from hub"),
        Err(err) => warn!(conn_id = %id, error = ?err, "failed to unregister client"),
    }
}

/// Writes every queued envelope to `sink` as a text frame.
///
/// Once the hub closes the queue a close frame is sent. The sink is closed
/// on every exit path, including write errors.
pub async fn outbound_loop<K>(id: ConnectionId, mut queue: mpsc::Receiver<Envelope>, mut sink: K)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    while let Some(envelope) = queue.recv().await {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn_id = %id, error = %err, "failed to encode envelope, skipping");
                continue;
            }
        };

        if let Err(err) = sink.send(Message::Text(frame)).await {
            debug!(conn_id = %id, error = %err, "write failed");
            close_sink(&id, &mut sink).await;
            return;
        }
    }

    debug!(conn_id = %id, "outbound queue closed");
    if let Err(err) = sink.send(Message::Close(None)).await {
        debug!(conn_id = %id, error = %err, "failed to send close frame");
    }
    close_sink(&id, &mut sink).await;
}

async fn close_sink<K>(id: &str, sink: &mut K)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    if let Err(err) = sink.close().await {
        debug!(conn_id = %id, error = %err, "failed to close transport cleanly");
    }
}
