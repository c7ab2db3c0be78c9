//! The hub task: the only owner of the live-connection set.
//!
//! Register, unregister and broadcast requests arrive on three separate
//! channels and are handled one at a time by a single task, so the set itself
//! needs no lock. `tokio::select!` picks among ready channels at random; no
//! request kind is preferred over another.
//!
//! Delivery into per-connection queues never blocks by default. A queue that
//! is full (its outbound loop is not keeping up) or closed (its outbound loop
//! is gone) gets its connection evicted, and the eviction is announced to the
//! remaining peers like any other departure. Setting
//! [`HubConfig::notice_timeout`] makes join/leave notices wait for a slow
//! recipient instead, bounded by the timeout. Ordinary broadcasts never wait.

use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{connection::ConnectionId, message::Envelope};

/// Requests buffered per channel before submitters have to wait on the hub.
const REQUEST_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of every connection's outbound queue.
    pub queue_capacity: usize,
    /// How long a join/leave notice may wait on one recipient's queue.
    /// `None` applies the same non-blocking evict policy as broadcasts.
    pub notice_timeout: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            notice_timeout: None,
        }
    }
}

/// The hub's half of a connection: its id and the sending end of its
/// outbound queue. Dropping it closes the queue.
#[derive(Debug)]
pub struct Registration {
    id: ConnectionId,
    outbound: mpsc::Sender<Envelope>,
}

impl Registration {
    /// Creates an outbound queue for `id`, returning the hub's half and the
    /// receiver the connection's outbound loop drains.
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        (Self { id, outbound }, queue)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

struct RegisterRequest {
    registration: Registration,
    respond_to: oneshot::Sender<bool>,
}

struct UnregisterRequest {
    id: ConnectionId,
    respond_to: oneshot::Sender<bool>,
}

/// Cloneable handle for submitting requests to a running hub.
///
/// The hub task stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    config: HubConfig,
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    broadcast_tx: mpsc::Sender<Envelope>,
    snapshot_tx: mpsc::Sender<oneshot::Sender<Vec<ConnectionId>>>,
}

impl HubHandle {
    pub fn config(&self) -> HubConfig {
        self.config
    }

    /// Adds a connection to the live set and waits until the hub has admitted it.
    ///
    /// Every other live connection is told about the newcomer. Fails if the
    /// id is already live or the hub has stopped.
    pub async fn register(&self, registration: Registration) -> Result<()> {
        let id = registration.id.clone();
        let (respond_to, response) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest {
                registration,
                respond_to,
            })
            .await
            .ok()
            .context("hub is not running")?;
        if !response.await.context("hub dropped register request")? {
            bail!("connection {id} is already registered");
        }
        Ok(())
    }

    /// Removes a connection from the live set, closing its outbound queue.
    ///
    /// Returns whether the connection was live. Calling this for an id that
    /// is already gone is a no-op.
    pub async fn unregister(&self, id: &str) -> Result<bool> {
        let (respond_to, response) = oneshot::channel();
        self.unregister_tx
            .send(UnregisterRequest {
                id: id.to_string(),
                respond_to,
            })
            .await
            .ok()
            .context("hub is not running")?;
        response.await.context("hub dropped unregister request")
    }

    /// Queues an envelope for fan-out to every live connection.
    ///
    /// Returns once the hub has accepted the request, not once it is delivered.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.broadcast_tx
            .send(envelope)
            .await
            .ok()
            .context("hub is not running")
    }

    /// Ids of the currently live connections, sorted.
    pub async fn connected(&self) -> Result<Vec<ConnectionId>> {
        let (respond_to, response) = oneshot::channel();
        self.snapshot_tx
            .send(respond_to)
            .await
            .ok()
            .context("hub is not running")?;
        response.await.context("hub dropped snapshot request")
    }
}

pub struct Hub {
    registry: Registry,
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<UnregisterRequest>,
    broadcast_rx: mpsc::Receiver<Envelope>,
    snapshot_rx: mpsc::Receiver<oneshot::Sender<Vec<ConnectionId>>>,
}

impl Hub {
    /// Starts a hub task on the current runtime and returns a handle to it.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (register_tx, register_rx) = mpsc::channel(REQUEST_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(REQUEST_BUFFER);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(REQUEST_BUFFER);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(REQUEST_BUFFER);

        let hub = Hub {
            registry: Registry::new(config),
            register_rx,
            unregister_rx,
            broadcast_rx,
            snapshot_rx,
        };
        tokio::spawn(hub.run());

        HubHandle {
            config,
            register_tx,
            unregister_tx,
            broadcast_tx,
            snapshot_tx,
        }
    }

    async fn run(self) {
        let Hub {
            mut registry,
            mut register_rx,
            mut unregister_rx,
            mut broadcast_rx,
            mut snapshot_rx,
        } = self;

        loop {
            select! {
                Some(request) = register_rx.recv() => {
                    let admitted = registry.register(request.registration).await;
                    let _ = request.respond_to.send(admitted);
                }
                Some(request) = unregister_rx.recv() => {
                    let removed = registry.unregister(&request.id).await;
                    let _ = request.respond_to.send(removed);
                }
                Some(envelope) = broadcast_rx.recv() => {
                    registry.broadcast(&envelope).await;
                }
                Some(respond_to) = snapshot_rx.recv() => {
                    let _ = respond_to.send(registry.ids());
                }
                else => break,
            }
        }

        debug!(live = registry.len(), "hub stopped");
    }
}

/// The live-connection set. Only ever touched from inside the hub task.
struct Registry {
    config: HubConfig,
    connections: HashMap<ConnectionId, mpsc::Sender<Envelope>>,
}

impl Registry {
    fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn register(&mut self, registration: Registration) -> bool {
        let Registration { id, outbound } = registration;
        if self.connections.contains_key(&id) {
            warn!(conn_id = %id, "ignoring duplicate registration");
            return false;
        }

        self.connections.insert(id.clone(), outbound);
        info!(conn_id = %id, live = self.len(), "connection registered");

        let stalled = self
            .deliver(&Envelope::joined(&id), Some(id.as_str()), self.config.notice_timeout)
            .await;
        self.evict(stalled).await;
        true
    }

    async fn unregister(&mut self, id: &str) -> bool {
        // Dropping the sender closes the queue and ends the outbound loop.
        if self.connections.remove(id).is_none() {
            debug!(conn_id = %id, "unregister for connection that is not live");
            return false;
        }
        info!(conn_id = %id, live = self.len(), "connection unregistered");

        let stalled = self
            .deliver(&Envelope::left(id), None, self.config.notice_timeout)
            .await;
        self.evict(stalled).await;
        true
    }

    async fn broadcast(&mut self, envelope: &Envelope) {
        debug!(sender = %envelope.sender, recipients = self.len(), "broadcasting");
        let stalled = self.deliver(envelope, None, None).await;
        self.evict(stalled).await;
    }

    /// Delivers `envelope` to every live connection except `exclude` and
    /// returns the ids whose queues did not accept it.
    ///
    /// With `wait` unset this never suspends.
    async fn deliver(
        &self,
        envelope: &Envelope,
        exclude: Option<&str>,
        wait: Option<Duration>,
    ) -> Vec<ConnectionId> {
        let mut stalled = Vec::new();

        for (id, outbound) in &self.connections {
            if exclude == Some(id.as_str()) {
                continue;
            }

            let delivered = match wait {
                None => match outbound.try_send(envelope.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!(conn_id = %id, "outbound queue full");
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(conn_id = %id, "outbound queue closed");
                        false
                    }
                },
                Some(limit) => match timeout(limit, outbound.send(envelope.clone())).await {
                    Ok(Ok(())) => true,
                    Ok(Err(_)) => {
                        debug!(conn_id = %id, "outbound queue closed");
                        false
                    }
                    Err(_) => {
                        debug!(conn_id = %id, ?limit, "timed out waiting on outbound queue");
                        false
                    }
                },
            };

            if !delivered {
                stalled.push(id.clone());
            }
        }

        stalled
    }

    /// Drops stalled connections and announces each departure.
    ///
    /// Announcing can stall further connections, so this repeats until a
    /// round evicts nobody.
    async fn evict(&mut self, mut stalled: Vec<ConnectionId>) {
        while !stalled.is_empty() {
            let evicted: Vec<_> = stalled
                .drain(..)
                .filter(|id| self.connections.remove(id).is_some())
                .collect();

            for id in evicted {
                info!(conn_id = %id, live = self.len(), "evicted connection that stopped draining its queue");
                let more = self
                    .deliver(&Envelope::left(&id), None, self.config.notice_timeout)
                    .await;
                stalled.extend(more);
            }
        }
    }
}
