// In-process network connecting any number of local endpoints.
//
// Every packet is JSON-encoded on send and decoded on delivery, so the
// loopback exercises the same serialization boundary a real transport
// would. Each endpoint owns one delivery task; packets from any sender are
// therefore handed to listeners in the order they were sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tandem_common::protocol::packet::{Message, Packet};
use tandem_common::types::UserId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ListenerId, PacketFilter, PacketHandler, Transport, TransportError};
use crate::snapshot::SnapshotList;

#[derive(Clone)]
struct RegisteredListener {
    id: ListenerId,
    filter: PacketFilter,
    handler: PacketHandler,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<UserId, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint for `user`. Must be called inside a tokio runtime.
    pub fn connect(&self, user: impl Into<UserId>) -> Arc<LoopbackTransport> {
        let user = user.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(SnapshotList::new());
        let task = tokio::spawn(deliver(user.clone(), rx, Arc::clone(&listeners)));

        if self.lock().insert(user.clone(), tx).is_some() {
            warn!(user = %user, "replacing existing loopback endpoint");
        }

        Arc::new(LoopbackTransport {
            local: user,
            network: self.clone(),
            listeners,
            next_listener_id: AtomicU64::new(1),
            task,
        })
    }

    /// Detach an endpoint; later sends to it fail with `PeerUnreachable`.
    pub fn disconnect(&self, user: &UserId) -> bool {
        self.lock().remove(user).is_some()
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.lock().contains_key(user)
    }

    fn route(&self, to: &UserId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let endpoints = self.lock();
        let sender = endpoints.get(to).ok_or_else(|| TransportError::PeerUnreachable(to.clone()))?;
        sender.send(bytes).map_err(|_| TransportError::PeerUnreachable(to.clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, mpsc::UnboundedSender<Vec<u8>>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct LoopbackTransport {
    local: UserId,
    network: LoopbackNetwork,
    listeners: Arc<SnapshotList<RegisteredListener>>,
    next_listener_id: AtomicU64,
    task: JoinHandle<()>,
}

impl LoopbackTransport {
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Transport for LoopbackTransport {
    fn local_user(&self) -> &UserId {
        &self.local
    }

    fn send(&self, to: &UserId, message: Message) -> Result<(), TransportError> {
        let kind = message.kind();
        let packet = Packet { from: self.local.clone(), to: to.clone(), message };
        let bytes = packet
            .encode()
            .map_err(|error| TransportError::Encode { kind, reason: error.to_string() })?;
        debug!(from = %self.local, to = %to, kind, bytes = bytes.len(), "loopback send");
        self.network.route(to, bytes)
    }

    fn add_listener(&self, filter: PacketFilter, handler: PacketHandler) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.push(RegisteredListener { id, filter, handler });
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.retain(|listener| listener.id != id) > 0
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.disconnect(&self.local);
        self.task.abort();
    }
}

async fn deliver(
    user: UserId,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    listeners: Arc<SnapshotList<RegisteredListener>>,
) {
    while let Some(bytes) = rx.recv().await {
        let packet = match Packet::decode(&bytes) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(user = %user, ?error, "dropping undecodable packet");
                continue;
            }
        };

        let mut delivered = false;
        for listener in listeners.snapshot().iter() {
            if (listener.filter)(&packet) {
                delivered = true;
                (listener.handler)(packet.clone());
            }
        }
        if !delivered {
            debug!(user = %user, from = %packet.from, kind = packet.message.kind(), "no listener for packet");
        }
    }
}
