//! Process-wide registry of live connections, presence and rooms.
//!
//! Each user maps to a presence record holding every live connection of
//! that user (one per device or tab). Rooms are logical channels, one per
//! conversation pair or group, that connections join while a conversation
//! is open. Delivery never blocks: each frame is offered once to each
//! connection's bounded queue and dropped if the queue is full or closed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_shared::protocol::ServerEvent;
use courier_shared::types::{ConnectionId, Presence, RoomId, UserId};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// A frame queued for one connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized [`ServerEvent`], shared between all recipients.
    Event(Arc<str>),
    Close,
}

/// Receiving side handed to the connection's writer task.
pub struct LiveConnection {
    pub id: ConnectionId,
    pub user: UserId,
    pub receiver: mpsc::Receiver<Outbound>,
}

/// Result of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected {
    /// Connections the user still has.
    pub remaining: usize,
    /// The user just lost their last connection and was not already offline.
    pub went_offline: bool,
}

struct PresenceEntry {
    presence: Presence,
    last_seen_at: DateTime<Utc>,
    connections: HashMap<ConnectionId, mpsc::Sender<Outbound>>,
}

impl PresenceEntry {
    fn new() -> Self {
        Self {
            presence: Presence::Offline,
            last_seen_at: Utc::now(),
            connections: HashMap::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.presence == Presence::Offline && self.connections.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    users: HashMap<UserId, PresenceEntry>,
    rooms: HashMap<RoomId, HashSet<(UserId, ConnectionId)>>,
}

impl RegistryState {
    fn sender(&self, user: UserId, conn: ConnectionId) -> Option<&mpsc::Sender<Outbound>> {
        self.users.get(&user)?.connections.get(&conn)
    }
}

pub struct PresenceRegistry {
    state: RwLock<RegistryState>,
    buffer: usize,
}

impl PresenceRegistry {
    /// `buffer` is the number of frames queued per connection.
    pub fn new(buffer: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new connection of `user` with no stored presence to seed.
    pub async fn connect(&self, user: UserId) -> LiveConnection {
        self.connect_as(user, Presence::Offline, Utc::now()).await
    }

    /// Register a new authenticated connection of `user`. The stored
    /// presence only applies when the registry holds nothing for the user;
    /// otherwise the live record wins.
    pub async fn connect_as(
        &self,
        user: UserId,
        stored: Presence,
        last_seen_at: DateTime<Utc>,
    ) -> LiveConnection {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = ConnectionId::new();

        let mut state = self.state.write().await;
        let entry = state.users.entry(user).or_insert_with(|| PresenceEntry {
            presence: stored,
            last_seen_at,
            connections: HashMap::new(),
        });
        entry.connections.insert(id, tx);

        info!(
            user = %user,
            connection = %id,
            connections = entry.connections.len(),
            "Connection registered"
        );

        LiveConnection {
            id,
            user,
            receiver: rx,
        }
    }

    /// Remove a connection and every room membership it held. When it was
    /// the user's last connection the user goes offline at `at`, decided
    /// under the same lock so a concurrent reconnect is never overridden.
    pub async fn disconnect(
        &self,
        user: UserId,
        connection: ConnectionId,
        at: DateTime<Utc>,
    ) -> Disconnected {
        let mut state = self.state.write().await;

        state.rooms.retain(|_, members| {
            members.remove(&(user, connection));
            !members.is_empty()
        });

        let mut went_offline = false;
        let remaining = match state.users.get_mut(&user) {
            Some(entry) => {
                entry.connections.remove(&connection);
                if entry.connections.is_empty() && entry.presence != Presence::Offline {
                    entry.presence = Presence::Offline;
                    entry.last_seen_at = at;
                    went_offline = true;
                }
                entry.connections.len()
            }
            None => 0,
        };
        if state.users.get(&user).is_some_and(PresenceEntry::is_idle) {
            state.users.remove(&user);
        }

        info!(user = %user, connection = %connection, remaining, went_offline, "Connection removed");
        Disconnected {
            remaining,
            went_offline,
        }
    }

    /// Record a presence change. Returns `false` if the user already had
    /// this presence, in which case nothing is updated.
    pub async fn set_presence(
        &self,
        user: UserId,
        presence: Presence,
        last_seen_at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.write().await;
        let entry = state.users.entry(user).or_insert_with(PresenceEntry::new);

        if entry.presence == presence {
            let idle = entry.is_idle();
            if idle {
                state.users.remove(&user);
            }
            return false;
        }

        entry.presence = presence;
        entry.last_seen_at = last_seen_at;
        if entry.is_idle() {
            state.users.remove(&user);
        }

        debug!(user = %user, presence = presence.as_str(), "Presence changed");
        true
    }

    /// Current presence and last-seen time. Users without a record are
    /// offline.
    pub async fn presence_of(&self, user: UserId) -> (Presence, Option<DateTime<Utc>>) {
        match self.state.read().await.users.get(&user) {
            Some(entry) => (entry.presence, Some(entry.last_seen_at)),
            None => (Presence::Offline, None),
        }
    }

    pub async fn connection_count(&self, user: UserId) -> usize {
        self.state
            .read()
            .await
            .users
            .get(&user)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Add a live connection to a room. Unknown connections are ignored.
    pub async fn join_room(&self, room: RoomId, user: UserId, connection: ConnectionId) -> bool {
        let mut state = self.state.write().await;
        if state.sender(user, connection).is_none() {
            warn!(user = %user, connection = %connection, "Join from unknown connection");
            return false;
        }
        debug!(room = %room, connection = %connection, "Joined room");
        state
            .rooms
            .entry(room)
            .or_default()
            .insert((user, connection));
        true
    }

    /// Leave a room. Empty rooms are removed.
    pub async fn leave_room(&self, room: &RoomId, user: UserId, connection: ConnectionId) {
        let mut state = self.state.write().await;
        let empty = match state.rooms.get_mut(room) {
            Some(members) => {
                members.remove(&(user, connection));
                members.is_empty()
            }
            None => false,
        };
        if empty {
            state.rooms.remove(room);
        }
    }

    pub async fn room_size(&self, room: &RoomId) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Offer `event` once to every live connection of `user`. Returns the
    /// number of connections that accepted it.
    pub async fn send_to_user(&self, user: UserId, event: &ServerEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let state = self.state.read().await;
        let Some(entry) = state.users.get(&user) else {
            return 0;
        };

        entry
            .connections
            .iter()
            .filter(|(id, tx)| offer(tx, &frame, **id))
            .count()
    }

    /// Offer `event` once to every connection in `room`, except `exclude`.
    pub async fn broadcast_to_room(
        &self,
        room: &RoomId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return 0;
        };
        let Some(frame) = encode(event) else {
            return 0;
        };

        members
            .iter()
            .filter(|(_, conn)| Some(*conn) != exclude)
            .filter_map(|(user, conn)| state.sender(*user, *conn).map(|tx| (tx, *conn)))
            .filter(|(tx, conn)| offer(tx, &frame, *conn))
            .count()
    }

    /// Ask every connection to close, then forget all state.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.write().await;
        let mut closed = 0;
        for entry in state.users.values() {
            for tx in entry.connections.values() {
                let _ = tx.try_send(Outbound::Close);
                closed += 1;
            }
        }
        state.users.clear();
        state.rooms.clear();
        info!(connections = closed, "Closed all live connections");
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match event.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "Failed to encode server event");
            None
        }
    }
}

fn offer(tx: &mpsc::Sender<Outbound>, frame: &Arc<str>, connection: ConnectionId) -> bool {
    match tx.try_send(Outbound::Event(Arc::clone(frame))) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(connection = %connection, "Dropping event for slow connection");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
