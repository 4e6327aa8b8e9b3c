//! Room-scoped relay of committed session events.
//!
//! One room per session id. A room holds a broadcast channel fanned out to
//! every connected socket and a presence registry of who is connected.
//! Delivery is best-effort: a subscriber that falls behind the channel
//! capacity loses the oldest events and is expected to re-fetch history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::models::MessageWithSender;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Uuid,
    pub username: String,
    pub image_url: Option<String>,
    pub is_active: bool,
}

/// Events delivered to room subscribers, named as the web client listens
/// for them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum RelayEvent {
    #[serde(rename = "newMessage")]
    NewMessage(MessageWithSender),
    #[serde(rename = "userJoined")]
    UserJoined(UserPresence),
    #[serde(rename = "userLeft")]
    UserLeft(UserPresence),
    #[serde(rename = "participant_joined")]
    ParticipantJoined(Participant),
    #[serde(rename = "participant_left")]
    ParticipantLeft(Uuid),
    #[serde(rename = "participants_list")]
    ParticipantsList(Vec<Participant>),
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::NewMessage(_) => "newMessage",
            RelayEvent::UserJoined(_) => "userJoined",
            RelayEvent::UserLeft(_) => "userLeft",
            RelayEvent::ParticipantJoined(_) => "participant_joined",
            RelayEvent::ParticipantLeft(_) => "participant_left",
            RelayEvent::ParticipantsList(_) => "participants_list",
        }
    }
}

/// Server-side identifier of one socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Room {
    sender: broadcast::Sender<RelayEvent>,
    present: HashMap<ConnectionId, Participant>,
}

pub struct RoomHub {
    rooms: RwLock<HashMap<Uuid, Room>>,
    channel_capacity: usize,
}

impl RoomHub {
    pub fn new(channel_capacity: usize) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), channel_capacity }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Room>> {
        match self.rooms.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Room>> {
        match self.rooms.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Receiver for every event broadcast to the session's room. Creates the
    /// room on first use.
    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<RelayEvent> {
        let mut rooms = self.write();
        let capacity = self.channel_capacity;
        rooms
            .entry(session_id)
            .or_insert_with(|| Room { sender: broadcast::channel(capacity).0, present: HashMap::new() })
            .sender
            .subscribe()
    }

    /// Sends to everyone in the room. Returns how many subscribers got it;
    /// an absent room is not an error.
    pub fn broadcast(&self, session_id: Uuid, event: RelayEvent) -> usize {
        let rooms = self.read();
        match rooms.get(&session_id) {
            Some(room) => room.sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Registers a connection as present. Returns the announcement for the
    /// room; the caller publishes it so other instances see it too.
    pub fn enter(&self, session_id: Uuid, connection: ConnectionId, participant: Participant) -> RelayEvent {
        let mut rooms = self.write();
        let capacity = self.channel_capacity;
        let room = rooms
            .entry(session_id)
            .or_insert_with(|| Room { sender: broadcast::channel(capacity).0, present: HashMap::new() });
        room.present.insert(connection, participant.clone());
        RelayEvent::ParticipantJoined(participant)
    }

    /// Removes a connection's presence. Returns the participant only when
    /// this was their last connection in the room, i.e. when
    /// `participant_left` is due.
    pub fn exit(&self, session_id: Uuid, connection: ConnectionId) -> Option<Participant> {
        let departed = {
            let mut rooms = self.write();
            let room = rooms.get_mut(&session_id)?;
            let removed = room.present.remove(&connection)?;
            let still_present = room.present.values().any(|p| p.id == removed.id);
            (!still_present).then_some(removed)
        };
        self.prune(session_id);
        departed
    }

    /// Distinct participants currently connected to the room.
    pub fn participants(&self, session_id: Uuid) -> Vec<Participant> {
        let rooms = self.read();
        let mut seen = Vec::new();
        if let Some(room) = rooms.get(&session_id) {
            for participant in room.present.values() {
                if !seen.iter().any(|p: &Participant| p.id == participant.id) {
                    seen.push(participant.clone());
                }
            }
        }
        seen.sort_by(|a, b| a.username.cmp(&b.username));
        seen
    }

    /// Drops the room once nobody listens and nobody is present.
    pub fn prune(&self, session_id: Uuid) {
        let mut rooms = self.write();
        let idle = rooms
            .get(&session_id)
            .map(|room| room.sender.receiver_count() == 0 && room.present.is_empty())
            .unwrap_or(false);
        if idle {
            rooms.remove(&session_id);
        }
    }

    pub fn room_count(&self) -> usize {
        self.read().len()
    }
}

/// A receiver bound to one room. Dropping it, including when the task that
/// owns it is aborted, releases the receiver and prunes the room if it went
/// idle.
pub struct RoomSubscription {
    hub: Arc<RoomHub>,
    session_id: Uuid,
    receiver: Option<broadcast::Receiver<RelayEvent>>,
}

impl RoomSubscription {
    pub fn open(hub: Arc<RoomHub>, session_id: Uuid) -> Self {
        let receiver = hub.subscribe(session_id);
        Self { hub, session_id, receiver: Some(receiver) }
    }

    pub async fn recv(&mut self) -> Result<RelayEvent, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        // The receiver must be gone before prune counts receivers.
        drop(self.receiver.take());
        self.hub.prune(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str) -> Participant {
        Participant { id: Uuid::new_v4(), username: name.to_string(), image_url: None, is_active: true }
    }

    #[test]
    fn broadcast_reaches_room_subscribers_only() {
        let hub = RoomHub::new(8);
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(room_a);
        let mut rx_b = hub.subscribe(room_b);

        let presence = UserPresence { user_id: Uuid::new_v4(), username: "alice".into() };
        assert_eq!(hub.broadcast(room_a, RelayEvent::UserJoined(presence.clone())), 1);

        assert_eq!(rx_a.try_recv().unwrap(), RelayEvent::UserJoined(presence));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcast_without_room_is_noop() {
        let hub = RoomHub::new(8);
        assert_eq!(hub.broadcast(Uuid::new_v4(), RelayEvent::ParticipantLeft(Uuid::new_v4())), 0);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn presence_announces_join_and_leave() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room);
        let alice = participant("alice");
        let conn = ConnectionId::new();

        assert_eq!(hub.enter(room, conn, alice.clone()), RelayEvent::ParticipantJoined(alice.clone()));
        assert_eq!(hub.participants(room), vec![alice.clone()]);

        assert_eq!(hub.exit(room, conn), Some(alice.clone()));
        assert!(hub.participants(room).is_empty());
        // Announcements go through the publisher, not straight to the room.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_connection_keeps_user_present() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let alice = participant("alice");
        let (tab_one, tab_two) = (ConnectionId::new(), ConnectionId::new());

        hub.enter(room, tab_one, alice.clone());
        hub.enter(room, tab_two, alice.clone());
        assert_eq!(hub.participants(room).len(), 1);

        assert_eq!(hub.exit(room, tab_one), None);
        assert_eq!(hub.participants(room), vec![alice.clone()]);
        assert_eq!(hub.exit(room, tab_two), Some(alice));
    }

    #[test]
    fn idle_room_is_pruned() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let rx = hub.subscribe(room);
        assert_eq!(hub.room_count(), 1);
        drop(rx);
        hub.prune(room);
        assert_eq!(hub.room_count(), 0);
    }

    #[actix_web::test]
    async fn room_is_dropped_after_aborted_forwarder_leaves() {
        let hub = Arc::new(RoomHub::new(8));
        let room = Uuid::new_v4();
        let conn = ConnectionId::new();

        let mut subscription = RoomSubscription::open(hub.clone(), room);
        let forwarder = actix_web::rt::spawn(async move { while subscription.recv().await.is_ok() {} });
        hub.enter(room, conn, participant("alice"));
        assert_eq!(hub.room_count(), 1);

        forwarder.abort();
        hub.exit(room, conn);
        let _ = forwarder.await;

        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn listener_without_presence_keeps_room_until_dropped() {
        let hub = Arc::new(RoomHub::new(8));
        let room = Uuid::new_v4();
        let subscription = RoomSubscription::open(hub.clone(), room);
        hub.prune(room);
        assert_eq!(hub.room_count(), 1);
        drop(subscription);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn events_serialize_with_client_names() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(RelayEvent::ParticipantLeft(id)).unwrap();
        assert_eq!(json["event"], "participant_left");
        assert_eq!(json["data"], id.to_string());
    }
}
