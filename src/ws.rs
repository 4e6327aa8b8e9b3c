//! Socket endpoint that fans committed session events out to browsers.

use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_ws::{Message, MessageStream, Session as Socket};
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::identity_from_request;
use crate::models::{MembershipState, SessionMember, User};
use crate::relay::{ConnectionId, Participant, RelayEvent, RoomSubscription};
use crate::services::IdentityService;
use crate::state::AppState;
use crate::store::run_blocking;

/// Frames a client may send. Both naming schemes used by the web client
/// are accepted.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "joinSession", alias = "join_room")]
    Join(Uuid),
    #[serde(rename = "leaveSession", alias = "leave_room")]
    Leave(Uuid),
    #[serde(rename = "get_participants")]
    GetParticipants(Uuid),
}

/// What a socket may do in a session room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomAccess {
    Denied,
    /// Former members receive room events but are not shown as present.
    Listen,
    Present,
}

fn room_access(member: Option<&SessionMember>) -> RoomAccess {
    match member.map(SessionMember::state) {
        None => RoomAccess::Denied,
        Some(MembershipState::Active) => RoomAccess::Present,
        Some(MembershipState::Left) | Some(MembershipState::Banned) => RoomAccess::Listen,
    }
}

async fn send_json<T: Serialize>(socket: &mut Socket, value: &T) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(value) {
        Ok(text) => socket.text(text).await,
        Err(e) => {
            warn!("Failed to serialize socket frame: {}", e);
            Ok(())
        }
    }
}

struct Connection {
    id: ConnectionId,
    state: AppState,
    user: User,
    socket: Socket,
    rooms: HashMap<Uuid, Seat>,
}

struct Seat {
    forwarder: JoinHandle<()>,
    present: bool,
}

impl Connection {
    fn new(state: AppState, user: User, socket: Socket) -> Self {
        Self { id: ConnectionId::new(), state, user, socket, rooms: HashMap::new() }
    }

    async fn run(mut self, mut stream: MessageStream) {
        info!("Socket {} opened for user {}", self.id, self.user.id);

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_text(&text).await,
                Ok(Message::Ping(bytes)) => {
                    if self.socket.pong(&bytes).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(reason)) => {
                    debug!("Socket {} closed by client: {:?}", self.id, reason);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Socket {} protocol error: {}", self.id, e);
                    break;
                }
            }
        }

        self.disconnect().await;
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(ClientEvent::Join(session_id)) => self.join(session_id).await,
            Ok(ClientEvent::Leave(session_id)) => self.leave(session_id),
            Ok(ClientEvent::GetParticipants(session_id)) => self.list_participants(session_id).await,
            Err(e) => {
                debug!("Socket {} sent an unrecognized frame: {}", self.id, e);
                self.send_error("Unrecognized event").await;
            }
        }
    }

    async fn send_error(&mut self, message: &str) {
        let _ = send_json(&mut self.socket, &json!({ "event": "error", "data": message })).await;
    }

    /// Membership check shared by every room operation. Sends the error
    /// frame itself and returns `None` when the lookup fails.
    async fn access(&mut self, session_id: Uuid) -> Option<RoomAccess> {
        let user_id = self.user.id;
        match run_blocking(&self.state.store, move |s| s.find_membership(session_id, user_id)).await {
            Ok(member) => Some(room_access(member.as_ref())),
            Err(e) => {
                warn!("Membership lookup for socket {} failed: {}", self.id, e);
                self.send_error("Could not reach the session room").await;
                None
            }
        }
    }

    async fn join(&mut self, session_id: Uuid) {
        if self.rooms.contains_key(&session_id) {
            return;
        }

        let access = match self.access(session_id).await {
            Some(access) => access,
            None => return,
        };
        if access == RoomAccess::Denied {
            debug!("User {} tried to subscribe to session {} without membership", self.user.id, session_id);
            self.send_error("You are not a member of this session").await;
            return;
        }

        let forwarder = self.forward(session_id);
        let present = access == RoomAccess::Present;
        self.rooms.insert(session_id, Seat { forwarder, present });
        if present {
            let announcement = self.state.hub.enter(
                session_id,
                self.id,
                Participant {
                    id: self.user.id,
                    username: self.user.username.clone(),
                    image_url: Some(self.user.image_url.clone()),
                    is_active: true,
                },
            );
            self.state.events.publish(session_id, announcement);
        }
        debug!("Socket {} joined room {} (present: {})", self.id, session_id, present);
    }

    fn leave(&mut self, session_id: Uuid) {
        if let Some(seat) = self.rooms.remove(&session_id) {
            seat.forwarder.abort();
            if seat.present {
                if let Some(departed) = self.state.hub.exit(session_id, self.id) {
                    self.state.events.publish(session_id, RelayEvent::ParticipantLeft(departed.id));
                }
            }
            debug!("Socket {} left room {}", self.id, session_id);
        }
    }

    async fn list_participants(&mut self, session_id: Uuid) {
        match self.access(session_id).await {
            Some(RoomAccess::Denied) => self.send_error("You are not a member of this session").await,
            Some(_) => {
                let list = RelayEvent::ParticipantsList(self.state.hub.participants(session_id));
                let _ = send_json(&mut self.socket, &list).await;
            }
            None => {}
        }
    }

    /// Pumps room events into this socket until either side goes away.
    fn forward(&self, session_id: Uuid) -> JoinHandle<()> {
        let mut events = RoomSubscription::open(self.state.hub.clone(), session_id);
        let mut socket = self.socket.clone();
        let connection = self.id;
        actix_web::rt::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if send_json(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Socket {} lagged behind room {} by {} event(s)", connection, session_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn disconnect(mut self) {
        let rooms: Vec<Uuid> = self.rooms.keys().copied().collect();
        for session_id in rooms {
            self.leave(session_id);
        }
        info!("Socket {} closed for user {}", self.id, self.user.id);
        let _ = self.socket.close(None).await;
    }
}

#[get("/ws")]
pub async fn ws_handler(req: HttpRequest, body: web::Payload, state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let identity = identity_from_request(&req)?;
    let user = IdentityService::resolve(&identity, &state).await?;

    let (response, socket, stream) = actix_ws::handle(&req, body)?;
    let connection = Connection::new(state.get_ref().clone(), user, socket);
    actix_web::rt::spawn(connection.run(stream));

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_event_spellings_parse() {
        let id = Uuid::new_v4();
        let camel: ClientEvent = serde_json::from_str(&format!(r#"{{"event":"joinSession","data":"{}"}}"#, id)).unwrap();
        let snake: ClientEvent = serde_json::from_str(&format!(r#"{{"event":"join_room","data":"{}"}}"#, id)).unwrap();
        assert_eq!(camel, ClientEvent::Join(id));
        assert_eq!(snake, ClientEvent::Join(id));

        let leave: ClientEvent = serde_json::from_str(&format!(r#"{{"event":"leave_room","data":"{}"}}"#, id)).unwrap();
        assert_eq!(leave, ClientEvent::Leave(id));
    }

    fn member(is_banned: bool, left: bool) -> SessionMember {
        let now = chrono::Utc::now().naive_utc();
        SessionMember {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            role: crate::models::MemberRole::Participant,
            is_banned,
            joined_at: now,
            left_at: left.then_some(now),
        }
    }

    #[test]
    fn only_active_members_are_shown_as_present() {
        assert_eq!(room_access(None), RoomAccess::Denied);
        assert_eq!(room_access(Some(&member(false, false))), RoomAccess::Present);
        assert_eq!(room_access(Some(&member(false, true))), RoomAccess::Listen);
        assert_eq!(room_access(Some(&member(true, true))), RoomAccess::Listen);
    }

    #[test]
    fn unknown_event_is_rejected() {
        let frame = format!(r#"{{"event":"sendMessage","data":"{}"}}"#, Uuid::new_v4());
        assert!(serde_json::from_str::<ClientEvent>(&frame).is_err());
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"joinSession","data":"nope"}"#).is_err());
    }
}
