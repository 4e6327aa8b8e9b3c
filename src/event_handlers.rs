use crate::kafka::{DummyKafkaProducer, Event, EventType, KafkaProducer, TOPIC_SESSION_EVENTS};
use crate::models::{MessageWithSender, User};
use crate::relay::{RelayEvent, RoomHub, UserPresence};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub event: RelayEvent,
}

fn event_type_of(event: &RelayEvent) -> EventType {
    match event {
        RelayEvent::NewMessage(_) => EventType::MessageSent,
        RelayEvent::UserJoined(_) => EventType::MemberJoined,
        RelayEvent::UserLeft(_) => EventType::MemberLeft,
        RelayEvent::ParticipantJoined(_)
        | RelayEvent::ParticipantLeft(_)
        | RelayEvent::ParticipantsList(_) => EventType::PresenceChanged,
    }
}

/// Producer for the publisher. A broker producer only delivers anything
/// when this instance also consumes the topic, so without a consumer the
/// relay stays in-process.
pub fn relay_producer(producer: KafkaProducer, consuming: bool) -> KafkaProducer {
    if consuming || producer.is_local() {
        return producer;
    }
    warn!("Session events are not consumed by this instance; relaying in-process only");
    KafkaProducer::Dummy(DummyKafkaProducer::new())
}

/// Publishes committed state changes to session rooms.
///
/// With a broker configured the event is sent to Kafka and reaches the local
/// hub through the consumer, like on every other instance. Without one it
/// goes straight to the local hub. Either way publishing never fails the
/// caller.
#[derive(Clone)]
pub struct EventPublisher {
    producer: Arc<KafkaProducer>,
    hub: Arc<RoomHub>,
}

impl EventPublisher {
    pub fn new(producer: Arc<KafkaProducer>, hub: Arc<RoomHub>) -> Self {
        Self { producer, hub }
    }

    pub fn publish(&self, session_id: Uuid, event: RelayEvent) {
        if self.producer.is_local() {
            let delivered = self.hub.broadcast(session_id, event);
            debug!("Relayed event to {} subscriber(s) in session {}", delivered, session_id);
            return;
        }

        let producer = self.producer.clone();
        let envelope = Event::new(event_type_of(&event), SessionEvent { session_id, event });
        actix_web::rt::spawn(async move {
            let key = session_id.to_string();
            if let Err(e) = producer.send(TOPIC_SESSION_EVENTS, Some(&key), &envelope).await {
                warn!("Failed to publish {:?} event for session {}: {}", envelope.event_type, key, e);
            }
        });
    }

    pub fn publish_new_message(&self, message: &MessageWithSender) {
        self.publish(message.session_id, RelayEvent::NewMessage(message.clone()));
    }

    pub fn publish_user_joined(&self, session_id: Uuid, user: &User) {
        self.publish(
            session_id,
            RelayEvent::UserJoined(UserPresence { user_id: user.id, username: user.username.clone() }),
        );
    }

    pub fn publish_user_left(&self, session_id: Uuid, presence: UserPresence) {
        self.publish(session_id, RelayEvent::UserLeft(presence));
    }
}

// Event consumer handlers
pub async fn handle_session_event(hub: Arc<RoomHub>, _key: String, payload: String) {
    match serde_json::from_str::<Event<SessionEvent>>(&payload) {
        Ok(event) => {
            let session_id = event.payload.session_id;
            let delivered = hub.broadcast(session_id, event.payload.event);
            debug!(
                "{:?} event for session {} relayed to {} subscriber(s)",
                event.event_type, session_id, delivered
            );
        }
        Err(e) => {
            error!("Failed to deserialize session event: {}", e);
        }
    }
}
