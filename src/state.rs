use std::sync::Arc;

use crate::config::AppConfig;
use crate::event_handlers::EventPublisher;
use crate::kafka::{DummyKafkaProducer, KafkaProducer};
use crate::memory_store::MemoryStore;
use crate::relay::RoomHub;
use crate::store::SharedStore;

/// Shared application state handed to every handler as `web::Data`.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub events: EventPublisher,
    pub hub: Arc<RoomHub>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: SharedStore, producer: Arc<KafkaProducer>, hub: Arc<RoomHub>, config: AppConfig) -> Self {
        let events = EventPublisher::new(producer, hub.clone());
        Self { store, events, hub, config }
    }

    /// In-memory store, in-process relay.
    pub fn in_memory(config: AppConfig) -> Self {
        let hub = Arc::new(RoomHub::new(config.relay_channel_capacity));
        let producer = Arc::new(KafkaProducer::Dummy(DummyKafkaProducer::new()));
        Self::new(Arc::new(MemoryStore::new()), producer, hub, config)
    }
}
