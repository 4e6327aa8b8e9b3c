use actix_web::{web, App, HttpServer};
use log::{error, info, warn};
use std::io;
use std::sync::Arc;

use speakspace::config::{AppConfig, StoreBackend};
use speakspace::db::{init_pool, PgStore};
use speakspace::event_handlers::{handle_session_event, relay_producer};
use speakspace::kafka::{create_producer, KafkaConfig, KafkaConsumer, TOPIC_SESSION_EVENTS};
use speakspace::logger::setup_logger;
use speakspace::memory_store::MemoryStore;
use speakspace::middleware::{EdgeGate, RequestLogger};
use speakspace::rate_limit::TokenBucketLimiter;
use speakspace::relay::RoomHub;
use speakspace::routes;
use speakspace::state::AppState;
use speakspace::store::SharedStore;
use speakspace::ws::ws_handler;

fn build_store(config: &AppConfig) -> io::Result<SharedStore> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let db_url = config.database_url.as_deref().unwrap_or_default();
            info!("Connecting to database");
            let pool = init_pool(db_url).map_err(|e| {
                error!("Failed to initialize database: {}", e);
                io::Error::new(io::ErrorKind::Other, e.to_string())
            })?;
            Ok(Arc::new(PgStore::new(pool)))
        }
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Load environment variables and initialize logger
    dotenvy::dotenv().ok();
    setup_logger();

    // Load and validate configuration
    let config = AppConfig::from_env();
    if let Err(e) = config.validate() {
        error!("Configuration validation error: {}", e);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, e));
    }

    let store = build_store(&config)?;
    let hub = Arc::new(RoomHub::new(config.relay_channel_capacity));

    // Relay transport: Kafka when enabled, otherwise in-process only
    let kafka_config = KafkaConfig::from_env();
    let producer = create_producer(&kafka_config);
    let mut consumer = None;
    if !producer.is_local() {
        let mut session_consumer = KafkaConsumer::new(&kafka_config);
        let consumer_hub = hub.clone();
        match session_consumer.subscribe(&[TOPIC_SESSION_EVENTS], move |key, payload| {
            handle_session_event(consumer_hub.clone(), key, payload)
        }) {
            Ok(()) => {
                info!("Kafka consumer started for {}", TOPIC_SESSION_EVENTS);
                consumer = Some(session_consumer);
            }
            Err(e) => {
                error!("Failed to subscribe to session events: {}", e);
            }
        }
    }
    let producer = Arc::new(relay_producer(producer, consumer.is_some()));

    let state = AppState::new(store, producer, hub, config.clone());
    let limiter = Arc::new(TokenBucketLimiter::new(config.rate_limit));

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    let sign_in_path = config.sign_in_path.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(EdgeGate::new(limiter.clone(), &sign_in_path))
            .wrap(RequestLogger)
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
            .service(ws_handler)
    })
    .keep_alive(std::time::Duration::from_secs(75))
    .shutdown_timeout(30)
    .bind((config.host.clone(), config.port))?
    .run()
    .await;

    if let Some(mut consumer) = consumer {
        consumer.stop();
    }

    result
}
