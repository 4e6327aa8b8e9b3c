use log::{debug, error, info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message; // Import the Message trait
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// Kafka configuration
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub enabled: bool,
    pub bootstrap_servers: String,
    pub client_id: String,
    pub group_id: String,
}

impl KafkaConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let enabled = std::env::var("KAFKA_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| "localhost:9092".to_string());

        let client_id = std::env::var("KAFKA_CLIENT_ID")
            .unwrap_or_else(|_| "speakspace-service".to_string());

        // Every instance needs every room event, so the default group is
        // unique per process.
        let group_id = std::env::var("KAFKA_GROUP_ID")
            .unwrap_or_else(|_| format!("speakspace-relay-{}", uuid::Uuid::new_v4()));

        Self {
            enabled,
            bootstrap_servers,
            client_id,
            group_id,
        }
    }

    fn consumer_config(&self, client_suffix: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("client.id", format!("{}{}", &self.client_id, client_suffix))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "6000");
        config
    }
}

// Define an enum that can represent all our Kafka producer types
#[derive(Clone)]
pub enum KafkaProducer {
    Real(RdKafkaProducer),
    Dummy(DummyKafkaProducer),
}

impl KafkaProducer {
    pub async fn send<T: Serialize>(&self, topic: &str, key: Option<&str>, payload: &T) -> Result<(), String> {
        match self {
            KafkaProducer::Real(producer) => producer.send(topic, key, payload).await,
            KafkaProducer::Dummy(producer) => producer.send(topic, key, payload).await,
        }
    }

    /// True when no broker is behind this producer and events must be
    /// delivered in-process.
    pub fn is_local(&self) -> bool {
        matches!(self, KafkaProducer::Dummy(_))
    }
}

// Concrete implementation
#[derive(Clone)]
pub struct RdKafkaProducer {
    producer: FutureProducer,
}

impl RdKafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", "5000")
            .set("compression.type", "snappy")
            .set("acks", "all")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn send<T: Serialize>(&self, topic: &str, key: Option<&str>, payload: &T) -> Result<(), String> {
        let json_payload = serde_json::to_string(payload).map_err(|e| format!("Serialization error: {}", e))?;

        let record = match key {
            Some(k) => FutureRecord::to(topic).key(k).payload(&json_payload),
            None => FutureRecord::to(topic).payload(&json_payload),
        };

        debug!("Sending message to topic {}: {}", topic, json_payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(5))).await {
            Ok((partition, offset)) => {
                debug!("Message sent to topic {}, partition {}, offset {}", topic, partition, offset);
                Ok(())
            }
            Err((err, _)) => {
                error!("Failed to send message to Kafka: {}", err);
                Err(format!("Failed to send message: {}", err))
            }
        }
    }
}

// Create a Kafka producer, falling back to the in-process dummy
pub fn create_producer(config: &KafkaConfig) -> KafkaProducer {
    if !config.enabled {
        info!("Kafka disabled; relay events stay in-process");
        return KafkaProducer::Dummy(DummyKafkaProducer::new());
    }
    match RdKafkaProducer::new(config) {
        Ok(producer) => KafkaProducer::Real(producer),
        Err(e) => {
            error!("Failed to create RdKafkaProducer: {}. Using dummy producer.", e);
            KafkaProducer::Dummy(DummyKafkaProducer::new())
        }
    }
}

// Dummy producer for fallback when Kafka is unavailable
#[derive(Clone, Default)]
pub struct DummyKafkaProducer {}

impl DummyKafkaProducer {
    pub fn new() -> Self {
        Self {}
    }

    pub async fn send<T: Serialize>(&self, topic: &str, key: Option<&str>, payload: &T) -> Result<(), String> {
        warn!("Using dummy Kafka producer. Message to topic '{}' not sent.", topic);
        if let Ok(json) = serde_json::to_string(payload) {
            debug!("Would have sent: key={:?}, payload={}", key, json);
        }
        Ok(())
    }
}

// Kafka consumer wrapper
pub struct KafkaConsumer {
    config: KafkaConfig,
    running: Arc<AtomicBool>,
    handlers: Vec<JoinHandle<()>>,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            config: config.clone(),
            running: Arc::new(AtomicBool::new(true)),
            handlers: Vec::new(),
        }
    }

    pub fn subscribe<F, Fut>(&mut self, topics: &[&str], message_handler: F) -> Result<(), KafkaError>
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let worker_consumer: StreamConsumer = self.config.consumer_config("-worker").create()?;
        worker_consumer.subscribe(topics)?;
        info!("Subscribed to topics: {:?}", topics);

        let running = self.running.clone();

        // Start a worker task that will process messages
        let worker = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                match worker_consumer.recv().await {
                    Ok(message) => {
                        let payload = match message.payload().map(std::str::from_utf8) {
                            Some(Ok(s)) => s.to_owned(),
                            Some(Err(e)) => {
                                error!("Error converting message payload to UTF-8: {}", e);
                                if let Err(e) = worker_consumer.commit_message(&message, CommitMode::Async) {
                                    error!("Failed to commit message: {}", e);
                                }
                                continue;
                            }
                            None => {
                                warn!("Empty message payload");
                                if let Err(e) = worker_consumer.commit_message(&message, CommitMode::Async) {
                                    error!("Failed to commit message: {}", e);
                                }
                                continue;
                            }
                        };

                        let key = message
                            .key()
                            .and_then(|bytes| std::str::from_utf8(bytes).ok())
                            .map(str::to_owned)
                            .unwrap_or_default();

                        debug!("Received message: key={}, payload={}", key, payload);

                        // Process message using the provided handler
                        message_handler(key, payload).await;

                        // Commit the message offset
                        if let Err(e) = worker_consumer.commit_message(&message, CommitMode::Async) {
                            error!("Failed to commit message: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Error while receiving message: {:?}", e);
                    }
                }
            }
        });

        self.handlers.push(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for handler in self.handlers.drain(..) {
            handler.abort();
        }
    }
}

// Event types for Kafka messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    MessageSent,
    MemberJoined,
    MemberLeft,
    PresenceChanged,
}

// Generic event structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Event<T> {
    pub event_type: EventType,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(event_type: EventType, payload: T) -> Self {
        Self {
            event_type,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }
}

// Event-specific topics
pub const TOPIC_SESSION_EVENTS: &str = "session-events";
