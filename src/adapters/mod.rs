
pub mod alert_publisher;
pub mod memory;
pub mod mqtt;
pub mod postgres;
pub use alert_publisher::MqttAlertPublisher;
pub use memory::InMemoryStore;
pub use mqtt::MqttAdapter;
pub use postgres::PostgresStore;
