// ABOUTME: Knowledge replication plane: broker security, envelope handling, consumers.

pub mod consumer;
pub mod kafka_security;
pub mod knowledge_handler;

pub use consumer::spawn_knowledge_consumers;
pub use kafka_security::{build_kafka_dialer, build_kafka_props, first_broker_host, BrokerDialer};
pub use knowledge_handler::{ApplyStatus, KnowledgeHandler, ProcessError};
