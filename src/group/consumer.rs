// ABOUTME: Knowledge-plane broker consumers: one stream task per knowledge topic.
// ABOUTME: Poison-pill skipping for parse/validation failures; storage failures halt.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use rskafka::client::consumer::{StartOffset, StreamConsumerBuilder};
use rskafka::client::partition::UnknownTopicHandling;
use rskafka::client::{Client, ClientBuilder, SaslConfig};
use rskafka::record::{Record, RecordAndOffset};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GroupConfig;
use crate::group::kafka_security::{build_kafka_dialer, BrokerDialer};
use crate::group::knowledge_handler::KnowledgeHandler;
use crate::knowledge::{knowledge_topic, TYPE_FACT, TYPE_PROPOSAL, TYPE_VOTE};

const CONSUMER_MAX_WAIT_MS: i32 = 500;

/// Open a broker client from a validated dialer.
///
/// SSL-bearing protocols are rejected here: this build terminates TLS at a
/// fronting proxy and speaks PLAINTEXT/SASL_PLAINTEXT toward it.
pub async fn connect_broker(dialer: &BrokerDialer, brokers: &str) -> Result<Client> {
    if dialer.uses_tls() {
        bail!(
            "security protocol {} requires in-process TLS, which this build delegates to a \
             TLS-terminating proxy; point kafka_brokers at the proxy's plaintext listener",
            dialer.security_protocol
        );
    }
    let hosts: Vec<String> = brokers
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if hosts.is_empty() {
        bail!("no brokers configured");
    }

    let mut builder = ClientBuilder::new(hosts);
    if let Some(sasl) = &dialer.sasl {
        let sasl_config = match sasl.mechanism.as_str() {
            "PLAIN" => SaslConfig::Plain {
                username: sasl.username.clone(),
                password: sasl.password.clone(),
            },
            other => bail!("unsupported SASL mechanism: {other}"),
        };
        builder = builder.sasl_config(sasl_config);
    }
    builder
        .build()
        .await
        .context("Failed to build broker client")
}

/// Spawn one consumer task per knowledge topic. Tasks stop on `cancel` or on
/// a storage failure (so unprocessed records are not skipped past).
pub async fn spawn_knowledge_consumers(
    cfg: &GroupConfig,
    handler: Arc<KnowledgeHandler>,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let dialer = build_kafka_dialer(cfg).context("broker dialer config invalid")?;
    let client = connect_broker(&dialer, &cfg.kafka_brokers).await?;

    let mut handles = Vec::new();
    for kind in [TYPE_PROPOSAL, TYPE_VOTE, TYPE_FACT] {
        let topic = knowledge_topic(&cfg.name, kind);
        let partition_client = client
            .partition_client(&topic, 0, UnknownTopicHandling::Retry)
            .await
            .with_context(|| format!("Failed to open partition client for {topic}"))?;
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        tracing::info!(topic = %topic, "Knowledge consumer started");
        handles.push(tokio::spawn(async move {
            consume_topic(topic, partition_client, handler, cancel).await;
        }));
    }
    Ok(handles)
}

async fn consume_topic(
    topic: String,
    partition_client: rskafka::client::partition::PartitionClient,
    handler: Arc<KnowledgeHandler>,
    cancel: CancellationToken,
) {
    let mut stream = StreamConsumerBuilder::new(Arc::new(partition_client), StartOffset::Latest)
        .with_max_wait_ms(CONSUMER_MAX_WAIT_MS)
        .build();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(topic = %topic, "Knowledge consumer stopped");
                return;
            }
            item = stream.next() => item,
        };
        let Some(item) = item else {
            tracing::info!(topic = %topic, "Knowledge stream closed");
            return;
        };
        match item {
            Ok((
                RecordAndOffset {
                    record: Record {
                        value: Some(raw), ..
                    },
                    offset,
                },
                _high_watermark,
            )) => {
                if let Err(error) = handler.process(&topic, &raw) {
                    if error.is_poison() {
                        tracing::warn!(
                            topic = %topic,
                            offset,
                            error = %error,
                            "Skipping malformed knowledge record"
                        );
                        continue;
                    }
                    tracing::error!(
                        topic = %topic,
                        offset,
                        error = %error,
                        "Knowledge storage failure, halting consumer"
                    );
                    return;
                }
            }
            // Tombstones carry no payload.
            Ok(_) => continue,
            Err(error) => {
                tracing::warn!(topic = %topic, error = %error, "Broker read error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::kafka_security::dialer_from_props;
    use std::collections::HashMap;

    #[tokio::test]
    async fn connect_rejects_tls_protocols() {
        let mut props = HashMap::new();
        props.insert("security.protocol".to_string(), "SASL_SSL".to_string());
        props.insert("sasl.username".to_string(), "token".to_string());
        props.insert("sasl.password".to_string(), "key".to_string());
        let dialer = dialer_from_props(&props, "proxy").unwrap();
        let err = connect_broker(&dialer, "proxy:9092").await.unwrap_err();
        assert!(err.to_string().contains("TLS"));
    }

    #[tokio::test]
    async fn connect_rejects_empty_broker_list() {
        let dialer = dialer_from_props(&HashMap::new(), "").unwrap();
        assert!(connect_broker(&dialer, " , ").await.is_err());
    }

    #[tokio::test]
    async fn connect_rejects_unknown_sasl_mechanism() {
        let mut props = HashMap::new();
        props.insert(
            "security.protocol".to_string(),
            "SASL_PLAINTEXT".to_string(),
        );
        props.insert("sasl.mechanism".to_string(), "GSSAPI".to_string());
        props.insert("sasl.username".to_string(), "svc".to_string());
        props.insert("sasl.password".to_string(), "secret".to_string());
        let dialer = dialer_from_props(&props, "broker-a").unwrap();
        let err = connect_broker(&dialer, "broker-a:9092").await.unwrap_err();
        assert!(err.to_string().contains("GSSAPI"));
    }
}
