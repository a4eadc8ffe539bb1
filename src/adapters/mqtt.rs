use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use crate::ports::MessageBroker;
use tracing::{info, instrument};
use std::time::Duration;
use crate::config::BrokerConfig;

pub struct MqttAdapter {
    client: AsyncClient,
    qos: QoS,
}

impl MqttAdapter {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }

    /// Build client + event loop for one broker. Nothing touches the network until
    /// the event loop is polled.
    pub fn build(config: &BrokerConfig) -> (AsyncClient, EventLoop) {
        let mut mqttoptions = MqttOptions::new(config.client_id.clone(), &config.host, config.port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        if config.tls {
            mqttoptions.set_transport(Transport::tls_with_default_config());
        }

        AsyncClient::new(mqttoptions, 100)
    }

    /// Poll until the broker acknowledges the connection. Used at startup, where an
    /// unreachable broker is fatal.
    pub async fn await_connack(eventloop: &mut EventLoop, timeout: Duration) -> anyhow::Result<()> {
        let wait = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("Broker accepted connection: {:?}", ack.code);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(anyhow::anyhow!("MQTT connection failed: {:?}", e)),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow::anyhow!("Timed out after {:?} waiting for CONNACK", timeout))?
    }
}

/// Publishes are queued with `try_publish`: while the broker is unreachable the
/// request queue fills up and further publishes fail instead of waiting.
#[async_trait]
impl MessageBroker for MqttAdapter {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| anyhow::anyhow!("MQTT Publish Failed: {:?}", e))?;
        Ok(())
    }

    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .try_publish(topic, self.qos, true, payload)
            .map_err(|e| anyhow::anyhow!("MQTT Publish Failed: {:?}", e))?;
        Ok(())
    }
}
