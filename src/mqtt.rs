use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use tokio::sync::broadcast;

use crate::config;
use crate::delivery::{DeliveryError, Subscriber};
use crate::hub::Payload;
use crate::messages::ControlCommand;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "pixels-bridge".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("pixels".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/scan/start", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/scan/stop", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    /// Drive the connection, turning control topics into [`ControlCommand`]s.
    /// Never returns; rumqttc reconnects on the next poll after an error.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ControlCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(command) = command_for_topic(&p.topic) else {
                            continue;
                        };
                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding scan command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    pub async fn publish_payload(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let channel_name = sanitize_name(payload.device_id().unwrap_or("external"));
        let topic = format!("{}/{}/{}", self.topic_path, self.publisher_id, channel_name);
        debug!("Publishing to {topic}");
        self.client
            .publish(topic, QoS::AtMostOnce, false, serde_json::to_vec(payload)?)
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

/// Hub subscriber republishing every payload on the broker.
pub struct MqttPublisher {
    client: MqttClient,
}

impl MqttPublisher {
    pub fn new(client: MqttClient) -> Self {
        MqttPublisher { client }
    }
}

#[async_trait]
impl Subscriber for MqttPublisher {
    fn label(&self) -> String {
        format!("mqtt {}", self.client.topic_path)
    }

    async fn accept(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
        self.client.publish_payload(payload).await
    }
}

fn command_for_topic(topic: &str) -> Option<ControlCommand> {
    match topic {
        t if t.ends_with("/scan/start") => Some(ControlCommand::StartScan),
        t if t.ends_with("/scan/stop") => Some(ControlCommand::StopScan),
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("AA:BB:CC:DD:EE:FF"), "aa_bb_cc_dd_ee_ff");
        assert_eq!(sanitize_name("Test's Die 123"), "test_s_die_123");
    }

    #[test]
    fn test_command_for_topic() {
        assert_eq!(
            command_for_topic("pixels/scan/start"),
            Some(ControlCommand::StartScan)
        );
        assert_eq!(
            command_for_topic("pixels/scan/stop"),
            Some(ControlCommand::StopScan)
        );
        assert_eq!(command_for_topic("pixels/scan/depart"), None);
    }
}
