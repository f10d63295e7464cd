use anyhow::{anyhow, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::thread::JoinHandle;
use std::time::Duration;

use super::FallEventSink;
use crate::fall::FallEvent;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "fallwatch".to_string(),
            topic_prefix: "fallwatch".to_string(),
            username: None,
            password: None,
        }
    }
}

impl MqttSettings {
    /// Parse `host[:port]`.
    pub fn with_broker(mut self, broker: &str) -> Result<Self> {
        let broker = broker.trim();
        if broker.is_empty() {
            return Err(anyhow!("mqtt broker address is empty"));
        }
        match broker.rsplit_once(':') {
            Some((host, port)) => {
                self.host = host.to_string();
                self.port = port
                    .parse()
                    .map_err(|_| anyhow!("invalid mqtt broker port in '{}'", broker))?;
            }
            None => self.host = broker.to_string(),
        }
        Ok(self)
    }

    pub fn event_topic(&self) -> String {
        format!("{}/fall", self.topic_prefix)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.topic_prefix)
    }
}

/// Publishes fall events as JSON with QoS 1.
pub struct MqttSink {
    client: Client,
    event_topic: String,
    availability_topic: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        let availability_topic = settings.availability_topic();
        options.set_last_will(LastWill::new(
            &availability_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));

        let (client, connection) = Client::new(options, 10);
        let connection_handle = spawn_connection_pump(connection)?;
        client.publish(
            &availability_topic,
            QoS::AtLeastOnce,
            true,
            PAYLOAD_ONLINE.as_bytes().to_vec(),
        )?;
        log::info!(
            "MqttSink: publishing fall events to {}:{} topic {}",
            settings.host,
            settings.port,
            settings.event_topic()
        );

        Ok(Self {
            client,
            event_topic: settings.event_topic(),
            availability_topic,
            connection_handle: Some(connection_handle),
        })
    }
}

fn spawn_connection_pump(mut connection: Connection) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("mqtt-connection".into())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

impl FallEventSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, event: &FallEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        // try_publish so a stalled broker cannot stall the frame loop
        self.client
            .try_publish(&self.event_topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        let _ = self.client.try_publish(
            &self.availability_topic,
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
        );
        let _ = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_parsing_accepts_host_and_port() -> Result<()> {
        let settings = MqttSettings::default().with_broker("broker.local:8883")?;
        assert_eq!(settings.host, "broker.local");
        assert_eq!(settings.port, 8883);

        let settings = MqttSettings::default().with_broker("broker.local")?;
        assert_eq!(settings.port, 1883);

        assert!(MqttSettings::default().with_broker("broker:nope").is_err());
        assert!(MqttSettings::default().with_broker("  ").is_err());
        Ok(())
    }

    #[test]
    fn topics_use_prefix() {
        let settings = MqttSettings {
            topic_prefix: "home/cam1".to_string(),
            ..MqttSettings::default()
        };
        assert_eq!(settings.event_topic(), "home/cam1/fall");
        assert_eq!(settings.availability_topic(), "home/cam1/availability");
    }
}
