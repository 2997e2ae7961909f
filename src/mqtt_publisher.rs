use crate::config::Config;
use crate::error::MonitorError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_MQTT_PORT: u16 = 1883;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Opaque publish side of the telemetry sink.
#[async_trait]
pub trait TelemetryClient: Send {
    fn is_connected(&self) -> bool;

    /// Makes one connection attempt.
    async fn connect(&mut self) -> anyhow::Result<()>;

    async fn publish(&mut self, topic: &str, payload: String, retain: bool) -> anyhow::Result<()>;

    /// Drops the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// MQTT implementation of [`TelemetryClient`] on top of `rumqttc`.
pub struct MqttPublisher {
    options: MqttOptions,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    /// Validates the broker settings and prepares the client without connecting.
    pub fn from_config(config: &Config) -> Result<Self, MonitorError> {
        if config.mqtt_host.is_empty() {
            return Err(MonitorError::Configuration(
                "MQTT host has not been configured".to_string(),
            ));
        }
        if config.mqtt_username.is_empty() {
            return Err(MonitorError::Configuration(
                "MQTT username has not been configured".to_string(),
            ));
        }
        if config.mqtt_password.is_empty() {
            return Err(MonitorError::Configuration(
                "MQTT password has not been configured".to_string(),
            ));
        }

        let (host, port) = parse_broker_address(&config.mqtt_host)?;
        let mut options = MqttOptions::new(
            format!("power-monitor-{}", std::process::id()),
            host,
            port,
        );
        options.set_credentials(config.mqtt_username.clone(), config.mqtt_password.clone());
        options.set_keep_alive(Duration::from_secs(30));

        Ok(Self {
            options,
            client: None,
            driver: None,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl TelemetryClient for MqttPublisher {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        self.stop_driver();
        let (host, port) = self.options.broker_address();
        info!(%host, port, "Connecting to the MQTT broker");

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), 16);
        let connected = self.connected.clone();
        let (ack_tx, ack_rx) = oneshot::channel::<Result<(), String>>();

        // The event loop has to be polled for anything to move, including publishes.
        let driver = tokio::spawn(async move {
            let mut ack_tx = Some(ack_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        let accepted = ack.code == ConnectReturnCode::Success;
                        connected.store(accepted, Ordering::Relaxed);
                        if let Some(tx) = ack_tx.take() {
                            let _ = tx.send(if accepted {
                                Ok(())
                            } else {
                                Err(format!("broker refused connection: {:?}", ack.code))
                            });
                        }
                        if !accepted {
                            break;
                        }
                        info!("Connected to the MQTT broker");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        connected.store(false, Ordering::Relaxed);
                        info!("Disconnected from the MQTT broker");
                        break;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::Relaxed);
                        warn!("MQTT broker closed the session");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::Relaxed);
                        match ack_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(e.to_string()));
                            }
                            None => warn!(error = %e, "Disconnected from the MQTT broker"),
                        }
                        break;
                    }
                }
            }
        });
        self.client = Some(client);
        self.driver = Some(driver);

        match tokio::time::timeout(CONNECT_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => {
                self.stop_driver();
                Err(MonitorError::Connection(reason).into())
            }
            Ok(Err(_)) => {
                self.stop_driver();
                Err(MonitorError::Connection("event loop ended before CONNACK".to_string()).into())
            }
            Err(_) => {
                self.stop_driver();
                Err(MonitorError::Connection(format!(
                    "no CONNACK within {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
                .into())
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: String, retain: bool) -> anyhow::Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| MonitorError::Connection("client is not connected".to_string()))?;
        client
            .publish(topic, QoS::AtMostOnce, retain, payload.into_bytes())
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            match client.disconnect().await {
                // The driver ends once DISCONNECT has been written out.
                Ok(()) => {
                    if let Some(driver) = self.driver.as_mut() {
                        if tokio::time::timeout(DISCONNECT_TIMEOUT, driver).await.is_err() {
                            warn!("MQTT disconnect was not sent in time");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "MQTT disconnect failed"),
            }
        }
        self.stop_driver();
    }
}

/// Splits `tcp://host:port`, `host:port` or `host` into host and port.
fn parse_broker_address(raw: &str) -> Result<(String, u16), MonitorError> {
    let trimmed = raw
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(MonitorError::Configuration(format!(
            "invalid MQTT host `{raw}`"
        )));
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| {
                MonitorError::Configuration(format!("invalid MQTT port in `{raw}`"))
            })?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(MonitorError::Configuration(format!(
            "invalid MQTT host `{raw}`"
        ))),
        None => Ok((trimmed.to_string(), DEFAULT_MQTT_PORT)),
    }
}
