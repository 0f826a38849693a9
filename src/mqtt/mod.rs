//! MQTT channel to the network server's gateway bridge
//!
//! The broker connection, keep-alive and reconnection all run on a
//! background task that polls the rumqttc event loop. Subscription handlers
//! are called from that task, so they only see values captured at connect
//! time.

pub mod frame;
pub mod topic;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{BridgeError, ConfigError, Result};

pub const DEFAULT_BROKER_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

/// Called with the topic and payload of every message on a subscribed filter
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Validated broker settings with topics already resolved for the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub uplink_topic: String,
    pub downlink_topic: String,
}

impl MqttSettings {
    pub fn from_config(config: &MqttConfig, gateway_mac: &str) -> std::result::Result<Self, ConfigError> {
        let (host, port) = parse_broker_uri(&config.server)?;
        Ok(Self {
            host,
            port,
            user: config.user.clone(),
            password: config.password.clone(),
            uplink_topic: topic::resolve_topic(&config.uplink_topic, gateway_mac)?,
            downlink_topic: topic::resolve_topic(&config.downlink_topic, gateway_mac)?,
        })
    }
}

/// Split `tcp://host:port`, `mqtt://host:port`, `host:port` or `host`
pub fn parse_broker_uri(uri: &str) -> std::result::Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidBrokerUri(uri.to_string());

    let trimmed = uri.trim();
    let authority = match trimmed.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => trimmed,
    };
    let authority = authority.trim_end_matches('/');

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after.strip_prefix(':') {
            Some(port) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None if after.is_empty() => (host, DEFAULT_BROKER_PORT),
            None => return Err(invalid()),
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, DEFAULT_BROKER_PORT),
        }
    };

    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Client id unique across restarts
pub fn client_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("lds-{}", nanos)
}

struct Subscription {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Shared {
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = match self.subscriptions.lock() {
            Ok(subscriptions) => subscriptions
                .iter()
                .filter(|s| topic::topic_matches(&s.filter, topic))
                .map(|s| s.handler.clone())
                .collect(),
            Err(_) => return,
        };

        if handlers.is_empty() {
            debug!("No handler for message on {}", topic);
        }
        for handler in handlers {
            handler(topic, payload);
        }
    }

    fn resubscribe(&self, client: &AsyncClient) {
        let Ok(subscriptions) = self.subscriptions.lock() else {
            return;
        };
        for subscription in subscriptions.iter() {
            if let Err(e) = client.try_subscribe(subscription.filter.clone(), subscription.qos) {
                warn!("Resubscribe to {} failed: {}", subscription.filter, e);
            }
        }
    }
}

/// Publish/subscribe connection to one broker
pub struct MqttChannel {
    client: AsyncClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MqttChannel {
    /// Connect and wait for the broker's CONNACK
    ///
    /// On failure nothing keeps running. Once connected, the background
    /// task reconnects on its own whenever the connection drops.
    pub async fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(client_id(), settings.host.clone(), settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        if !settings.user.is_empty() {
            options.set_credentials(settings.user.clone(), settings.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!("MQTT connecting to {}:{}...", settings.host, settings.port);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(event) => debug!("MQTT event before CONNACK: {:?}", event),
                Err(e) => {
                    error!("connection error: {}", e);
                    return Err(BridgeError::Connect(e.to_string()));
                }
            }
        }
        info!("connection established");

        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            shared.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            client,
            shared,
            cancel,
            task: Some(task),
        })
    }

    /// Subscribe `handler` to `filter`
    ///
    /// A failed request is logged only; the subscription is kept and
    /// re-issued after every reconnect.
    pub async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) {
        if let Ok(mut subscriptions) = self.shared.subscriptions.lock() {
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
                handler,
            });
        }

        match self.client.subscribe(filter, qos).await {
            Ok(()) => info!("subscribed to {} (qos {:?})", filter, qos),
            Err(e) => warn!("subscribe to {} failed: {}", filter, e),
        }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        self.client.publish(topic, qos, false, payload).await?;
        debug!("published to {}", topic);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Send DISCONNECT and give in-flight traffic up to `grace` to drain
    ///
    /// Safe to call repeatedly.
    pub async fn disconnect(&mut self, grace: Duration) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("MQTT event loop task failed: {}", e),
            Err(_) => {
                self.cancel.cancel();
                if let Err(e) = task.await {
                    error!("MQTT event loop task failed: {}", e);
                }
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("MQTT disconnected");
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT reconnected");
                shared.connected.store(true, Ordering::SeqCst);
                shared.resubscribe(&client);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "MQTT message on {}: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                shared.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("SUBACK for pkid {}: {:?}", ack.pkid, ack.return_codes);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!("MQTT connection lost: {}; reconnecting", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_config(server: &str) -> MqttConfig {
        MqttConfig {
            server: server.to_string(),
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_parse_broker_uri() {
        assert_eq!(
            parse_broker_uri("tcp://192.168.1.1:1883").unwrap(),
            ("192.168.1.1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_uri("mqtt://broker.local:11883/").unwrap(),
            ("broker.local".to_string(), 11883)
        );
        assert_eq!(
            parse_broker_uri("192.168.1.1").unwrap(),
            ("192.168.1.1".to_string(), DEFAULT_BROKER_PORT)
        );
        assert_eq!(
            parse_broker_uri("[::1]:1884").unwrap(),
            ("::1".to_string(), 1884)
        );
    }

    #[test]
    fn test_parse_broker_uri_rejects() {
        for uri in ["", "ssl://host:8883", "tcp://:1883", "host:port", "[::1", "tcp://host/path"] {
            assert!(
                matches!(parse_broker_uri(uri), Err(ConfigError::InvalidBrokerUri(_))),
                "{:?} should be rejected",
                uri
            );
        }
    }

    #[test]
    fn test_settings_resolve_topics() {
        let settings = MqttSettings::from_config(&mqtt_config("tcp://10.0.0.1:1883"), "AABBCC").unwrap();
        assert_eq!(settings.host, "10.0.0.1");
        assert_eq!(settings.uplink_topic, "gateway/AABBCC/event/up");
        assert_eq!(settings.downlink_topic, "gateway/AABBCC/command/down");
    }

    #[test]
    fn test_settings_bad_template() {
        let config = MqttConfig {
            uplink_topic: "gateway/event/up".to_string(),
            ..mqtt_config("tcp://10.0.0.1:1883")
        };
        assert!(matches!(
            MqttSettings::from_config(&config, "AABBCC"),
            Err(ConfigError::InvalidTopicTemplate(_))
        ));
    }

    #[test]
    fn test_client_ids_are_distinct() {
        let first = client_id();
        std::thread::sleep(Duration::from_millis(1));
        let second = client_id();
        assert!(first.starts_with("lds-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_dispatch_routes_by_filter() {
        let shared = Shared::default();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let sink = hits.clone();
        shared.subscriptions.lock().unwrap().push(Subscription {
            filter: "gateway/+/command/down".to_string(),
            qos: QoS::AtLeastOnce,
            handler: Arc::new(move |topic: &str, payload: &[u8]| {
                sink.lock().unwrap().push((topic.to_string(), payload.to_vec()))
            }),
        });

        shared.dispatch("gateway/AA/command/down", &[0x01]);
        shared.dispatch("gateway/AA/event/up", &[0x02]);

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], ("gateway/AA/command/down".to_string(), vec![0x01]));
    }

    #[tokio::test]
    async fn test_connect_unreachable_broker_fails() {
        // Nothing listens on the discard port of loopback
        let settings = MqttSettings::from_config(&mqtt_config("tcp://127.0.0.1:9"), "AABBCC").unwrap();
        let result = MqttChannel::connect(&settings).await;
        assert!(matches!(result, Err(BridgeError::Connect(_))));
    }
}
