//! Gateway bridge: one live transport between the device engine and the
//! network server
//!
//! Uplinks go out through whichever transport is connected. Downlinks from
//! either transport land on a bounded queue owned by the bridge, which the
//! device engine drains at its own pace.

use rumqttc::QoS;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::mqtt::frame::{self, UplinkFrame};
use crate::mqtt::{MqttChannel, MqttSettings};
use crate::radio::RadioUplinkMetadata;
use crate::udp::protocol::GatewayMac;
use crate::udp::{ForwarderSettings, UdpForwarderClient};

/// How long an MQTT disconnect waits for in-flight traffic
pub const MQTT_DISCONNECT_GRACE: Duration = Duration::from_millis(200);

pub const DEFAULT_DOWNLINK_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Mqtt,
    UdpForwarder,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Mqtt => write!(f, "mqtt"),
            TransportKind::UdpForwarder => write!(f, "udp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(TransportKind::Mqtt),
            "udp" | "forwarder" => Ok(TransportKind::UdpForwarder),
            other => Err(format!("unknown transport {:?} (expected mqtt or udp)", other)),
        }
    }
}

/// A physical payload received from the network server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    pub transport: TransportKind,
    pub payload: Vec<u8>,
}

/// Device engine callback for downlinks
pub trait DownlinkHandler: Send + Sync + 'static {
    fn on_incoming_downlink(&self, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> DownlinkHandler for F
where
    F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_incoming_downlink(&self, payload: &[u8]) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Drain the downlink queue into `handler` until every sender is gone
pub fn spawn_downlink_dispatcher<H: DownlinkHandler>(
    mut downlinks: mpsc::Receiver<Downlink>,
    handler: H,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(downlink) = downlinks.recv().await {
            debug!(
                "Dispatching {} byte downlink from {}",
                downlink.payload.len(),
                downlink.transport
            );
            if let Err(e) = handler.on_incoming_downlink(&downlink.payload) {
                warn!("Downlink handler failed: {}", e);
            }
        }
        debug!("Downlink queue closed");
    })
}

struct MqttLink {
    channel: MqttChannel,
    uplink_topic: String,
    gateway_id: String,
}

enum ActiveTransport {
    None,
    Mqtt(MqttLink),
    UdpForwarder(UdpForwarderClient),
}

pub struct Bridge {
    active: ActiveTransport,
    downlinks: mpsc::Sender<Downlink>,
}

impl Bridge {
    /// Create a disconnected bridge and the receiving end of its downlink queue
    pub fn new(queue_capacity: usize) -> (Self, mpsc::Receiver<Downlink>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        (
            Self {
                active: ActiveTransport::None,
                downlinks: tx,
            },
            rx,
        )
    }

    /// Connect `kind` using a fresh copy of the relevant config sections
    ///
    /// The config is validated before anything else happens, so a bad
    /// config leaves the current transport untouched. Otherwise the current
    /// transport is disconnected first; if the new one then fails to come
    /// up, the bridge is left disconnected.
    pub async fn connect(&mut self, kind: TransportKind, config: &Config) -> Result<()> {
        let gateway_mac: GatewayMac = config.gateway.mac.parse()?;
        let mac_text = config.gateway.mac.trim();

        match kind {
            TransportKind::Mqtt => {
                let settings = MqttSettings::from_config(&config.mqtt, mac_text)?;
                self.disconnect().await;

                let channel = MqttChannel::connect(&settings).await?;
                let downlinks = self.downlinks.clone();
                channel
                    .subscribe(
                        &settings.downlink_topic,
                        QoS::AtLeastOnce,
                        Arc::new(move |topic: &str, message: &[u8]| {
                            forward_mqtt_downlink(&downlinks, topic, message)
                        }),
                    )
                    .await;

                self.active = ActiveTransport::Mqtt(MqttLink {
                    channel,
                    uplink_topic: settings.uplink_topic,
                    gateway_id: gateway_mac.to_string(),
                });
            }
            TransportKind::UdpForwarder => {
                let settings = ForwarderSettings::from_config(&config.forwarder)?;
                self.disconnect().await;

                let mut client = UdpForwarderClient::new(settings, gateway_mac);
                client.connect(self.downlinks.clone()).await?;
                self.active = ActiveTransport::UdpForwarder(client);
            }
        }

        info!("Bridge connected over {}", kind);
        Ok(())
    }

    /// Tear down the active transport, if any; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        match std::mem::replace(&mut self.active, ActiveTransport::None) {
            ActiveTransport::None => {}
            ActiveTransport::Mqtt(mut link) => {
                link.channel.disconnect(MQTT_DISCONNECT_GRACE).await;
                info!("Bridge disconnected from mqtt");
            }
            ActiveTransport::UdpForwarder(mut client) => {
                client.disconnect().await;
                info!("Bridge disconnected from udp");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        match &self.active {
            ActiveTransport::None => false,
            ActiveTransport::Mqtt(link) => link.channel.is_connected(),
            ActiveTransport::UdpForwarder(client) => client.is_connected(),
        }
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        match &self.active {
            ActiveTransport::None => None,
            ActiveTransport::Mqtt(_) => Some(TransportKind::Mqtt),
            ActiveTransport::UdpForwarder(_) => Some(TransportKind::UdpForwarder),
        }
    }

    /// Local address of the UDP listener while the forwarder is active
    pub fn udp_local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.active {
            ActiveTransport::UdpForwarder(client) => client.local_addr(),
            _ => None,
        }
    }

    /// Relay one uplink through the active transport
    pub async fn send_uplink(&self, payload: &[u8], meta: &RadioUplinkMetadata) -> Result<()> {
        match &self.active {
            ActiveTransport::None => Err(BridgeError::NotConnected),
            ActiveTransport::Mqtt(link) => {
                let frame = UplinkFrame::new(payload, &link.gateway_id, meta, chrono::Utc::now());
                let json = serde_json::to_vec(&frame).map_err(crate::error::CodecError::from)?;
                debug!("Marshalled upstream JSON {}", String::from_utf8_lossy(&json));
                link.channel
                    .publish(&link.uplink_topic, json, QoS::AtLeastOnce)
                    .await
            }
            ActiveTransport::UdpForwarder(client) => client.send_uplink(payload, meta).await,
        }
    }
}

fn forward_mqtt_downlink(downlinks: &mpsc::Sender<Downlink>, topic: &str, message: &[u8]) {
    let payload = match frame::downlink_payload(message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Dropping downlink on {}: {}", topic, e);
            return;
        }
    };

    let downlink = Downlink {
        transport: TransportKind::Mqtt,
        payload,
    };
    match downlinks.try_send(downlink) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Downlink queue full, dropping message on {}", topic),
        Err(TrySendError::Closed(_)) => error!("Downlink queue closed, dropping message on {}", topic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use std::sync::Mutex;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("mqtt".parse::<TransportKind>().unwrap(), TransportKind::Mqtt);
        assert_eq!("UDP".parse::<TransportKind>().unwrap(), TransportKind::UdpForwarder);
        assert_eq!(
            "forwarder".parse::<TransportKind>().unwrap(),
            TransportKind::UdpForwarder
        );
        assert!("serial".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::UdpForwarder.to_string(), "udp");
    }

    #[tokio::test]
    async fn test_send_without_transport() {
        let (bridge, _rx) = Bridge::new(4);
        let meta = RadioUplinkMetadata::from_config(&Default::default(), chrono::Utc::now());
        assert!(matches!(
            bridge.send_uplink(&[0x40], &meta).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(!bridge.is_connected());
        assert!(bridge.active_transport().is_none());
    }

    #[tokio::test]
    async fn test_config_errors_abort_connect() {
        let (mut bridge, _rx) = Bridge::new(4);

        let mut config = Config::default();
        config.forwarder.port = "not-a-port".to_string();
        let result = bridge.connect(TransportKind::UdpForwarder, &config).await;
        assert!(matches!(
            result,
            Err(BridgeError::Config(ConfigError::InvalidPort(_)))
        ));
        assert!(bridge.active_transport().is_none());

        let mut config = Config::default();
        config.gateway.mac = "XYZ".to_string();
        let result = bridge.connect(TransportKind::Mqtt, &config).await;
        assert!(matches!(
            result,
            Err(BridgeError::Config(ConfigError::InvalidMac(_)))
        ));

        let mut config = Config::default();
        config.mqtt.downlink_topic = "gateway/down".to_string();
        let result = bridge.connect(TransportKind::Mqtt, &config).await;
        assert!(matches!(
            result,
            Err(BridgeError::Config(ConfigError::InvalidTopicTemplate(_)))
        ));
        assert!(!bridge.is_connected());
    }

    #[test]
    fn test_forward_mqtt_downlink() {
        let (tx, mut rx) = mpsc::channel(1);
        forward_mqtt_downlink(&tx, "gateway/AA/command/down", br#"{"phyPayload":"YAEC"}"#);
        // Queue full: dropped
        forward_mqtt_downlink(&tx, "gateway/AA/command/down", &[0x01]);

        let downlink = rx.try_recv().unwrap();
        assert_eq!(downlink.transport, TransportKind::Mqtt);
        assert_eq!(downlink.payload, vec![0x60, 0x01, 0x02]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_invokes_handler() {
        let (tx, rx) = mpsc::channel(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let task = spawn_downlink_dispatcher(rx, move |payload: &[u8]| -> anyhow::Result<()> {
            if payload.is_empty() {
                anyhow::bail!("empty downlink");
            }
            sink.lock().unwrap().push(payload.to_vec());
            Ok(())
        });

        for payload in [vec![0x60], vec![], vec![0xA0, 0x01]] {
            tx.send(Downlink {
                transport: TransportKind::UdpForwarder,
                payload,
            })
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![vec![0x60], vec![0xA0, 0x01]]);
    }
}
