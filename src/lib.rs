//! Gateway bridge for a LoRaWAN device simulator
//!
//! Relays uplinks from the simulated devices to a network server, and the
//! server's downlinks back, over either MQTT or the Semtech UDP packet
//! forwarder protocol.

pub mod bridge;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod radio;
pub mod udp;

pub use bridge::{spawn_downlink_dispatcher, Bridge, Downlink, DownlinkHandler, TransportKind};
pub use config::Config;
pub use error::{BridgeError, CodecError, ConfigError};
pub use radio::RadioUplinkMetadata;
