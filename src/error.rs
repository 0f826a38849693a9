//! Error types shared by the bridge and its transports

use std::io;

use thiserror::Error;

/// Bad configuration detected before any socket or broker connection is opened
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("network server UDP port must be a number, got {0:?}")]
    InvalidPort(String),

    #[error("gateway MAC must be 16 hex characters, got {0:?}")]
    InvalidMac(String),

    #[error("topic template {0:?} must contain exactly one %s placeholder")]
    InvalidTopicTemplate(String),

    #[error("bad network server IP {0:?}")]
    InvalidServerAddress(String),

    #[error("bad MQTT broker URI {0:?}")]
    InvalidBrokerUri(String),

    #[error("failed to load config file: {0}")]
    Load(String),
}

/// Malformed datagram or JSON body; the frame is dropped
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported protocol version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("unexpected packet type: 0x{0:02x}")]
    UnexpectedPacket(u8),

    #[error("invalid UTF-8 in JSON body: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("PULL_RESP body has no txpk")]
    MissingTxpk,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("txpk size {declared} does not match payload length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
}

/// Errors surfaced by [`crate::bridge::Bridge`] and the transports
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("failed to send datagram: {0}")]
    Send(#[from] io::Error),

    #[error("MQTT request failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("no transport connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
