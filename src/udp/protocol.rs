//! Semtech UDP Packet Forwarder Protocol (GWMP), gateway side
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The protocol uses a simple binary header followed by JSON payload.
//! All multi-byte integers are big-endian (network byte order).
//!
//! Everything here is a pure function over its inputs; no buffers are
//! shared between calls, so the codec can be used from any number of tasks.

use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CodecError, ConfigError};
use crate::radio::RadioUplinkMetadata;

/// Protocol version (always 0x02)
pub const PROTOCOL_VERSION: u8 = 0x02;

/// version + token + identifier
pub const HEADER_LEN: usize = 4;

/// CRC-ok sentinel reported for every simulated uplink
pub const CRC_OK: i32 = 1;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            other => Err(other),
        }
    }
}

/// Gateway identifier (EUI-64, 8 bytes), written as 16 hex characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GatewayMac(pub [u8; 8]);

impl FromStr for GatewayMac {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 8];
        hex::decode_to_slice(s.trim(), &mut mac)
            .map_err(|_| ConfigError::InvalidMac(s.to_string()))?;
        Ok(GatewayMac(mac))
    }
}

impl fmt::Display for GatewayMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// Rxpk (received packet) as reported upstream by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception (RFC3339)
    pub time: String,
    /// GPS time (milliseconds since GPS epoch)
    pub tmms: u64,
    /// Concentrator timestamp (microseconds, 32-bit wrapping)
    pub tmst: u32,
    /// Concentrator IF channel
    pub chan: u32,
    /// RF chain
    pub rfch: u32,
    /// Frequency in MHz
    pub freq: f64,
    /// CRC status
    pub stat: i32,
    /// Modulation (LORA or FSK)
    pub modu: String,
    /// LoRa datarate identifier (e.g., "SF7BW125")
    pub datr: String,
    /// LoRa coding rate (e.g., "4/5")
    pub codr: String,
    /// RSSI in dBm
    pub rssi: i32,
    /// LoRa signal-to-noise ratio
    pub lsnr: f64,
    /// RF packet payload size in bytes
    pub size: u32,
    /// Base64 encoded RF packet payload
    pub data: String,
}

impl Rxpk {
    /// Describe one simulated reception of `payload`
    pub fn new(payload: &[u8], meta: &RadioUplinkMetadata, received_at: DateTime<Utc>) -> Self {
        Self {
            time: received_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            tmms: meta.gps_millis(),
            tmst: meta.concentrator_timestamp(),
            chan: meta.channel,
            rfch: meta.rf_chain,
            freq: meta.frequency_mhz(),
            stat: CRC_OK,
            modu: "LORA".to_string(),
            datr: meta.data_rate(),
            codr: meta.code_rate.clone(),
            rssi: meta.rssi,
            lsnr: meta.lora_snr,
            size: payload.len() as u32,
            data: base64::engine::general_purpose::STANDARD.encode(payload),
        }
    }

    /// Decode the base64 `data` field
    pub fn payload(&self) -> Result<Vec<u8>, CodecError> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.data)?)
    }
}

/// Push data JSON body: always exactly one rxpk when built by [`encode_uplink_frame`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Vec<Rxpk>,
}

/// LoRa datarate is a string ("SF7BW125"), FSK datarate a number of bits/s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataRate {
    Lora(String),
    Fsk(u32),
}

/// Txpk (packet to transmit) carried by PULL_RESP
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring tmst/tmms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// Frequency in MHz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u32>,
    /// TX power in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powe: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datr: Option<DataRate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// Polarization inversion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    /// Preamble length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prea: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Base64 encoded RF packet payload
    pub data: String,
    /// Disable the physical layer CRC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
}

/// PULL_RESP JSON body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub txpk: Option<Txpk>,
}

/// A datagram received on the listener socket
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDatagram {
    /// PULL_RESP with its decoded physical payload
    Downlink {
        random_token: u16,
        txpk: Txpk,
        payload: Vec<u8>,
    },
    /// Anything else (acks, stray frames); not delivered anywhere
    Other { random_token: u16, identifier: u8 },
}

impl InboundDatagram {
    pub fn is_downlink(&self) -> bool {
        matches!(self, InboundDatagram::Downlink { .. })
    }

    pub fn into_payload(self) -> Option<Vec<u8>> {
        match self {
            InboundDatagram::Downlink { payload, .. } => Some(payload),
            InboundDatagram::Other { .. } => None,
        }
    }
}

fn put_header(buf: &mut BytesMut, random_token: u16, packet_type: PacketType) {
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(random_token);
    buf.put_u8(packet_type as u8);
}

/// Build a PUSH_DATA datagram: header, gateway MAC, JSON body
pub fn encode_push_data(
    random_token: u16,
    gateway_mac: &GatewayMac,
    body: &PushDataPayload,
) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(body)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + gateway_mac.0.len() + json.len());
    put_header(&mut buf, random_token, PacketType::PushData);
    buf.put_slice(&gateway_mac.0);
    buf.put_slice(&json);
    Ok(buf.to_vec())
}

/// Encode one uplink as a PUSH_DATA datagram carrying a single rxpk
///
/// The random token only gives the datagram its protocol shape; acks
/// are never correlated with it.
pub fn encode_uplink_frame(
    payload: &[u8],
    gateway_mac: &GatewayMac,
    meta: &RadioUplinkMetadata,
) -> Result<Vec<u8>, CodecError> {
    let body = PushDataPayload {
        rxpk: vec![Rxpk::new(payload, meta, Utc::now())],
    };
    encode_push_data(rand::random(), gateway_mac, &body)
}

/// Build a PULL_RESP datagram (network server side)
pub fn encode_pull_resp(random_token: u16, body: &PullResponse) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(body)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + json.len());
    put_header(&mut buf, random_token, PacketType::PullResp);
    buf.put_slice(&json);
    Ok(buf.to_vec())
}

/// Build a PUSH_ACK response (network server side)
pub fn push_ack(random_token: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, random_token, PacketType::PushAck);
    buf.to_vec()
}

/// Decode a datagram received from the network server
///
/// Discrimination is on the identifier byte alone: only PULL_RESP is a
/// downlink, anything else is reported as [`InboundDatagram::Other`].
pub fn decode_inbound_datagram(data: &[u8]) -> Result<InboundDatagram, CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::TooShort(data.len()));
    }

    let mut buf = data;
    let version = buf.get_u8();
    let random_token = buf.get_u16();
    let identifier = buf.get_u8();

    if PacketType::try_from(identifier) != Ok(PacketType::PullResp) {
        return Ok(InboundDatagram::Other {
            random_token,
            identifier,
        });
    }
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let json = String::from_utf8(buf.to_vec())?;
    let response: PullResponse = serde_json::from_str(&json)?;
    let txpk = response.txpk.ok_or(CodecError::MissingTxpk)?;

    let payload = base64::engine::general_purpose::STANDARD.decode(&txpk.data)?;
    if let Some(declared) = txpk.size {
        if declared as usize != payload.len() {
            return Err(CodecError::SizeMismatch {
                declared: declared as usize,
                actual: payload.len(),
            });
        }
    }

    Ok(InboundDatagram::Downlink {
        random_token,
        txpk,
        payload,
    })
}

/// Parse a PUSH_DATA datagram (network server side)
pub fn decode_push_data(data: &[u8]) -> Result<(u16, GatewayMac, PushDataPayload), CodecError> {
    if data.len() < HEADER_LEN + 8 {
        return Err(CodecError::TooShort(data.len()));
    }

    let mut buf = data;
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let random_token = buf.get_u16();
    let identifier = buf.get_u8();
    if PacketType::try_from(identifier) != Ok(PacketType::PushData) {
        return Err(CodecError::UnexpectedPacket(identifier));
    }

    let mut mac = [0u8; 8];
    buf.copy_to_slice(&mut mac);

    let json = String::from_utf8(buf.to_vec())?;
    let body: PushDataPayload = serde_json::from_str(&json)?;
    Ok((random_token, GatewayMac(mac), body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meta(spreading_factor: u32, bandwidth: u32) -> RadioUplinkMetadata {
        RadioUplinkMetadata {
            channel: 1,
            rf_chain: 0,
            frequency: 868_100_000,
            spreading_factor,
            bandwidth,
            code_rate: "4/5".to_string(),
            rssi: -60,
            lora_snr: 9.25,
            time_since_gps_epoch: Duration::from_secs(1_300_000_000),
        }
    }

    fn mac() -> GatewayMac {
        "0011223344556677".parse().unwrap()
    }

    fn pull_resp(token: u16, txpk: &str) -> Vec<u8> {
        let mut data = vec![PROTOCOL_VERSION, (token >> 8) as u8, token as u8, 0x03];
        data.extend_from_slice(format!(r#"{{"txpk":{}}}"#, txpk).as_bytes());
        data
    }

    #[test]
    fn test_mac_parse() {
        assert_eq!(mac().0, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(mac().to_string(), "0011223344556677");
        assert!("DEADBEEF".parse::<GatewayMac>().is_err());
        assert!("ZZ11223344556677".parse::<GatewayMac>().is_err());
        assert!("001122334455667788".parse::<GatewayMac>().is_err());
    }

    #[test]
    fn test_encode_uplink_frame_layout() {
        let payload = [0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00];
        let datagram = encode_uplink_frame(&payload, &mac(), &meta(7, 125)).unwrap();

        assert_eq!(datagram[0], PROTOCOL_VERSION);
        assert_eq!(datagram[3], PacketType::PushData as u8);
        assert_eq!(&datagram[4..12], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);

        let (_, gateway, body) = decode_push_data(&datagram).unwrap();
        assert_eq!(gateway, mac());
        assert_eq!(body.rxpk.len(), 1);

        let rxpk = &body.rxpk[0];
        assert_eq!(rxpk.datr, "SF7BW125");
        assert_eq!(rxpk.stat, 1);
        assert_eq!(rxpk.modu, "LORA");
        assert_eq!(rxpk.codr, "4/5");
        assert_eq!(rxpk.chan, 1);
        assert_eq!(rxpk.rssi, -60);
        assert_eq!(rxpk.size, payload.len() as u32);
        assert_eq!(rxpk.tmms, 1_300_000_000_000);
        assert!((rxpk.freq - 868.1).abs() < 1e-9);
        assert_eq!(rxpk.payload().unwrap(), payload);
    }

    #[test]
    fn test_datr_follows_metadata() {
        for (sf, bw) in [(7, 125), (9, 250), (12, 500)] {
            let datagram = encode_uplink_frame(&[0x01], &mac(), &meta(sf, bw)).unwrap();
            let (_, _, body) = decode_push_data(&datagram).unwrap();
            assert_eq!(body.rxpk[0].datr, format!("SF{}BW{}", sf, bw));
        }
    }

    #[test]
    fn test_payload_survives_base64_for_all_lengths() {
        let meta = meta(7, 125);
        for len in 0..=250usize {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let rxpk = Rxpk::new(&payload, &meta, Utc::now());
            assert_eq!(rxpk.payload().unwrap(), payload, "length {}", len);
        }
    }

    #[test]
    fn test_rxpk_time_is_rfc3339() {
        let rxpk = Rxpk::new(&[], &meta(7, 125), Utc::now());
        assert!(DateTime::parse_from_rfc3339(&rxpk.time).is_ok());
    }

    #[test]
    fn test_decode_pull_resp() {
        let datagram = pull_resp(
            0xBEEF,
            r#"{"imme":true,"freq":869.525,"rfch":0,"powe":14,"modu":"LORA","datr":"SF9BW125","codr":"4/5","ipol":true,"size":3,"data":"AQID"}"#,
        );

        match decode_inbound_datagram(&datagram).unwrap() {
            InboundDatagram::Downlink {
                random_token,
                txpk,
                payload,
            } => {
                assert_eq!(random_token, 0xBEEF);
                assert_eq!(payload, vec![0x01, 0x02, 0x03]);
                assert_eq!(txpk.datr, Some(DataRate::Lora("SF9BW125".to_string())));
                assert_eq!(txpk.powe, Some(14));
                assert_eq!(txpk.imme, Some(true));
            }
            other => panic!("Expected downlink, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_fsk_datr() {
        let datagram = pull_resp(1, r#"{"modu":"FSK","datr":50000,"data":"AA=="}"#);
        let decoded = decode_inbound_datagram(&datagram).unwrap();
        match decoded {
            InboundDatagram::Downlink { txpk, .. } => {
                assert_eq!(txpk.datr, Some(DataRate::Fsk(50000)))
            }
            other => panic!("Expected downlink, got {:?}", other),
        }
    }

    #[test]
    fn test_non_pull_resp_is_not_downlink() {
        for id in [0x00u8, 0x01, 0x02, 0x04, 0x05, 0x7F, 0xFF] {
            let decoded = decode_inbound_datagram(&[0x02, 0x12, 0x34, id]).unwrap();
            assert!(!decoded.is_downlink());
            assert_eq!(
                decoded,
                InboundDatagram::Other {
                    random_token: 0x1234,
                    identifier: id
                }
            );
        }
        // Version byte is irrelevant when the identifier is not PULL_RESP
        assert!(!decode_inbound_datagram(&[0x01, 0, 0, 0x01]).unwrap().is_downlink());
    }

    #[test]
    fn test_short_input_fails() {
        for len in 0..HEADER_LEN {
            let data = vec![0x03; len];
            assert!(matches!(
                decode_inbound_datagram(&data),
                Err(CodecError::TooShort(n)) if n == len
            ));
        }
    }

    #[test]
    fn test_malformed_pull_resp_fails() {
        // No body
        assert!(matches!(
            decode_inbound_datagram(&[0x02, 0, 0, 0x03]),
            Err(CodecError::Json(_))
        ));
        // Missing txpk
        let mut data = vec![0x02, 0, 0, 0x03];
        data.extend_from_slice(b"{}");
        assert!(matches!(
            decode_inbound_datagram(&data),
            Err(CodecError::MissingTxpk)
        ));
        // Bad base64
        assert!(matches!(
            decode_inbound_datagram(&pull_resp(0, r#"{"data":"@@@"}"#)),
            Err(CodecError::Base64(_))
        ));
        // Declared size disagrees with payload
        assert!(matches!(
            decode_inbound_datagram(&pull_resp(0, r#"{"size":5,"data":"AQID"}"#)),
            Err(CodecError::SizeMismatch {
                declared: 5,
                actual: 3
            })
        ));
        // Invalid UTF-8
        assert!(matches!(
            decode_inbound_datagram(&[0x02, 0, 0, 0x03, 0xFF, 0xFE]),
            Err(CodecError::InvalidUtf8(_))
        ));
        // Wrong version on a PULL_RESP
        assert!(matches!(
            decode_inbound_datagram(&[0x01, 0, 0, 0x03]),
            Err(CodecError::UnsupportedVersion(0x01))
        ));
    }

    #[test]
    fn test_pull_resp_encoder_matches_decoder() {
        let body = PullResponse {
            txpk: Some(Txpk {
                imme: Some(true),
                size: Some(2),
                data: "qrs=".to_string(),
                ..Default::default()
            }),
        };
        let datagram = encode_pull_resp(7, &body).unwrap();
        assert_eq!(decode_inbound_datagram(&datagram).unwrap().into_payload(), Some(vec![0xAA, 0xBB]));
    }

    #[test]
    fn test_push_data_decoder_rejects_other_packets() {
        let mut pull_data = vec![0x02, 0x00, 0x01, 0x02];
        pull_data.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert!(matches!(
            decode_push_data(&pull_data),
            Err(CodecError::UnexpectedPacket(0x02))
        ));

        let mut tx_ack = pull_data.clone();
        tx_ack[3] = 0x05;
        tx_ack.extend_from_slice(br#"{"rxpk":[]}"#);
        assert!(matches!(
            decode_push_data(&tx_ack),
            Err(CodecError::UnexpectedPacket(0x05))
        ));

        pull_data[3] = 0x42;
        assert!(matches!(
            decode_push_data(&pull_data),
            Err(CodecError::UnexpectedPacket(0x42))
        ));
    }

    #[test]
    fn test_push_ack() {
        assert_eq!(push_ack(0x1234), vec![0x02, 0x12, 0x34, 0x01]);
    }
}
