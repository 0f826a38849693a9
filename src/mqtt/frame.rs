//! JSON frames exchanged with a gateway-bridge style network server
//!
//! Uplinks are published as `{"phyPayload", "rxInfo", "txInfo"}`; downlink
//! commands carry the physical payload under `phyPayload`.

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::radio::RadioUplinkMetadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkFrame {
    /// Base64 encoded PHYPayload
    pub phy_payload: String,
    pub rx_info: UplinkRxInfo,
    pub tx_info: UplinkTxInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkRxInfo {
    pub gateway_id: String,
    pub time: String,
    /// Protobuf JSON duration, e.g. "1300000000.250s"
    pub time_since_gps_epoch: String,
    pub rssi: i32,
    pub lora_snr: f64,
    pub channel: u32,
    pub rf_chain: u32,
    pub crc_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkTxInfo {
    /// Hz
    pub frequency: u64,
    pub modulation: String,
    pub lora_modulation_info: LoraModulationInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraModulationInfo {
    /// kHz
    pub bandwidth: u32,
    pub spreading_factor: u32,
    pub code_rate: String,
    pub polarization_inversion: bool,
}

impl UplinkFrame {
    pub fn new(
        payload: &[u8],
        gateway_id: &str,
        meta: &RadioUplinkMetadata,
        received_at: DateTime<Utc>,
    ) -> Self {
        let gps = meta.time_since_gps_epoch;
        Self {
            phy_payload: base64::engine::general_purpose::STANDARD.encode(payload),
            rx_info: UplinkRxInfo {
                gateway_id: gateway_id.to_lowercase(),
                time: received_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                time_since_gps_epoch: format!("{}.{:03}s", gps.as_secs(), gps.subsec_millis()),
                rssi: meta.rssi,
                lora_snr: meta.lora_snr,
                channel: meta.channel,
                rf_chain: meta.rf_chain,
                crc_status: "CRC_OK".to_string(),
            },
            tx_info: UplinkTxInfo {
                frequency: meta.frequency,
                modulation: "LORA".to_string(),
                lora_modulation_info: LoraModulationInfo {
                    bandwidth: meta.bandwidth,
                    spreading_factor: meta.spreading_factor,
                    code_rate: meta.code_rate.clone(),
                    polarization_inversion: false,
                },
            },
        }
    }
}

/// Downlink command body; only the payload is used
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkFrame {
    pub phy_payload: String,
}

/// Extract the physical payload from a downlink message
///
/// A JSON object with `phyPayload` is unwrapped; any other body is taken
/// as the raw payload.
pub fn downlink_payload(message: &[u8]) -> Result<Vec<u8>, CodecError> {
    match serde_json::from_slice::<DownlinkFrame>(message) {
        Ok(frame) => Ok(base64::engine::general_purpose::STANDARD.decode(frame.phy_payload)?),
        Err(_) => Ok(message.to_vec()),
    }
}
