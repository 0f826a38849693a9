//! Radio metadata handed over by the device engine with every uplink

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::RadioConfig;

/// 1980-01-06T00:00:00Z as a Unix timestamp
const GPS_EPOCH_UNIX_SECS: i64 = 315_964_800;

/// GPS-UTC offset in force since 2017-01-01
///
/// Applied as a constant, so instants before the last leap second come out
/// a few seconds ahead of true GPS time.
const GPS_UTC_LEAP_SECONDS: i64 = 18;

/// Reception metadata for one uplink frame
#[derive(Debug, Clone, PartialEq)]
pub struct RadioUplinkMetadata {
    /// Concentrator IF channel
    pub channel: u32,
    pub rf_chain: u32,
    /// Frequency in Hz
    pub frequency: u64,
    pub spreading_factor: u32,
    /// Bandwidth in kHz
    pub bandwidth: u32,
    /// LoRa coding rate (e.g., "4/5")
    pub code_rate: String,
    /// RSSI in dBm
    pub rssi: i32,
    pub lora_snr: f64,
    pub time_since_gps_epoch: Duration,
}

impl RadioUplinkMetadata {
    /// LoRa datarate identifier (e.g., "SF7BW125")
    pub fn data_rate(&self) -> String {
        format!("SF{}BW{}", self.spreading_factor, self.bandwidth)
    }

    /// Frequency in MHz
    pub fn frequency_mhz(&self) -> f64 {
        self.frequency as f64 / 1_000_000.0
    }

    /// Milliseconds since the GPS epoch
    pub fn gps_millis(&self) -> u64 {
        self.time_since_gps_epoch.as_millis() as u64
    }

    /// Internal concentrator counter: microseconds, wrapping at 32 bits
    ///
    /// There is no real concentrator behind the bridge, so GPS-epoch time
    /// stands in for its free-running clock. Only differences between
    /// timestamps are meaningful.
    pub fn concentrator_timestamp(&self) -> u32 {
        (self.time_since_gps_epoch.as_micros() & 0xFFFF_FFFF) as u32
    }

    /// Build metadata from the configured radio parameters, stamped with `now`
    pub fn from_config(radio: &RadioConfig, now: DateTime<Utc>) -> Self {
        Self {
            channel: radio.channel,
            rf_chain: radio.rf_chain,
            frequency: radio.frequency,
            spreading_factor: radio.spreading_factor,
            bandwidth: radio.bandwidth,
            code_rate: radio.code_rate.clone(),
            rssi: radio.rssi,
            lora_snr: radio.lora_snr,
            time_since_gps_epoch: time_since_gps_epoch(now),
        }
    }
}

/// GPS time of `now`: time elapsed since the GPS epoch (1980-01-06T00:00:00Z)
/// plus the current GPS-UTC leap second offset
pub fn time_since_gps_epoch(now: DateTime<Utc>) -> Duration {
    let offset_micros = (GPS_EPOCH_UNIX_SECS - GPS_UTC_LEAP_SECONDS) * 1_000_000;
    let micros = now.timestamp_micros() - offset_micros;
    Duration::from_micros(u64::try_from(micros).unwrap_or(0))
}
