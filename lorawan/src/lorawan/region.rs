use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// LoRa modulation of a data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRate {
    SF12BW125,
    SF11BW125,
    SF10BW125,
    SF9BW125,
    SF8BW125,
    SF7BW125,
    SF7BW250,
    SF12BW500,
    SF11BW500,
    SF10BW500,
    SF9BW500,
    SF8BW500,
    SF7BW500,
}

impl DataRate {
    /// Get spreading factor
    pub fn spreading_factor(&self) -> u8 {
        match self {
            DataRate::SF12BW125 | DataRate::SF12BW500 => 12,
            DataRate::SF11BW125 | DataRate::SF11BW500 => 11,
            DataRate::SF10BW125 | DataRate::SF10BW500 => 10,
            DataRate::SF9BW125 | DataRate::SF9BW500 => 9,
            DataRate::SF8BW125 | DataRate::SF8BW500 => 8,
            DataRate::SF7BW125 | DataRate::SF7BW250 | DataRate::SF7BW500 => 7,
        }
    }

    /// Get bandwidth in Hz
    pub fn bandwidth(&self) -> u32 {
        match self {
            DataRate::SF7BW250 => 250_000,
            DataRate::SF12BW500
            | DataRate::SF11BW500
            | DataRate::SF10BW500
            | DataRate::SF9BW500
            | DataRate::SF8BW500
            | DataRate::SF7BW500 => 500_000,
            _ => 125_000,
        }
    }

    /// Demodulation floor in dB, the SNR a receiver needs at this spreading factor
    pub fn required_snr(&self) -> f32 {
        match self.spreading_factor() {
            12 => -20.0,
            11 => -17.5,
            10 => -15.0,
            9 => -12.5,
            8 => -10.0,
            _ => -7.5,
        }
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SF{}BW{}", self.spreading_factor(), self.bandwidth() / 1000)
    }
}

/// Error for an unrecognised `datr` string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data rate {0:?}")]
pub struct UnknownDataRate(String);

impl FromStr for DataRate {
    type Err = UnknownDataRate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [DataRate; 13] = [
            DataRate::SF12BW125,
            DataRate::SF11BW125,
            DataRate::SF10BW125,
            DataRate::SF9BW125,
            DataRate::SF8BW125,
            DataRate::SF7BW125,
            DataRate::SF7BW250,
            DataRate::SF12BW500,
            DataRate::SF11BW500,
            DataRate::SF10BW500,
            DataRate::SF9BW500,
            DataRate::SF8BW500,
            DataRate::SF7BW500,
        ];
        let wanted = s.trim().to_ascii_uppercase();
        ALL.into_iter()
            .find(|dr| dr.to_string() == wanted)
            .ok_or_else(|| UnknownDataRate(s.to_string()))
    }
}

/// Regional plan identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegionId {
    #[default]
    EU868,
    US915,
}

impl RegionId {
    /// Regional plan for this id
    pub fn plan(&self) -> &'static dyn Region {
        match self {
            RegionId::EU868 => &EU868,
            RegionId::US915 => &US915,
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionId::EU868 => f.write_str("EU868"),
            RegionId::US915 => f.write_str("US915"),
        }
    }
}

/// Regional parameters consulted by the network server
pub trait Region: Send + Sync {
    /// Region identifier
    fn id(&self) -> RegionId;

    /// Data rate index to modulation
    fn data_rate(&self, index: u8) -> Option<DataRate>;

    /// Modulation to uplink data rate index
    fn uplink_index(&self, data_rate: DataRate) -> Option<u8>;

    /// Maximum MACPayload size (M) for a data rate index
    fn max_payload_size(&self, index: u8) -> Option<usize>;

    /// Highest data rate index ADR may assign
    fn max_adr_data_rate(&self) -> u8;

    /// Highest TX power index (lowest power)
    fn max_tx_power_index(&self) -> u8;

    /// ChMask / ChMaskCntl pair sent with ADR requests, keeping all channels enabled
    fn adr_channel_mask(&self) -> (u16, u8);

    /// RX1 downlink data rate index for an uplink index and offset
    fn rx1_data_rate(&self, uplink_index: u8, offset: u8) -> Option<u8>;

    /// RX1 downlink frequency for an uplink frequency
    fn rx1_frequency(&self, uplink_frequency: u32) -> u32;

    /// Default RX2 parameters (frequency, data rate index)
    fn rx2_default(&self) -> (u32, u8);
}

/// EU863-870 regional plan
#[derive(Debug, Clone, Copy, Default)]
pub struct Eu868;

/// EU868 regional plan instance
pub const EU868: Eu868 = Eu868;

impl Region for Eu868 {
    fn id(&self) -> RegionId {
        RegionId::EU868
    }

    fn data_rate(&self, index: u8) -> Option<DataRate> {
        match index {
            0 => Some(DataRate::SF12BW125),
            1 => Some(DataRate::SF11BW125),
            2 => Some(DataRate::SF10BW125),
            3 => Some(DataRate::SF9BW125),
            4 => Some(DataRate::SF8BW125),
            5 => Some(DataRate::SF7BW125),
            6 => Some(DataRate::SF7BW250),
            _ => None,
        }
    }

    fn uplink_index(&self, data_rate: DataRate) -> Option<u8> {
        (0..=6).find(|i| self.data_rate(*i) == Some(data_rate))
    }

    fn max_payload_size(&self, index: u8) -> Option<usize> {
        match index {
            0..=2 => Some(59),
            3 => Some(123),
            4..=7 => Some(230),
            _ => None,
        }
    }

    fn max_adr_data_rate(&self) -> u8 {
        5
    }

    fn max_tx_power_index(&self) -> u8 {
        7
    }

    fn adr_channel_mask(&self) -> (u16, u8) {
        (0x0000, 6)
    }

    fn rx1_data_rate(&self, uplink_index: u8, offset: u8) -> Option<u8> {
        if uplink_index > 7 || offset > 5 {
            return None;
        }
        Some(uplink_index.saturating_sub(offset))
    }

    fn rx1_frequency(&self, uplink_frequency: u32) -> u32 {
        uplink_frequency
    }

    fn rx2_default(&self) -> (u32, u8) {
        (869_525_000, 0)
    }
}

/// US902-928 regional plan
#[derive(Debug, Clone, Copy, Default)]
pub struct Us915;

/// US915 regional plan instance
pub const US915: Us915 = Us915;

impl Region for Us915 {
    fn id(&self) -> RegionId {
        RegionId::US915
    }

    fn data_rate(&self, index: u8) -> Option<DataRate> {
        match index {
            0 => Some(DataRate::SF10BW125),
            1 => Some(DataRate::SF9BW125),
            2 => Some(DataRate::SF8BW125),
            3 => Some(DataRate::SF7BW125),
            4 => Some(DataRate::SF8BW500),
            8 => Some(DataRate::SF12BW500),
            9 => Some(DataRate::SF11BW500),
            10 => Some(DataRate::SF10BW500),
            11 => Some(DataRate::SF9BW500),
            12 => Some(DataRate::SF8BW500),
            13 => Some(DataRate::SF7BW500),
            _ => None,
        }
    }

    fn uplink_index(&self, data_rate: DataRate) -> Option<u8> {
        (0..=4).find(|i| self.data_rate(*i) == Some(data_rate))
    }

    fn max_payload_size(&self, index: u8) -> Option<usize> {
        match index {
            0 => Some(19),
            1 => Some(61),
            2 => Some(133),
            3 | 4 => Some(250),
            8 => Some(61),
            9 => Some(137),
            10..=13 => Some(250),
            _ => None,
        }
    }

    fn max_adr_data_rate(&self) -> u8 {
        3
    }

    fn max_tx_power_index(&self) -> u8 {
        14
    }

    fn adr_channel_mask(&self) -> (u16, u8) {
        (0x00FF, 6)
    }

    fn rx1_data_rate(&self, uplink_index: u8, offset: u8) -> Option<u8> {
        if uplink_index > 4 || offset > 3 {
            return None;
        }
        Some((10 + uplink_index).saturating_sub(offset).clamp(8, 13))
    }

    fn rx1_frequency(&self, uplink_frequency: u32) -> u32 {
        // 64 + 8 upstream channels map onto 8 downstream channels
        let channel = if uplink_frequency >= 903_000_000
            && (uplink_frequency - 903_000_000) % 1_600_000 == 0
            && uplink_frequency <= 914_200_000
        {
            (uplink_frequency - 903_000_000) / 1_600_000
        } else {
            uplink_frequency.saturating_sub(902_300_000) / 200_000
        };
        923_300_000 + (channel % 8) * 600_000
    }

    fn rx2_default(&self) -> (u32, u8) {
        (923_300_000, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_rate_parses_packet_forwarder_notation() {
        assert_eq!("SF7BW125".parse::<DataRate>().unwrap(), DataRate::SF7BW125);
        assert_eq!("sf12bw125".parse::<DataRate>().unwrap(), DataRate::SF12BW125);
        assert!("SF13BW125".parse::<DataRate>().is_err());
    }

    #[test]
    fn eu868_tables() {
        assert_eq!(EU868.uplink_index(DataRate::SF7BW125), Some(5));
        assert_eq!(EU868.max_payload_size(0), Some(59));
        assert_eq!(EU868.max_payload_size(5), Some(230));
        assert_eq!(EU868.rx1_data_rate(5, 2), Some(3));
        assert_eq!(EU868.rx1_frequency(868_100_000), 868_100_000);
        assert_eq!(EU868.rx2_default(), (869_525_000, 0));
    }

    #[test]
    fn us915_rx1_mapping() {
        assert_eq!(US915.rx1_data_rate(0, 0), Some(10));
        assert_eq!(US915.rx1_data_rate(3, 0), Some(13));
        assert_eq!(US915.rx1_data_rate(0, 3), Some(8));
        assert_eq!(US915.rx1_frequency(902_300_000), 923_300_000);
        assert_eq!(US915.rx1_frequency(903_900_000), 923_300_000);
        assert_eq!(US915.rx1_frequency(902_500_000), 923_900_000);
    }
}
