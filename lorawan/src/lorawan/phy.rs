use core::time::Duration;

use super::region::DataRate;

/// Class A timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingParams {
    /// RX1 delay
    pub rx1_delay: Duration,
    /// RX2 delay
    pub rx2_delay: Duration,
    /// Join accept delay 1
    pub join_accept_delay1: Duration,
    /// Join accept delay 2
    pub join_accept_delay2: Duration,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            rx1_delay: Duration::from_secs(1),
            rx2_delay: Duration::from_secs(2),
            join_accept_delay1: Duration::from_secs(5),
            join_accept_delay2: Duration::from_secs(6),
        }
    }
}

impl TimingParams {
    /// Timing with a device-specific RX1 delay in seconds (RXTimingSetup).
    ///
    /// A delay of 0 means the default of 1 second; RX2 always opens one
    /// second after RX1.
    pub fn with_rx_delay(rx_delay_secs: u8) -> Self {
        let rx1 = Duration::from_secs(u64::from(rx_delay_secs.clamp(1, 15)));
        Self {
            rx1_delay: rx1,
            rx2_delay: rx1 + Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Radio metadata reported by the packet forwarder with an uplink
#[derive(Debug, Clone, PartialEq)]
pub struct RadioMetadata {
    /// Uplink frequency in Hz
    pub frequency: u32,
    /// Uplink modulation
    pub data_rate: DataRate,
    /// Concentrator channel
    pub channel: u8,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    pub snr: f32,
    /// Concentrator timestamp in microseconds
    pub tmst: u32,
}

impl Default for RadioMetadata {
    fn default() -> Self {
        Self {
            frequency: 868_100_000,
            data_rate: DataRate::SF7BW125,
            channel: 0,
            rssi: -60,
            snr: 7.5,
            tmst: 0,
        }
    }
}
