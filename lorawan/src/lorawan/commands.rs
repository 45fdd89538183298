use crate::crypto::Direction;
use crate::error::MacCommandError;

/// MAC command identifiers (shared by request and answer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandIdentifier {
    LinkCheck = 0x02,
    LinkADR = 0x03,
    DutyCycle = 0x04,
    RXParamSetup = 0x05,
    DevStatus = 0x06,
    NewChannel = 0x07,
    RXTimingSetup = 0x08,
    TxParamSetup = 0x09,
    DlChannel = 0x0A,
    DeviceTime = 0x0D,
}

impl CommandIdentifier {
    /// Look up a CID byte
    pub fn from_u8(cid: u8) -> Option<Self> {
        Some(match cid {
            0x02 => Self::LinkCheck,
            0x03 => Self::LinkADR,
            0x04 => Self::DutyCycle,
            0x05 => Self::RXParamSetup,
            0x06 => Self::DevStatus,
            0x07 => Self::NewChannel,
            0x08 => Self::RXTimingSetup,
            0x09 => Self::TxParamSetup,
            0x0A => Self::DlChannel,
            0x0D => Self::DeviceTime,
            _ => return None,
        })
    }

    /// Payload length (without the CID byte) in the given direction
    pub fn payload_len(&self, dir: Direction) -> usize {
        match (self, dir) {
            (Self::LinkCheck, Direction::Up) => 0,
            (Self::LinkCheck, Direction::Down) => 2,
            (Self::LinkADR, Direction::Up) => 1,
            (Self::LinkADR, Direction::Down) => 4,
            (Self::DutyCycle, Direction::Up) => 0,
            (Self::DutyCycle, Direction::Down) => 1,
            (Self::RXParamSetup, Direction::Up) => 1,
            (Self::RXParamSetup, Direction::Down) => 4,
            (Self::DevStatus, Direction::Up) => 2,
            (Self::DevStatus, Direction::Down) => 0,
            (Self::NewChannel, Direction::Up) => 1,
            (Self::NewChannel, Direction::Down) => 5,
            (Self::RXTimingSetup, Direction::Up) => 0,
            (Self::RXTimingSetup, Direction::Down) => 1,
            (Self::TxParamSetup, Direction::Up) => 0,
            (Self::TxParamSetup, Direction::Down) => 1,
            (Self::DlChannel, Direction::Up) => 1,
            (Self::DlChannel, Direction::Down) => 4,
            (Self::DeviceTime, Direction::Up) => 0,
            (Self::DeviceTime, Direction::Down) => 5,
        }
    }
}

/// MAC command
#[derive(Debug, Clone, PartialEq)]
pub enum MacCommand {
    /// Link check request
    LinkCheckReq,
    /// Link check answer
    LinkCheckAns {
        /// Link margin in dB above the demodulation floor
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// Link ADR request
    LinkADRReq {
        /// Data rate index
        data_rate: u8,
        /// TX power index
        tx_power: u8,
        /// Channel mask
        ch_mask: u16,
        /// Channel mask control
        ch_mask_cntl: u8,
        /// Number of transmissions
        nb_trans: u8,
    },
    /// Link ADR answer
    LinkADRAns {
        /// Power ACK
        power_ack: bool,
        /// Data rate ACK
        data_rate_ack: bool,
        /// Channel mask ACK
        channel_mask_ack: bool,
    },
    /// Duty cycle request
    DutyCycleReq {
        /// Maximum duty cycle exponent
        max_duty_cycle: u8,
    },
    /// Duty cycle answer
    DutyCycleAns,
    /// RX parameter setup request
    RXParamSetupReq {
        /// RX1 data rate offset
        rx1_dr_offset: u8,
        /// RX2 data rate
        rx2_data_rate: u8,
        /// RX2 frequency in Hz
        freq: u32,
    },
    /// RX parameter setup answer
    RXParamSetupAns {
        /// RX1 data rate offset ACK
        rx1_dr_offset_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_ack: bool,
        /// Channel ACK
        channel_ack: bool,
    },
    /// Device status request
    DevStatusReq,
    /// Device status answer
    DevStatusAns {
        /// Battery level (0 = external power, 1-254 = level, 255 = unknown)
        battery: u8,
        /// Demodulation margin of the last DevStatusReq in dB (-32..31)
        margin: i8,
    },
    /// New channel request
    NewChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz
        freq: u32,
        /// Maximum data rate
        max_dr: u8,
        /// Minimum data rate
        min_dr: u8,
    },
    /// New channel answer
    NewChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Data rate range OK
        data_rate_ok: bool,
    },
    /// RX timing setup request
    RXTimingSetupReq {
        /// Delay in seconds (0 means 1)
        delay: u8,
    },
    /// RX timing setup answer
    RXTimingSetupAns,
    /// TX parameter setup request
    TxParamSetupReq {
        /// Downlink dwell time
        downlink_dwell_time: bool,
        /// Uplink dwell time
        uplink_dwell_time: bool,
        /// Maximum EIRP index
        max_eirp: u8,
    },
    /// TX parameter setup answer
    TxParamSetupAns,
    /// Downlink channel request
    DlChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz
        freq: u32,
    },
    /// Downlink channel answer
    DlChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Uplink frequency exists
        uplink_freq_exists: bool,
    },
    /// Device time request
    DeviceTimeReq,
    /// Device time answer
    DeviceTimeAns {
        /// Seconds since the GPS epoch
        seconds: u32,
        /// Fractional second in 1/256 s steps
        fraction: u8,
    },
}

fn read_freq(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], 0]) * 100
}

fn write_freq(out: &mut Vec<u8>, freq: u32) {
    out.extend_from_slice(&(freq / 100).to_le_bytes()[..3]);
}

impl MacCommand {
    /// Command identifier
    pub fn cid(&self) -> CommandIdentifier {
        use CommandIdentifier as C;
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => C::LinkCheck,
            MacCommand::LinkADRReq { .. } | MacCommand::LinkADRAns { .. } => C::LinkADR,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => C::DutyCycle,
            MacCommand::RXParamSetupReq { .. } | MacCommand::RXParamSetupAns { .. } => {
                C::RXParamSetup
            }
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => C::DevStatus,
            MacCommand::NewChannelReq { .. } | MacCommand::NewChannelAns { .. } => C::NewChannel,
            MacCommand::RXTimingSetupReq { .. } | MacCommand::RXTimingSetupAns => C::RXTimingSetup,
            MacCommand::TxParamSetupReq { .. } | MacCommand::TxParamSetupAns => C::TxParamSetup,
            MacCommand::DlChannelReq { .. } | MacCommand::DlChannelAns { .. } => C::DlChannel,
            MacCommand::DeviceTimeReq | MacCommand::DeviceTimeAns { .. } => C::DeviceTime,
        }
    }

    /// Direction this command travels in
    pub fn direction(&self) -> Direction {
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::LinkADRAns { .. }
            | MacCommand::DutyCycleAns
            | MacCommand::RXParamSetupAns { .. }
            | MacCommand::DevStatusAns { .. }
            | MacCommand::NewChannelAns { .. }
            | MacCommand::RXTimingSetupAns
            | MacCommand::TxParamSetupAns
            | MacCommand::DlChannelAns { .. }
            | MacCommand::DeviceTimeReq => Direction::Up,
            _ => Direction::Down,
        }
    }

    /// Encoded length in bytes, CID included
    pub fn len(&self) -> usize {
        1 + self.cid().payload_len(self.direction())
    }

    /// Parse one command payload; `payload` has exactly the table length
    fn from_bytes(cid: CommandIdentifier, dir: Direction, p: &[u8]) -> Self {
        use CommandIdentifier as C;
        match (cid, dir) {
            (C::LinkCheck, Direction::Up) => MacCommand::LinkCheckReq,
            (C::LinkCheck, Direction::Down) => MacCommand::LinkCheckAns {
                margin: p[0],
                gateway_count: p[1],
            },
            (C::LinkADR, Direction::Up) => MacCommand::LinkADRAns {
                power_ack: p[0] & 0x04 != 0,
                data_rate_ack: p[0] & 0x02 != 0,
                channel_mask_ack: p[0] & 0x01 != 0,
            },
            (C::LinkADR, Direction::Down) => MacCommand::LinkADRReq {
                data_rate: p[0] >> 4,
                tx_power: p[0] & 0x0F,
                ch_mask: u16::from_le_bytes([p[1], p[2]]),
                ch_mask_cntl: (p[3] >> 4) & 0x07,
                nb_trans: p[3] & 0x0F,
            },
            (C::DutyCycle, Direction::Up) => MacCommand::DutyCycleAns,
            (C::DutyCycle, Direction::Down) => MacCommand::DutyCycleReq {
                max_duty_cycle: p[0] & 0x0F,
            },
            (C::RXParamSetup, Direction::Up) => MacCommand::RXParamSetupAns {
                rx1_dr_offset_ack: p[0] & 0x04 != 0,
                rx2_data_rate_ack: p[0] & 0x02 != 0,
                channel_ack: p[0] & 0x01 != 0,
            },
            (C::RXParamSetup, Direction::Down) => MacCommand::RXParamSetupReq {
                rx1_dr_offset: (p[0] >> 4) & 0x07,
                rx2_data_rate: p[0] & 0x0F,
                freq: read_freq(&p[1..4]),
            },
            (C::DevStatus, Direction::Up) => MacCommand::DevStatusAns {
                battery: p[0],
                // 6-bit two's complement
                margin: ((p[1] << 2) as i8) >> 2,
            },
            (C::DevStatus, Direction::Down) => MacCommand::DevStatusReq,
            (C::NewChannel, Direction::Up) => MacCommand::NewChannelAns {
                channel_freq_ok: p[0] & 0x01 != 0,
                data_rate_ok: p[0] & 0x02 != 0,
            },
            (C::NewChannel, Direction::Down) => MacCommand::NewChannelReq {
                ch_index: p[0],
                freq: read_freq(&p[1..4]),
                max_dr: p[4] >> 4,
                min_dr: p[4] & 0x0F,
            },
            (C::RXTimingSetup, Direction::Up) => MacCommand::RXTimingSetupAns,
            (C::RXTimingSetup, Direction::Down) => MacCommand::RXTimingSetupReq {
                delay: p[0] & 0x0F,
            },
            (C::TxParamSetup, Direction::Up) => MacCommand::TxParamSetupAns,
            (C::TxParamSetup, Direction::Down) => MacCommand::TxParamSetupReq {
                downlink_dwell_time: p[0] & 0x20 != 0,
                uplink_dwell_time: p[0] & 0x10 != 0,
                max_eirp: p[0] & 0x0F,
            },
            (C::DlChannel, Direction::Up) => MacCommand::DlChannelAns {
                channel_freq_ok: p[0] & 0x01 != 0,
                uplink_freq_exists: p[0] & 0x02 != 0,
            },
            (C::DlChannel, Direction::Down) => MacCommand::DlChannelReq {
                ch_index: p[0],
                freq: read_freq(&p[1..4]),
            },
            (C::DeviceTime, Direction::Up) => MacCommand::DeviceTimeReq,
            (C::DeviceTime, Direction::Down) => MacCommand::DeviceTimeAns {
                seconds: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                fraction: p[4],
            },
        }
    }

    /// Append the encoded command (CID first)
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.cid() as u8);
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::DutyCycleAns
            | MacCommand::DevStatusReq
            | MacCommand::RXTimingSetupAns
            | MacCommand::TxParamSetupAns
            | MacCommand::DeviceTimeReq => {}
            MacCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => out.extend_from_slice(&[*margin, *gateway_count]),
            MacCommand::LinkADRReq {
                data_rate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                out.push((data_rate << 4) | (tx_power & 0x0F));
                out.extend_from_slice(&ch_mask.to_le_bytes());
                out.push(((ch_mask_cntl & 0x07) << 4) | (nb_trans & 0x0F));
            }
            MacCommand::LinkADRAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => out.push(flags(&[(*power_ack, 2), (*data_rate_ack, 1), (*channel_mask_ack, 0)])),
            MacCommand::DutyCycleReq { max_duty_cycle } => out.push(max_duty_cycle & 0x0F),
            MacCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                freq,
            } => {
                out.push(((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate & 0x0F));
                write_freq(out, *freq);
            }
            MacCommand::RXParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => out.push(flags(&[
                (*rx1_dr_offset_ack, 2),
                (*rx2_data_rate_ack, 1),
                (*channel_ack, 0),
            ])),
            MacCommand::DevStatusAns { battery, margin } => {
                out.extend_from_slice(&[*battery, (*margin as u8) & 0x3F])
            }
            MacCommand::NewChannelReq {
                ch_index,
                freq,
                max_dr,
                min_dr,
            } => {
                out.push(*ch_index);
                write_freq(out, *freq);
                out.push((max_dr << 4) | (min_dr & 0x0F));
            }
            MacCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_ok,
            } => out.push(flags(&[(*data_rate_ok, 1), (*channel_freq_ok, 0)])),
            MacCommand::RXTimingSetupReq { delay } => out.push(delay & 0x0F),
            MacCommand::TxParamSetupReq {
                downlink_dwell_time,
                uplink_dwell_time,
                max_eirp,
            } => out.push(
                flags(&[(*downlink_dwell_time, 5), (*uplink_dwell_time, 4)]) | (max_eirp & 0x0F),
            ),
            MacCommand::DlChannelReq { ch_index, freq } => {
                out.push(*ch_index);
                write_freq(out, *freq);
            }
            MacCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => out.push(flags(&[(*uplink_freq_exists, 1), (*channel_freq_ok, 0)])),
            MacCommand::DeviceTimeAns { seconds, fraction } => {
                out.extend_from_slice(&seconds.to_le_bytes());
                out.push(*fraction);
            }
        }
    }
}

fn flags(bits: &[(bool, u8)]) -> u8 {
    bits.iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | (1 << bit))
}

/// Decode a sequence of MAC commands travelling in `dir`.
///
/// Either every byte decodes or the whole buffer is rejected.
pub fn decode(bytes: &[u8], dir: Direction) -> Result<Vec<MacCommand>, MacCommandError> {
    let mut commands = Vec::new();
    let mut rest = bytes;
    while let Some((&cid, tail)) = rest.split_first() {
        let id = CommandIdentifier::from_u8(cid).ok_or(MacCommandError::UnknownCommand(cid))?;
        let len = id.payload_len(dir);
        if tail.len() < len {
            return Err(MacCommandError::Truncated { cid });
        }
        commands.push(MacCommand::from_bytes(id, dir, &tail[..len]));
        rest = &tail[len..];
    }
    Ok(commands)
}

/// Encode a sequence of commands
pub fn encode_all(commands: &[MacCommand]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(commands));
    for command in commands {
        command.encode(&mut out);
    }
    out
}

/// Total encoded length of a sequence of commands
pub fn encoded_len(commands: &[MacCommand]) -> usize {
    commands.iter().map(MacCommand::len).sum()
}
