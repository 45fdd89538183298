use heapless::Vec as FOptsVec;

use crate::config::device::{AESKey, DevAddr, NetId, EUI64};
use crate::crypto::{self, Direction, MIC_SIZE};
use crate::error::FrameError;

/// MHDR of a LoRaWAN R1 frame carries major version 0
const MAJOR_R1: u8 = 0x00;

/// FHDR without FOpts: DevAddr(4) | FCtrl(1) | FCnt(2)
pub const FHDR_MIN_SIZE: usize = 7;

/// Fixed MACPayload overhead of a data frame: FHDR without FOpts plus FPort
pub const MAC_PAYLOAD_OVERHEAD: usize = FHDR_MIN_SIZE + 1;

/// Maximum FOpts length
pub const MAX_FOPTS_SIZE: usize = 15;

/// Smallest data frame: MHDR | FHDR | MIC
const MIN_DATA_FRAME_SIZE: usize = 1 + FHDR_MIN_SIZE + MIC_SIZE;

/// MHDR | JoinEUI | DevEUI | DevNonce | MIC
const JOIN_REQUEST_SIZE: usize = 1 + 8 + 8 + 2 + MIC_SIZE;

/// First FPort reserved for future use; 224 is the certification port
pub const RESERVED_FPORT_START: u8 = 224;

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0x00,
    JoinAccept = 0x20,
    UnconfirmedDataUp = 0x40,
    UnconfirmedDataDown = 0x60,
    ConfirmedDataUp = 0x80,
    ConfirmedDataDown = 0xA0,
    RejoinRequest = 0xC0,
    Proprietary = 0xE0,
}

impl MType {
    fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Direction of a data frame type
    pub fn direction(&self) -> Direction {
        match self {
            MType::UnconfirmedDataDown | MType::ConfirmedDataDown | MType::JoinAccept => {
                Direction::Down
            }
            _ => Direction::Up,
        }
    }

    /// Whether the frame requests an acknowledgement
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }

    fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

/// Frame header flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub f_pending: bool,
    pub f_opts_len: u8,
}

impl FCtrl {
    fn to_byte(self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FHDR {
    pub dev_addr: DevAddr,
    pub f_ctrl: FCtrl,
    pub f_cnt: u16,
    pub f_opts: FOptsVec<u8, MAX_FOPTS_SIZE>,
}

impl FHDR {
    /// Header with empty FOpts
    pub fn new(dev_addr: DevAddr, f_ctrl: FCtrl, f_cnt: u16) -> Self {
        Self {
            dev_addr,
            f_ctrl,
            f_cnt,
            f_opts: FOptsVec::new(),
        }
    }

    /// Replace FOpts; fails when longer than 15 bytes
    pub fn with_f_opts(mut self, f_opts: &[u8]) -> Result<Self, FrameError> {
        self.f_opts = FOptsVec::from_slice(f_opts).map_err(|_| FrameError::BufferTooSmall)?;
        self.f_ctrl.f_opts_len = f_opts.len() as u8;
        Ok(self)
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(self.f_ctrl.to_byte());
        out.extend_from_slice(&self.f_cnt.to_le_bytes());
        out.extend_from_slice(&self.f_opts);
    }
}

/// Decoded data frame (either direction); FRMPayload stays encrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub fhdr: FHDR,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; MIC_SIZE],
    /// MHDR through FRMPayload, the MIC input
    signed: Vec<u8>,
}

impl DataFrame {
    /// Parse any data frame
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_DATA_FRAME_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let mhdr = bytes[0];
        if mhdr & 0x03 != MAJOR_R1 {
            return Err(FrameError::UnsupportedMajor(mhdr & 0x03));
        }
        let mtype = MType::from_mhdr(mhdr);
        if !mtype.is_data() {
            return Err(FrameError::UnsupportedMType(mhdr & 0xE0));
        }

        let (signed, mic) = bytes.split_at(bytes.len() - MIC_SIZE);
        let dev_addr = DevAddr::from_le_bytes([signed[1], signed[2], signed[3], signed[4]]);
        let f_ctrl = FCtrl::from_byte(signed[5]);
        let f_cnt = u16::from_le_bytes([signed[6], signed[7]]);

        let opts_end = 1 + FHDR_MIN_SIZE + usize::from(f_ctrl.f_opts_len);
        if opts_end > signed.len() {
            return Err(FrameError::InvalidFOptsLength(f_ctrl.f_opts_len));
        }
        let f_opts = FOptsVec::from_slice(&signed[1 + FHDR_MIN_SIZE..opts_end])
            .map_err(|_| FrameError::InvalidFOptsLength(f_ctrl.f_opts_len))?;

        let (f_port, frm_payload) = match signed[opts_end..].split_first() {
            Some((port, payload)) => (Some(*port), payload.to_vec()),
            None => (None, Vec::new()),
        };
        if f_port == Some(0) && !f_opts.is_empty() {
            return Err(FrameError::DuplicateMacCommands);
        }

        let mut mic_bytes = [0u8; MIC_SIZE];
        mic_bytes.copy_from_slice(mic);

        Ok(Self {
            mtype,
            fhdr: FHDR {
                dev_addr,
                f_ctrl,
                f_cnt,
                f_opts,
            },
            f_port,
            frm_payload,
            mic: mic_bytes,
            signed: signed.to_vec(),
        })
    }

    /// Device address from the header
    pub fn dev_addr(&self) -> DevAddr {
        self.fhdr.dev_addr
    }

    /// Whether the MIC verifies for the full 32-bit counter
    pub fn verify_mic(&self, nwk_skey: &AESKey, fcnt: u32) -> bool {
        crypto::compute_mic(
            nwk_skey,
            &self.signed,
            self.fhdr.dev_addr,
            fcnt,
            self.mtype.direction(),
        ) == self.mic
    }

    /// Decrypt FRMPayload; port 0 uses the NwkSKey, other ports the AppSKey
    pub fn decrypt_payload(&self, nwk_skey: &AESKey, app_skey: &AESKey, fcnt: u32) -> Vec<u8> {
        let key = if self.f_port == Some(0) {
            nwk_skey
        } else {
            app_skey
        };
        crypto::encrypt_payload(
            key,
            self.fhdr.dev_addr,
            fcnt,
            self.mtype.direction(),
            &self.frm_payload,
        )
    }
}

/// Build and sign a data frame.
///
/// `payload` is plaintext; it is encrypted with the NwkSKey for port 0 and
/// with the AppSKey otherwise. `fcnt` is the full 32-bit counter whose low
/// 16 bits must match the header.
pub fn build_data_frame(
    mtype: MType,
    fhdr: &FHDR,
    f_port: Option<u8>,
    payload: &[u8],
    nwk_skey: &AESKey,
    app_skey: &AESKey,
    fcnt: u32,
) -> Result<Vec<u8>, FrameError> {
    if !mtype.is_data() {
        return Err(FrameError::UnsupportedMType(mtype as u8));
    }
    if f_port.is_none() && !payload.is_empty() {
        return Err(FrameError::MissingFPort);
    }
    if f_port == Some(0) && !fhdr.f_opts.is_empty() {
        return Err(FrameError::DuplicateMacCommands);
    }

    let dir = mtype.direction();
    let mut buffer = Vec::with_capacity(MIN_DATA_FRAME_SIZE + fhdr.f_opts.len() + 1 + payload.len());
    buffer.push(mtype as u8 | MAJOR_R1);
    fhdr.serialize(&mut buffer);
    if let Some(port) = f_port {
        buffer.push(port);
        let key = if port == 0 { nwk_skey } else { app_skey };
        buffer.extend(crypto::encrypt_payload(key, fhdr.dev_addr, fcnt, dir, payload));
    }
    let mic = crypto::compute_mic(nwk_skey, &buffer, fhdr.dev_addr, fcnt, dir);
    buffer.extend_from_slice(&mic);
    Ok(buffer)
}

/// Decoded join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub join_eui: EUI64,
    pub dev_eui: EUI64,
    pub dev_nonce: u16,
    pub mic: [u8; MIC_SIZE],
    signed: [u8; JOIN_REQUEST_SIZE - MIC_SIZE],
}

impl JoinRequest {
    /// Parse a join request
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != JOIN_REQUEST_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if MType::from_mhdr(bytes[0]) != MType::JoinRequest {
            return Err(FrameError::UnsupportedMType(bytes[0] & 0xE0));
        }
        let mut join_eui = [0u8; 8];
        join_eui.copy_from_slice(&bytes[1..9]);
        let mut dev_eui = [0u8; 8];
        dev_eui.copy_from_slice(&bytes[9..17]);
        let mut signed = [0u8; JOIN_REQUEST_SIZE - MIC_SIZE];
        signed.copy_from_slice(&bytes[..JOIN_REQUEST_SIZE - MIC_SIZE]);
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&bytes[JOIN_REQUEST_SIZE - MIC_SIZE..]);

        Ok(Self {
            join_eui: EUI64::from_le_bytes(join_eui),
            dev_eui: EUI64::from_le_bytes(dev_eui),
            dev_nonce: u16::from_le_bytes([bytes[17], bytes[18]]),
            mic,
            signed,
        })
    }

    /// Whether the MIC verifies against the AppKey
    pub fn verify_mic(&self, app_key: &AESKey) -> bool {
        crypto::compute_join_mic(app_key, &self.signed) == self.mic
    }
}

/// Build a signed join request
pub fn build_join_request(
    app_key: &AESKey,
    join_eui: EUI64,
    dev_eui: EUI64,
    dev_nonce: u16,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(JOIN_REQUEST_SIZE);
    buffer.push(MType::JoinRequest as u8 | MAJOR_R1);
    buffer.extend_from_slice(&join_eui.to_le_bytes());
    buffer.extend_from_slice(&dev_eui.to_le_bytes());
    buffer.extend_from_slice(&dev_nonce.to_le_bytes());
    let mic = crypto::compute_join_mic(app_key, &buffer);
    buffer.extend_from_slice(&mic);
    buffer
}

/// Join accept contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAccept {
    pub app_nonce: [u8; 3],
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
    pub rx_delay: u8,
}

impl JoinAccept {
    fn plaintext(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(1 + 12 + MIC_SIZE);
        buffer.push(MType::JoinAccept as u8 | MAJOR_R1);
        buffer.extend_from_slice(&self.app_nonce);
        buffer.extend_from_slice(&self.net_id.to_le_bytes());
        buffer.extend_from_slice(&self.dev_addr.to_le_bytes());
        buffer.push(((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_data_rate & 0x0F));
        buffer.push(self.rx_delay & 0x0F);
        buffer
    }

    /// Sign with the AppKey and encrypt everything after the MHDR
    pub fn encode(&self, app_key: &AESKey) -> Vec<u8> {
        let mut plain = self.plaintext();
        let mic = crypto::compute_join_mic(app_key, &plain);
        plain.extend_from_slice(&mic);
        let mut out = Vec::with_capacity(plain.len());
        out.push(plain[0]);
        out.extend(crypto::encrypt_join_accept(app_key, &plain[1..]));
        out
    }

    /// Decrypt and verify an encoded join accept, as a device does
    pub fn decode(app_key: &AESKey, bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != 1 + 12 + MIC_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if MType::from_mhdr(bytes[0]) != MType::JoinAccept {
            return Err(FrameError::UnsupportedMType(bytes[0] & 0xE0));
        }
        let mut plain = vec![bytes[0]];
        plain.extend(crypto::decrypt_join_accept(app_key, &bytes[1..]));
        let (signed, mic) = plain.split_at(plain.len() - MIC_SIZE);
        if crypto::compute_join_mic(app_key, signed)[..] != mic[..] {
            return Err(FrameError::InvalidMic);
        }
        let p = signed;
        Ok(Self {
            app_nonce: [p[1], p[2], p[3]],
            net_id: NetId::new(u32::from_le_bytes([p[4], p[5], p[6], 0])),
            dev_addr: DevAddr::from_le_bytes([p[7], p[8], p[9], p[10]]),
            rx1_dr_offset: (p[11] >> 4) & 0x07,
            rx2_data_rate: p[11] & 0x0F,
            rx_delay: p[12] & 0x0F,
        })
    }
}

/// Decoded uplink PHY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkFrame {
    Join(JoinRequest),
    Data(DataFrame),
}

/// Parse a PHY payload received from a packet forwarder
pub fn parse_uplink(bytes: &[u8]) -> Result<UplinkFrame, FrameError> {
    let mhdr = *bytes.first().ok_or(FrameError::TooShort(0))?;
    match MType::from_mhdr(mhdr) {
        MType::JoinRequest => JoinRequest::parse(bytes).map(UplinkFrame::Join),
        MType::UnconfirmedDataUp | MType::ConfirmedDataUp => {
            DataFrame::parse(bytes).map(UplinkFrame::Data)
        }
        _ => Err(FrameError::UnsupportedMType(mhdr & 0xE0)),
    }
}
