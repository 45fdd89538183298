//! Downlink assembly
//!
//! The size of a downlink is bounded by the region's maximum MACPayload (M)
//! for the data rate of the chosen window. MAC answers are placed first and
//! dropped when they do not fit; a cloud-to-device message is only ever sent
//! whole.

use core::time::Duration;

use tracing::debug;

use crate::class::class_a::{ReceiveWindow, WindowTimer};
use crate::config::device::{AESKey, DevAddr};
use crate::error::FrameError;
use crate::lorawan::commands::{self, MacCommand};
use crate::lorawan::mac::{self, FCtrl, MType, FHDR, MAC_PAYLOAD_OVERHEAD, MAX_FOPTS_SIZE};
use crate::lorawan::phy::RadioMetadata;
use crate::lorawan::region::{DataRate, Region};
use crate::store::CloudMessage;

/// Radio parameters of a receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub frequency: u32,
    pub data_rate_index: u8,
    pub data_rate: DataRate,
}

/// Frequency and data rate the device listens on in `window`
pub fn window_params(
    region: &dyn Region,
    window: ReceiveWindow,
    uplink: &RadioMetadata,
    rx1_dr_offset: u8,
    rx2_data_rate: Option<u8>,
) -> Option<WindowParams> {
    let (frequency, data_rate_index) = match window {
        ReceiveWindow::Rx1 => {
            let uplink_index = region.uplink_index(uplink.data_rate)?;
            (
                region.rx1_frequency(uplink.frequency),
                region.rx1_data_rate(uplink_index, rx1_dr_offset)?,
            )
        }
        ReceiveWindow::Rx2 => {
            let (frequency, default_dr) = region.rx2_default();
            (frequency, rx2_data_rate.unwrap_or(default_dr))
        }
    };
    Some(WindowParams {
        frequency,
        data_rate_index,
        data_rate: region.data_rate(data_rate_index)?,
    })
}

/// Downlink handed to the packet forwarder
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    /// PHY payload
    pub payload: Vec<u8>,
    pub window: ReceiveWindow,
    /// Transmit offset from the uplink's arrival
    pub delay: Duration,
    /// Concentrator timestamp to transmit at
    pub tmst: u32,
    pub frequency: u32,
    pub data_rate: DataRate,
    pub data_rate_index: u8,
    /// `None` for a join accept
    pub fcnt_down: Option<u32>,
}

impl DownlinkFrame {
    pub fn new(
        payload: Vec<u8>,
        window: ReceiveWindow,
        timer: &WindowTimer,
        params: WindowParams,
        uplink: &RadioMetadata,
        fcnt_down: Option<u32>,
    ) -> Self {
        let delay = timer.delay(window);
        Self {
            payload,
            window,
            delay,
            tmst: uplink.tmst.wrapping_add(delay.as_micros() as u32),
            frequency: params.frequency,
            data_rate: params.data_rate,
            data_rate_index: params.data_rate_index,
            fcnt_down,
        }
    }
}

/// How a cloud-to-device message relates to the frame being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFit {
    /// Included; complete it once sent
    Fits,
    /// Too large for this data rate
    TooLarge,
    /// FPort the application may not use
    ReservedPort,
    /// Port 0 already carries MAC answers
    Blocked,
}

/// Reserved FPort: 0 with an application payload, or 224 and above
pub fn is_reserved_port(message: &CloudMessage) -> bool {
    (message.f_port == 0 && !message.payload.is_empty())
        || message.f_port >= mac::RESERVED_FPORT_START
}

/// Accumulates the content of one data downlink within its size budget
#[derive(Debug)]
pub struct DownlinkBuilder {
    /// Room after FHDR and FPort
    available: usize,
    mac_in_payload: bool,
    mac: Vec<MacCommand>,
    cloud: Option<CloudMessage>,
    ack: bool,
    adr: bool,
    f_pending: bool,
}

impl DownlinkBuilder {
    /// `max_mac_payload` is M of the window's data rate; `mac_in_payload`
    /// answers in port 0 instead of FOpts
    pub fn new(max_mac_payload: usize, mac_in_payload: bool, ack: bool, adr: bool) -> Self {
        Self {
            available: max_mac_payload.saturating_sub(MAC_PAYLOAD_OVERHEAD),
            mac_in_payload,
            mac: Vec::new(),
            cloud: None,
            ack,
            adr,
            f_pending: false,
        }
    }

    fn used(&self) -> usize {
        commands::encoded_len(&self.mac) + self.cloud.as_ref().map_or(0, CloudMessage::size)
    }

    fn f_opts_used(&self) -> usize {
        let cloud_mac = self
            .cloud
            .as_ref()
            .map_or(0, |c| commands::encoded_len(&c.mac_commands));
        if self.mac_in_payload {
            cloud_mac
        } else {
            commands::encoded_len(&self.mac) + cloud_mac
        }
    }

    /// Add a MAC command; returns false when it was dropped for lack of room
    pub fn add_mac(&mut self, command: MacCommand) -> bool {
        let len = command.len();
        let fits_frame = self.used() + len <= self.available;
        let fits_location = self.mac_in_payload || self.f_opts_used() + len <= MAX_FOPTS_SIZE;
        if fits_frame && fits_location {
            self.mac.push(command);
            true
        } else {
            debug!(cid = ?command.cid(), available = self.available, "MAC command does not fit, dropped");
            false
        }
    }

    fn port_zero_taken(&self) -> bool {
        self.mac_in_payload && !self.mac.is_empty()
    }

    /// Offer a cloud message; it is kept only on [`CloudFit::Fits`]
    pub fn offer_cloud(&mut self, message: &CloudMessage) -> CloudFit {
        if is_reserved_port(message) {
            return CloudFit::ReservedPort;
        }
        if self.port_zero_taken() {
            return CloudFit::Blocked;
        }
        let mac_len = commands::encoded_len(&message.mac_commands);
        if self.used() + message.size() > self.available
            || self.f_opts_used() + mac_len > MAX_FOPTS_SIZE
        {
            return CloudFit::TooLarge;
        }
        self.cloud = Some(message.clone());
        CloudFit::Fits
    }

    pub fn set_f_pending(&mut self, pending: bool) {
        self.f_pending = pending;
    }

    /// Nothing but an optional ACK would be sent
    pub fn is_empty(&self) -> bool {
        self.mac.is_empty() && self.cloud.is_none()
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Encode and sign the frame
    pub fn build(
        self,
        dev_addr: DevAddr,
        nwk_skey: &AESKey,
        app_skey: &AESKey,
        fcnt_down: u32,
    ) -> Result<Vec<u8>, FrameError> {
        let confirmed = self.cloud.as_ref().is_some_and(|c| c.confirmed);
        let mtype = if confirmed {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };

        let mut f_opts = Vec::new();
        if !self.mac_in_payload {
            f_opts.extend(commands::encode_all(&self.mac));
        }
        if let Some(cloud) = &self.cloud {
            f_opts.extend(commands::encode_all(&cloud.mac_commands));
        }

        let (f_port, payload) = if self.port_zero_taken() {
            (Some(0), commands::encode_all(&self.mac))
        } else {
            match &self.cloud {
                Some(cloud) if !cloud.payload.is_empty() => (Some(cloud.f_port), cloud.payload.clone()),
                _ => (None, Vec::new()),
            }
        };

        let f_ctrl = FCtrl {
            adr: self.adr,
            ack: self.ack,
            f_pending: self.f_pending,
            ..FCtrl::default()
        };
        let fhdr = FHDR::new(dev_addr, f_ctrl, fcnt_down as u16).with_f_opts(&f_opts)?;
        mac::build_data_frame(mtype, &fhdr, f_port, &payload, nwk_skey, app_skey, fcnt_down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::mac::DataFrame;

    fn message(f_port: u8, len: usize) -> CloudMessage {
        CloudMessage {
            id: "m1".into(),
            f_port,
            payload: vec![0xAB; len],
            confirmed: false,
            mac_commands: Vec::new(),
            expires_at: None,
        }
    }

    #[test]
    fn cloud_message_must_fit_whole() {
        // DR0 in EU868: M = 59, so 51 bytes remain
        let mut builder = DownlinkBuilder::new(59, false, false, false);
        assert_eq!(builder.offer_cloud(&message(1, 52)), CloudFit::TooLarge);
        assert_eq!(builder.offer_cloud(&message(1, 51)), CloudFit::Fits);
    }

    #[test]
    fn mac_answers_reduce_the_budget() {
        let mut builder = DownlinkBuilder::new(59, false, true, false);
        assert!(builder.add_mac(MacCommand::LinkCheckAns {
            margin: 10,
            gateway_count: 1
        }));
        assert_eq!(builder.offer_cloud(&message(1, 51)), CloudFit::TooLarge);
        assert_eq!(builder.offer_cloud(&message(1, 48)), CloudFit::Fits);
    }

    #[test]
    fn reserved_ports_and_blocked_port_zero() {
        let mut builder = DownlinkBuilder::new(230, true, false, false);
        assert_eq!(builder.offer_cloud(&message(224, 1)), CloudFit::ReservedPort);
        assert_eq!(builder.offer_cloud(&message(0, 1)), CloudFit::ReservedPort);
        assert!(builder.add_mac(MacCommand::DevStatusReq));
        assert_eq!(builder.offer_cloud(&message(1, 1)), CloudFit::Blocked);
    }

    #[test]
    fn builds_port_zero_answers() {
        let nwk = AESKey::new([1; 16]);
        let app = AESKey::new([2; 16]);
        let dev_addr = DevAddr::from_u32(0x2600_0001);
        let mut builder = DownlinkBuilder::new(230, true, true, false);
        builder.add_mac(MacCommand::LinkCheckAns {
            margin: 3,
            gateway_count: 1,
        });
        let bytes = builder.build(dev_addr, &nwk, &app, 4).unwrap();
        let frame = DataFrame::parse(&bytes).unwrap();
        assert_eq!(frame.mtype, MType::UnconfirmedDataDown);
        assert!(frame.fhdr.f_ctrl.ack);
        assert_eq!(frame.f_port, Some(0));
        assert!(frame.verify_mic(&nwk, 4));
        assert_eq!(frame.decrypt_payload(&nwk, &app, 4), vec![0x02, 3, 1]);
    }
}
