//! Adaptive data rate
//!
//! Network-side ADR: uplink SNR samples are collected per device and, once
//! enough are available, turned into a (data rate, TX power, NbRep) triple.

use std::collections::VecDeque;

use crate::config::AdrConfig;
use crate::lorawan::region::Region;

/// Step size of the SNR headroom in dB
const SNR_STEP_DB: f32 = 3.0;

/// NbRep by packet-loss bucket (rows) and current NbRep (columns)
const NB_REP_TABLE: [[u8; 3]; 4] = [[1, 1, 2], [1, 2, 3], [2, 3, 3], [3, 3, 3]];

/// Radio settings commanded through LinkADRReq
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdrSettings {
    pub data_rate: u8,
    /// TX power index, 0 is the maximum power
    pub tx_power: u8,
    pub nb_rep: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    fcnt: u32,
    snr: f32,
}

/// Recent uplink quality at one data rate
#[derive(Debug, Clone, PartialEq)]
pub struct AdrHistory {
    data_rate: Option<u8>,
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl AdrHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            data_rate: None,
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an uplink; a data rate change starts a new history
    pub fn record(&mut self, fcnt: u32, snr: f32, data_rate: u8) {
        if self.data_rate != Some(data_rate) {
            self.samples.clear();
            self.data_rate = Some(data_rate);
        }
        if self.samples.back().is_some_and(|s| s.fcnt == fcnt) {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { fcnt, snr });
    }

    /// Forget all samples
    pub fn clear(&mut self) {
        self.samples.clear();
        self.data_rate = None;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Data rate the samples were taken at
    pub fn data_rate(&self) -> Option<u8> {
        self.data_rate
    }

    fn max_snr(&self) -> Option<f32> {
        self.samples.iter().map(|s| s.snr).reduce(f32::max)
    }

    /// Lost frames over expected frames, from counter gaps
    fn packet_loss(&self) -> f32 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) if last.fcnt > first.fcnt => {
                let expected = (last.fcnt - first.fcnt + 1) as f32;
                (1.0 - self.samples.len() as f32 / expected).max(0.0)
            }
            _ => 0.0,
        }
    }
}

fn nb_rep_for_loss(loss: f32, current: u8) -> u8 {
    let row = if loss < 0.05 {
        0
    } else if loss < 0.10 {
        1
    } else if loss < 0.30 {
        2
    } else {
        3
    };
    let column = usize::from(current.clamp(1, 3) - 1);
    NB_REP_TABLE[row][column]
}

/// Compute new settings for a device.
///
/// `current` holds the settings in effect; its data rate is the one the
/// history was sampled at. Returns `None` when there is nothing to say.
pub fn compute(
    region: &dyn Region,
    config: &AdrConfig,
    history: &AdrHistory,
    current: AdrSettings,
    adr_ack_req: bool,
) -> Option<AdrSettings> {
    if !history.is_full() {
        // the device asked for an answer; re-send what it has at full power
        return adr_ack_req.then_some(AdrSettings {
            tx_power: 0,
            ..current
        });
    }

    let data_rate = region.data_rate(current.data_rate)?;
    let max_snr = history.max_snr()?;
    let headroom = max_snr - data_rate.required_snr() - config.installation_margin_db;
    let mut steps = (headroom / SNR_STEP_DB).floor() as i32;

    let mut next = current;
    let max_dr = region.max_adr_data_rate();
    let max_power = region.max_tx_power_index();

    while steps > 0 && next.data_rate < max_dr {
        next.data_rate += 1;
        steps -= 1;
    }
    while steps > 0 && next.tx_power < max_power {
        next.tx_power += 1;
        steps -= 1;
    }
    while steps < 0 && next.tx_power > 0 {
        next.tx_power -= 1;
        steps += 1;
    }
    next.nb_rep = nb_rep_for_loss(history.packet_loss(), current.nb_rep);

    Some(next)
}
