//! Frame counter arithmetic
//!
//! Uplinks carry only the low 16 bits of the counter. The server rebuilds
//! the full value from the last accepted one and decides whether the frame
//! is new, a resubmit of the last confirmed frame, a reset, or a replay.

/// Counter state consulted for one uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcntState {
    /// Last accepted uplink counter
    pub last: u32,
    /// Nothing has been accepted since the session started at zero
    pub fresh: bool,
    /// An uplink was accepted or a restart honored in this session
    pub uplink_seen: bool,
    pub supports_32bit: bool,
    /// Relaxed validation and a pending reset generation allow a restart
    pub reset_allowed: bool,
    pub max_gap: u32,
}

/// Outcome of counter validation, carrying the 32-bit value used for the MIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntDecision {
    /// New frame
    Accept(u32),
    /// Device restarted its counter
    Reset(u32),
    /// Repeat of the last confirmed frame
    Resubmit(u32),
    /// Replay or out of range
    Invalid(u32),
}

impl FcntDecision {
    /// Full counter of the frame
    pub fn counter(&self) -> u32 {
        match *self {
            FcntDecision::Accept(c)
            | FcntDecision::Reset(c)
            | FcntDecision::Resubmit(c)
            | FcntDecision::Invalid(c) => c,
        }
    }
}

/// Smallest 32-bit counter consistent with `last` whose low half is `incoming`.
///
/// Without 32-bit support the counter never leaves the 16-bit range.
pub fn resolve(last: u32, incoming: u16, supports_32bit: bool) -> u32 {
    if !supports_32bit {
        return u32::from(incoming);
    }
    let candidate = (last & !0xFFFF) | u32::from(incoming);
    if candidate < last {
        candidate.wrapping_add(0x1_0000)
    } else {
        candidate
    }
}

/// Whether a counter reset requested at generation `desired` may be honored
/// when `reported` was the last one honored
pub fn generation_allows_reset(desired: Option<u32>, reported: Option<u32>) -> bool {
    match (desired, reported) {
        (_, None) => true,
        (Some(desired), Some(reported)) => desired > reported,
        (None, Some(_)) => false,
    }
}

/// Classify an incoming 16-bit counter
pub fn evaluate(state: &FcntState, incoming: u16, confirmed: bool) -> FcntDecision {
    // the frame that started the count again, sent a second time
    if state.uplink_seen && u32::from(incoming) == state.last {
        return repeat(state.last, confirmed);
    }

    // a device restarting at 1 after having sent 0 is just counting up
    let restarted = incoming == 0 || (incoming == 1 && state.last > 1);
    if state.reset_allowed && restarted {
        return FcntDecision::Reset(u32::from(incoming));
    }

    let counter = resolve(state.last, incoming, state.supports_32bit);
    if state.fresh && counter == 0 {
        return FcntDecision::Accept(0);
    }
    if counter == state.last {
        return repeat(counter, confirmed);
    }
    if counter < state.last || counter - state.last > state.max_gap {
        return FcntDecision::Invalid(counter);
    }
    FcntDecision::Accept(counter)
}

fn repeat(counter: u32, confirmed: bool) -> FcntDecision {
    if confirmed {
        FcntDecision::Resubmit(counter)
    } else {
        FcntDecision::Invalid(counter)
    }
}
