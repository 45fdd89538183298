//! Device class timing
//!
//! The server only answers Class A devices: every downlink must land in one
//! of the two receive windows that follow an uplink.

/// Class A receive-window scheduler
pub mod class_a;

pub use class_a::{ReceiveWindow, WindowTimer};
