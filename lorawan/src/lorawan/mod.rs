//! LoRaWAN protocol layer
//!
//! Byte-level pieces the network server relies on:
//! - Frame codec (data frames, join request, join accept)
//! - MAC command encoding
//! - Regional parameters
//! - Receive timing and radio metadata

/// MAC command handling
pub mod commands;

/// Frame codec
pub mod mac;

/// Timing constants and radio metadata
pub mod phy;

/// Regional parameters
pub mod region;

pub use commands::{CommandIdentifier, MacCommand};
pub use mac::{DataFrame, FCtrl, JoinAccept, JoinRequest, MType, UplinkFrame, FHDR};
pub use phy::{RadioMetadata, TimingParams};
pub use region::{DataRate, Region, RegionId};
