//! Gateway-side LoRaWAN network server
//!
//! This crate turns raw uplinks from a packet forwarder into authenticated,
//! counted and answered frames. It resolves devices by radio address with a
//! single backend lookup per address, runs one uplink per device at a time,
//! and only ever emits downlinks that can still make a receive window.
//!
//! # Features
//! - LoRaWAN 1.0.x data and join (OTAA) frames, ABP sessions with relaxed
//!   frame counters
//! - Network-side ADR and MAC command answers
//! - Class A receive-window deadline scheduling
//! - Regions EU868 and US915
//! - Pluggable device store, cloud-to-device queue and telemetry sink
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use lorawan_ns::{
//!     config::ServerConfig,
//!     dispatcher::{Dispatcher, RadioUplink},
//!     store::{CloudMessageQueue, DeviceStore, TelemetrySink},
//! };
//!
//! async fn serve(
//!     store: Arc<dyn DeviceStore>,
//!     cloud: Arc<dyn CloudMessageQueue>,
//!     telemetry: Arc<dyn TelemetrySink>,
//!     uplink: RadioUplink,
//! ) {
//!     let config = Arc::new(ServerConfig::load(None).unwrap());
//!     lorawan_ns::logging::init_tracing(&config);
//!     let dispatcher = Arc::new(Dispatcher::new(config, store, cloud, telemetry));
//!
//!     let outcome = dispatcher.submit(uplink).wait().await;
//!     if let Some(downlink) = outcome.downlink() {
//!         println!("send {} bytes at tmst {}", downlink.payload.len(), downlink.tmst);
//!     }
//! }
//! ```

/// Receive-window scheduling
pub mod class;

/// Server configuration and identifiers
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// Devices and their sessions
pub mod device;

/// Uplink entry point
pub mod dispatcher;

/// Errors and uplink failure reasons
pub mod error;

/// Uplink state machine, joins and downlink assembly
pub mod handler;

/// Tracing setup
pub mod logging;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Device resolution and the single-flight loader
pub mod registry;

/// External collaborators
pub mod store;

pub use dispatcher::{Dispatcher, PendingUplink, RadioUplink, UplinkOutcome};
pub use error::FailureReason;
