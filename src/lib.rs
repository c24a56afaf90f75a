#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Scalers ⚖️
//!
//! A Rust library for reading Bluetooth Low Energy body scales through their
//! vendor protocols.
//!
//! Every supported scale family speaks its own reverse-engineered wire
//! protocol: different framing, checksums, multi-packet payloads, user
//! negotiation and, for one family, AES encryption. This crate implements
//! those protocols as sans-I/O codecs driven by a small step sequencer, and
//! runs them over [btleplug](https://docs.rs/btleplug) with tokio.
//!
//! ## Supported Families
//!
//! | family | pattern |
//! |---|---|
//! | OKOK / Chipsea | advertisement only, single shot |
//! | Trisa Body Analyze | challenge/response pairing |
//! | Beurer BF700/BF800, Sanitas SBF70 | multi-user, two-part measurements |
//! | Bluetooth SIG weight scale / body composition | user registration with consent codes |
//! | Huawei AH100 | AES-CTR encryption, keep-alive |
//!
//! ## Architecture
//!
//! - A [`DeviceCodec`] queues [`TransportCommand`]s per protocol step and
//!   decodes inbound packets.
//! - A [`Session`] binds a codec to a [`StepSequencer`], the local user
//!   profile, a [`MeasurementSink`] and a [`SettingsStore`], and guarantees
//!   each weighing is emitted once.
//! - A [`ScaleDevice`] executes the session against a [`Transport`], here
//!   [`BleTransport`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use scalers::{
//!     BleScanner, ChannelSink, ConnectionParams, MemorySettings, ScaleDevice, ScaleUser,
//!     SessionEnv, SinkEvent, TimeoutConfig,
//! };
//!
//! # async fn weigh(user: ScaleUser) -> Result<(), Box<dyn std::error::Error>> {
//! let scanner = BleScanner::new().await?;
//! let params = ConnectionParams::default();
//! let device = scanner.scan(&params).await?.into_iter().next().ok_or("no scale found")?;
//!
//! let (sink, mut events) = ChannelSink::channel();
//! let env = SessionEnv::new(device.clone(), user, Arc::new(sink), Arc::new(MemorySettings::new()));
//! let scale = ScaleDevice::open(&scanner, &device, env, &params, TimeoutConfig::default()).await?;
//!
//! tokio::spawn(scale.run());
//! while let Some(event) = events.recv().await {
//!     if let SinkEvent::Measurement(m) = event {
//!         println!("{:.2} kg", m.weight_kg);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Bluetooth Low Energy scanning and transport
pub mod ble;
/// Body composition estimates from impedance
pub mod bodycomp;
/// AES-CTR and MAC obfuscation
pub mod cipher;
/// Per-family wire protocols
pub mod codec;
/// Async driver running a session over a transport
pub mod device;
/// Error types and handling
pub mod error;
/// Checksums, byte order helpers and multi-part reassembly
pub mod framing;
/// Measurement records
pub mod measurement;
/// Step sequencing state machine
pub mod sequencer;
/// Protocol session and its environment
pub mod session;
/// Settings store port and remote user mapping
pub mod settings;
/// Measurement sink port
pub mod sink;
/// Transport port between codecs and the BLE stack
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BleScanner, BleTransport};
pub use codec::{codec_for, Decoded, DeviceCodec, DeviceFamily};
pub use device::ScaleDevice;
pub use error::{Result, ScaleError};
pub use measurement::{Measurement, PendingMeasurement};
pub use sequencer::{StepControl, StepSequencer};
pub use session::{Session, SessionEnv};
pub use settings::{MemorySettings, RemoteUsers, SettingsStore};
pub use sink::{ChannelSink, MeasurementSink, RecordingSink, SinkEvent};
pub use transport::{Transport, TransportCommand, TransportEvent};
pub use types::{
    ConnectionParams, ConnectionStatus, DeviceInfo, Gender, InfoCode, ScaleUser, TimeoutConfig,
    WeightUnit,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
