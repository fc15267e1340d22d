//! # ccTalk Core Library
//!
//! Master side of the ccTalk serial bus protocol, with a driver for the
//! MD-100 bill acceptor/dispenser.
//!
//! ## Features
//!
//! - Frame codec with the simple 8-bit checksum
//! - Half-duplex transport engine with echo suppression and busy tracking
//! - Generic slave command dispatcher
//! - Buffered event deduplication and readiness tracking
//! - Single-flight, cancellable macro operations with timeouts
//! - TOML configuration and a CLI with exit codes
//!
//! ## Example
//!
//! ```rust,no_run
//! use cctalk_core::{MasterDevice, Md100, Md100Options, SerialConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let master = Arc::new(MasterDevice::new(1));
//!     master.configure(SerialConfig::new("/dev/ttyUSB0", 9600));
//!     master.connect().await?;
//!
//!     let device = Md100::new(master.add_slave(40), Md100Options::default());
//!     device.start_polling();
//!
//!     let result = device.init(None)?.join().await;
//!     println!("init: {:?}", result.into_result());
//!
//!     let mut rx = device.subscribe();
//!     while let Ok(notification) = rx.recv().await {
//!         println!("{:?}", notification);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::AppConfig;
pub use crate::core::device::md100::{DispenseSlot, Md100, Md100Options};
pub use crate::core::device::{
    DeviceError, DeviceEvent, DeviceNotification, DeviceState, OperationResult, SlaveDevice,
};
pub use crate::core::protocol::Message;
pub use crate::core::transport::{MasterDevice, SerialConfig, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
