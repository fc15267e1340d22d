//! Transport layer for the ccTalk bus
//!
//! Provides:
//! - The [`SerialLine`] seam over the physical half-duplex line
//! - A tokio-serial backed implementation
//! - [`MasterDevice`], the engine serializing every exchange on the bus

mod master;
mod serial;

pub use master::{LineTraffic, MasterDevice, TrafficDirection, DEFAULT_MASTER_ADDRESS, DEFAULT_TIMEOUT};
pub use serial::{
    list_ports, SerialConfig, SerialFlowControl, SerialLineFactory, SerialParity, TokioSerialLine,
};

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// A send or receive was attempted while another one was in progress
    #[error("Master device is busy ({0})")]
    Busy(MasterState),

    /// The line is not open
    #[error("Master device is not available")]
    Unavailable,

    /// Nothing arrived before the timeout expired
    #[error("Slave device does not respond")]
    NoResponse,

    /// A complete frame failed the checksum test
    #[error("Invalid checksum in frame {0}")]
    InvalidChecksum(String),

    /// Bytes that cannot be interpreted as a frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Payload longer than the length byte allows
    #[error("Payload of {0} bytes does not fit into one frame")]
    PayloadTooLong(usize),

    /// Line operation timeout
    #[error("Line operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connect was requested before any serial settings were supplied
    #[error("Serial line is not configured")]
    NotConfigured,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Busy indicator of a master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterState {
    /// No I/O in progress
    Idle = 0,
    /// A frame is being written
    Sending = 1,
    /// A reply is being read
    Receiving = 2,
}

impl MasterState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Sending,
            2 => Self::Receiving,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Sending => write!(f, "sending"),
            Self::Receiving => write!(f, "receiving"),
        }
    }
}

/// Three-state busy flag shared by every caller of one master
#[derive(Debug, Default)]
pub(crate) struct BusyFlag(AtomicU8);

impl BusyFlag {
    pub(crate) fn get(&self) -> MasterState {
        MasterState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from idle to `next`; the guard restores idle when dropped
    pub(crate) fn begin(&self, next: MasterState) -> Result<BusyGuard<'_>, TransportError> {
        self.0
            .compare_exchange(
                MasterState::Idle as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| BusyGuard(self))
            .map_err(|current| TransportError::Busy(MasterState::from_u8(current)))
    }
}

/// Restores [`MasterState::Idle`] on every exit path
pub(crate) struct BusyGuard<'a>(&'a BusyFlag);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(MasterState::Idle as u8, Ordering::Release);
    }
}

/// Engine counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Frames written
    pub frames_sent: u64,
    /// Complete frames accepted
    pub frames_received: u64,
    /// Own transmissions skipped while reading
    pub echoes_skipped: u64,
    /// Receives that ended without a single byte
    pub no_response: u64,
    /// Receives that ended with a truncated frame
    pub partial_frames: u64,
    /// Frames rejected by the checksum test
    pub checksum_errors: u64,
    /// Swallowed write failures
    pub write_errors: u64,
}

/// Raw half-duplex line the master talks through
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SerialLine: Send {
    /// Drop any pending input and output
    fn discard_buffers(&mut self) -> Result<(), TransportError>;

    /// Write a whole frame
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read a single byte, waiting as long as needed
    async fn read_byte(&mut self) -> Result<u8, TransportError>;

    /// Human readable description of the line
    fn describe(&self) -> String;
}

/// Opens lines from serial settings
#[async_trait]
pub trait LineFactory: Send + Sync {
    /// Open a line with the given settings
    async fn open(&self, config: &SerialConfig) -> Result<Box<dyn SerialLine>, TransportError>;
}
