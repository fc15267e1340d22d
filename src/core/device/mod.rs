//! Slave devices
//!
//! - [`SlaveDevice`]: generic ccTalk command dispatcher
//! - [`DeviceStateMachine`]: buffered-event deduplication and readiness
//! - [`MacroExecutor`]: single-flight, cancellable device procedures
//! - [`md100`]: the concrete bill acceptor/dispenser built on top of them

pub mod bill_types;
pub mod events;
pub mod macros;
pub mod md100;
pub mod slave;
pub mod state_machine;

pub use bill_types::{BillType, BillTypeTable, BILL_TYPE_COUNT};
pub use events::{DeviceEvent, DeviceState, EventLog};
pub use macros::{MacroExecutor, OperationHandle, OperationResult};
pub use md100::Md100;
pub use slave::{CommsRevision, EventBuffer, ScalingFactor, SlaveDevice};
pub use state_machine::{DeviceNotification, DeviceStateMachine, Property};

use crate::core::transport::TransportError;
use thiserror::Error;

/// Device level error types
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Failure raised by the transport engine
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Reply shorter than the command requires
    #[error("Incomplete message for {command}: expected {expected} bytes, got {received}")]
    IncompleteMessage {
        /// Command name
        command: &'static str,
        /// Minimum payload length
        expected: usize,
        /// Received payload length
        received: usize,
    },

    /// A macro operation is already running on this device
    #[error("Another operation is executing")]
    OperationConflict,

    /// Value read back differs from the one written
    #[error("Verification failed: requested {requested:#08x}, device reports {actual:#08x}")]
    VerificationMismatch {
        /// Requested value
        requested: u32,
        /// Value read back
        actual: u32,
    },

    /// Command requires a ready device
    #[error("Operation is not allowed while the device is not ready")]
    NotReady,

    /// Bad argument for a command
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation cancelled (explicitly or by timeout)
    #[error("Operation cancelled")]
    Cancelled,

    /// Fill size dropped but the bill never reached the customer
    #[error("Bill was not dispensed")]
    BillNotDispensed,

    /// The device declined a payout
    #[error("Dispense refused: {reason} ({code:#04x})")]
    DispenseRefused {
        /// Payout code
        code: u8,
        /// Payout code text
        reason: &'static str,
    },

    /// Operation task ended abnormally
    #[error("Operation aborted: {0}")]
    Aborted(String),
}

impl DeviceError {
    /// Whether the error is a plain "device does not answer"
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::Transport(TransportError::NoResponse))
    }
}
