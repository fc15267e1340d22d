//! CLI Exit Codes
//!
//! Process exit codes for scripted use of the command-line front end.

use crate::config::ConfigError;
use crate::core::device::DeviceError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Opening the serial line failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// The slave device did not answer
    pub const NO_RESPONSE: u8 = 4;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Broken, truncated or corrupt frame
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Operation cancelled or timed out
    pub const CANCELLED: u8 = 11;

    /// Master or device busy with another exchange or operation
    pub const DEVICE_BUSY: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Device not ready for the command
    pub const NOT_READY: u8 = 15;

    /// Device reported a different value than the one written
    pub const VALIDATION_FAILED: u8 = 17;

    /// Dispense did not pay out
    pub const DISPENSE_FAILED: u8 = 18;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success carrying a message for the user
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// The serial line could not be opened
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::CONNECTION_FAILED, msg.into())
    }

    /// The port does not exist
    pub fn port_not_found(port: &str) -> Self {
        Self::Error(ExitCodes::PORT_NOT_FOUND, format!("Port not found: {}", port))
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::PORT_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::NO_RESPONSE,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        let code = match &err {
            TransportError::Busy(_) => ExitCodes::DEVICE_BUSY,
            TransportError::Unavailable | TransportError::ConnectionFailed(_) => {
                ExitCodes::CONNECTION_FAILED
            }
            TransportError::NoResponse | TransportError::Timeout(_) => ExitCodes::NO_RESPONSE,
            TransportError::InvalidChecksum(_)
            | TransportError::InvalidFrame(_)
            | TransportError::PayloadTooLong(_) => ExitCodes::PROTOCOL_ERROR,
            TransportError::NotConfigured => ExitCodes::CONFIG_ERROR,
            TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::IoError(io) => return Self::from(std::io::Error::from(io.kind())),
        };
        Self::Error(code, err.to_string())
    }
}

impl From<DeviceError> for CliResult {
    fn from(err: DeviceError) -> Self {
        let code = match err {
            DeviceError::Transport(transport) => return Self::from(transport),
            DeviceError::IncompleteMessage { .. } => ExitCodes::PROTOCOL_ERROR,
            DeviceError::OperationConflict => ExitCodes::DEVICE_BUSY,
            DeviceError::VerificationMismatch { .. } => ExitCodes::VALIDATION_FAILED,
            DeviceError::NotReady => ExitCodes::NOT_READY,
            DeviceError::InvalidArgument(_) => ExitCodes::INVALID_ARGS,
            DeviceError::Cancelled => ExitCodes::CANCELLED,
            DeviceError::BillNotDispensed | DeviceError::DispenseRefused { .. } => {
                ExitCodes::DISPENSE_FAILED
            }
            DeviceError::Aborted(_) => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Device does not respond",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        13 => "Device busy",
        14 => "Port not found",
        15 => "Device not ready",
        17 => "Validation failed",
        18 => "Dispense failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 7, 8, 9, 11, 13, 14, 15, 17, 18, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::MasterState;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);
        assert_eq!(success.message(), None);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::PORT_NOT_FOUND);
    }

    #[test]
    fn test_from_transport_error() {
        assert_eq!(
            CliResult::from(TransportError::NoResponse).code(),
            ExitCodes::NO_RESPONSE
        );
        assert_eq!(
            CliResult::from(TransportError::Busy(MasterState::Sending)).code(),
            ExitCodes::DEVICE_BUSY
        );
        assert_eq!(
            CliResult::from(TransportError::InvalidChecksum("01 00 02 00 00".into())).code(),
            ExitCodes::PROTOCOL_ERROR
        );
    }

    #[test]
    fn test_from_device_error() {
        let wrapped = DeviceError::Transport(TransportError::Unavailable);
        assert_eq!(CliResult::from(wrapped).code(), ExitCodes::CONNECTION_FAILED);

        let mismatch = DeviceError::VerificationMismatch {
            requested: 0x3f,
            actual: 0x01,
        };
        assert_eq!(CliResult::from(mismatch).code(), ExitCodes::VALIDATION_FAILED);
        assert_eq!(CliResult::from(DeviceError::Cancelled).code(), ExitCodes::CANCELLED);
        assert_eq!(
            CliResult::from(DeviceError::OperationConflict).code(),
            ExitCodes::DEVICE_BUSY
        );
        let refused = DeviceError::DispenseRefused {
            code: 0xA7,
            reason: "false bill type or none filled",
        };
        assert_eq!(CliResult::from(refused).code(), ExitCodes::DISPENSE_FAILED);
    }

    #[test]
    fn test_every_code_is_described() {
        for code in [0, 1, 2, 3, 4, 7, 8, 9, 11, 13, 14, 15, 17, 18, 127] {
            assert_ne!(exit_code_description(code), "Unknown error");
        }
        assert_eq!(exit_code_description(200), "Unknown error");
    }
}
