//! Unified error types for the irkfinder core library.
//!
//! [`IrkError`] covers every failure mode surfaced to the server and the
//! daemon binary. Each module keeps its own narrower error type
//! ([`ConfigError`](crate::config::ConfigError),
//! [`BondStoreError`](crate::bonds::BondStoreError),
//! [`ControllerError`](crate::controller::ControllerError)) and converts
//! into this one at the crate boundary.
//!
//! # Example
//!
//! ```rust
//! use irkfinder_core::controller::{ControllerError, Status};
//! use irkfinder_core::error::{IrkError, Result};
//!
//! fn start() -> Result<()> {
//!     let rejected = ControllerError::Rejected {
//!         request: "register_application",
//!         status: Status(0x103),
//!     };
//!     Err(rejected.into())
//! }
//!
//! assert_eq!(start().unwrap_err().error_code(), "CONTROLLER_REJECTED");
//! ```

use thiserror::Error;

/// The unified error type for all irkfinder operations.
#[derive(Debug, Error)]
pub enum IrkError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    BluetoothAdapterPoweredOff,

    /// The controller refused a request outright.
    #[error("Controller rejected {request} (status 0x{status:x})")]
    ControllerRejected {
        /// Name of the rejected request.
        request: &'static str,
        /// Status code returned by the controller.
        status: u16,
    },

    /// The Bluetooth stack could not be reached.
    #[error("Bluetooth stack unavailable: {0}")]
    ControllerUnavailable(String),

    /// A bring-up step failed and the peripheral is halted for this boot.
    #[error("Peripheral bring-up failed: {0}")]
    BringUpFailed(String),

    // =========================================================================
    // BOND STORE ERRORS
    // =========================================================================
    /// The bond database could not be read.
    #[error("Bond store unavailable: {0}")]
    BondStoreUnavailable(String),

    /// A bonded peer could not be removed.
    #[error("Failed to remove bond for {address}: {message}")]
    BondRemovalFailed {
        /// Address of the peer.
        address: String,
        /// Underlying failure.
        message: String,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PLATFORM & I/O ERRORS
    // =========================================================================
    /// No platform configuration directory could be determined.
    #[error("Cannot determine config directory")]
    NoConfigDir,

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for irkfinder operations.
pub type Result<T> = std::result::Result<T, IrkError>;

impl IrkError {
    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothAdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::ControllerRejected { .. } => "CONTROLLER_REJECTED",
            Self::ControllerUnavailable(_) => "CONTROLLER_UNAVAILABLE",
            Self::BringUpFailed(_) => "BRING_UP_FAILED",
            Self::BondStoreUnavailable(_) => "BOND_STORE_UNAVAILABLE",
            Self::BondRemovalFailed { .. } => "BOND_REMOVAL_FAILED",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::NoConfigDir => "NO_CONFIG_DIR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for IrkError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
            ConfigError::NoConfigDir => Self::NoConfigDir,
        }
    }
}

impl From<crate::bonds::BondStoreError> for IrkError {
    fn from(err: crate::bonds::BondStoreError) -> Self {
        use crate::bonds::BondStoreError;
        match err {
            BondStoreError::Unavailable(message) => Self::BondStoreUnavailable(message),
            BondStoreError::RemoveFailed { address, message } => Self::BondRemovalFailed {
                address: address.to_string(),
                message,
            },
        }
    }
}

impl From<crate::controller::ControllerError> for IrkError {
    fn from(err: crate::controller::ControllerError) -> Self {
        use crate::controller::ControllerError;
        match err {
            ControllerError::Rejected { request, status } => Self::ControllerRejected {
                request,
                status: status.0,
            },
            ControllerError::Unavailable(message) => Self::ControllerUnavailable(message),
            ControllerError::Unsupported(message) => Self::BringUpFailed(message),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    use crate::bonds::BondStoreError;
    use crate::config::ConfigError;
    use crate::controller::{ControllerError, Status};
    use crate::types::Address;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            IrkError::BluetoothAdapterNotFound.error_code(),
            "BLUETOOTH_ADAPTER_NOT_FOUND"
        );
        assert_eq!(
            IrkError::BringUpFailed("privacy".into()).error_code(),
            "BRING_UP_FAILED"
        );
        assert_eq!(IrkError::NoConfigDir.error_code(), "NO_CONFIG_DIR");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::PermissionDenied, "main.conf");
        let err: IrkError = io_err.into();
        assert!(matches!(err, IrkError::IoError(_)));
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_from_module_errors() {
        let err: IrkError = BondStoreError::RemoveFailed {
            address: Address::new([0xC0, 1, 2, 3, 4, 5]),
            message: "busy".into(),
        }
        .into();
        assert!(err.to_string().contains("C0:01:02:03:04:05"));

        let err: IrkError = ControllerError::Rejected {
            request: "start_advertising",
            status: Status(0x103),
        }
        .into();
        assert!(err.to_string().contains("start_advertising"));
        assert!(err.to_string().contains("0x103"));

        let err: IrkError = ControllerError::Unsupported("privacy is off".into()).into();
        assert!(matches!(err, IrkError::BringUpFailed(_)));
        assert!(err.to_string().contains("privacy is off"));

        let err: IrkError = ConfigError::ValidationError {
            field: "ble.passkey",
            message: "too large".into(),
        }
        .into();
        assert_eq!(err.error_code(), "CONFIG_VALIDATION_ERROR");
        assert!(err.to_string().contains("ble.passkey"));
    }

    #[test]
    fn test_error_display_messages() {
        let err = IrkError::BluetoothAdapterNotFound;
        assert!(format!("{err}").contains("No Bluetooth adapter found"));

        let err = IrkError::BluetoothAdapterPoweredOff;
        assert!(format!("{err}").contains("bluetoothctl power on"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<IrkError>();
        assert_sync::<IrkError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn example_function() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(example_function().unwrap(), 42);

        fn failing_function() -> Result<i32> {
            Err(IrkError::NoConfigDir)
        }
        assert!(failing_function().is_err());
    }
}
