//! The seam between the engine and the BLE controller/stack.
//!
//! Every request is fire-and-forget: the call only reports whether the
//! controller accepted it, and the outcome arrives later as a
//! [`ControllerEvent`] on the peripheral's event channel. Nothing here
//! blocks waiting for the radio.

use std::fmt;

use thiserror::Error;

use crate::advertising::{AdvParams, AdvPayload, ScanResponsePayload};
use crate::codec::IdentityKey;
use crate::gatt::AttributeDef;
use crate::security::{EncryptionLevel, SecurityParams};
use crate::types::Address;

/// Completion status reported by the controller. Zero means success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    /// The success status.
    pub const OK: Self = Self(0);

    /// Returns `true` for the success status.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({self})")
    }
}

/// Outcome of a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Pairing and bonding completed.
    Success,
    /// Pairing failed with the given SMP reason code.
    Failed {
        /// Reason code reported by the controller.
        reason: u8,
    },
}

/// Key material distributed by the peer during bonding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangedKey {
    /// The peer's Identity Resolving Key.
    Identity(IdentityKey),
    /// Long Term Key / encryption information. Not retained.
    Encryption,
    /// Connection Signature Resolving Key. Not retained.
    Signing,
}

/// Asynchronous notifications from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The GATT application registration finished.
    RegistrationComplete {
        /// Completion status.
        status: Status,
    },
    /// The attribute table submitted by `create_attribute_table` exists.
    AttributeTableCreated {
        /// Completion status.
        status: Status,
        /// Handles assigned to each attribute, in table order.
        handles: Vec<u16>,
    },
    /// `start_service` finished.
    ServiceStarted {
        /// Completion status.
        status: Status,
        /// The service declaration handle.
        service_handle: u16,
    },
    /// A central connected.
    PeerConnected {
        /// The peer's address as seen on the link.
        address: Address,
    },
    /// A central disconnected.
    PeerDisconnected {
        /// The peer's address as seen on the link.
        address: Address,
        /// HCI disconnect reason.
        reason: u8,
    },
    /// `configure_local_privacy` finished.
    LocalPrivacyConfigured {
        /// Completion status.
        status: Status,
    },
    /// `configure_adv_payload` finished.
    AdvPayloadConfigured {
        /// Completion status.
        status: Status,
    },
    /// `configure_scan_response` finished.
    ScanResponseConfigured {
        /// Completion status.
        status: Status,
    },
    /// `start_advertising` finished.
    AdvertisingStarted {
        /// Completion status.
        status: Status,
    },
    /// The controller is displaying a passkey.
    PasskeyNotification {
        /// The pairing peer.
        address: Address,
        /// Six-digit passkey.
        passkey: u32,
    },
    /// The controller asks whether the numeric comparison value matches.
    NumericComparisonRequest {
        /// The pairing peer.
        address: Address,
        /// The value to compare.
        passkey: u32,
    },
    /// The peer requested security on the link.
    SecurityRequest {
        /// The requesting peer.
        address: Address,
    },
    /// Pairing finished.
    AuthenticationComplete {
        /// The pairing peer.
        address: Address,
        /// Success or failure reason.
        outcome: AuthOutcome,
    },
    /// The peer distributed a key.
    KeyReceived {
        /// The pairing peer.
        address: Address,
        /// The distributed key.
        key: ExchangedKey,
    },
}

/// A request the engine can submit. Used for logging and by test doubles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerRequest {
    /// `set_security_params`.
    SetSecurityParams,
    /// `register_application`.
    RegisterApplication,
    /// `set_device_name`.
    SetDeviceName(String),
    /// `set_random_address`.
    SetRandomAddress(Address),
    /// `configure_local_privacy`.
    ConfigureLocalPrivacy(bool),
    /// `configure_adv_payload`.
    ConfigureAdvPayload,
    /// `configure_scan_response`.
    ConfigureScanResponse,
    /// `start_advertising`.
    StartAdvertising,
    /// `create_attribute_table` with the given number of attributes.
    CreateAttributeTable(usize),
    /// `start_service`.
    StartService(u16),
    /// `set_encryption`.
    SetEncryption(Address, EncryptionLevel),
    /// `confirm_numeric`.
    ConfirmNumeric(Address, bool),
    /// `respond_security_request`.
    RespondSecurityRequest(Address, bool),
}

impl ControllerRequest {
    /// Short stable name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetSecurityParams => "set_security_params",
            Self::RegisterApplication => "register_application",
            Self::SetDeviceName(_) => "set_device_name",
            Self::SetRandomAddress(_) => "set_random_address",
            Self::ConfigureLocalPrivacy(_) => "configure_local_privacy",
            Self::ConfigureAdvPayload => "configure_adv_payload",
            Self::ConfigureScanResponse => "configure_scan_response",
            Self::StartAdvertising => "start_advertising",
            Self::CreateAttributeTable(_) => "create_attribute_table",
            Self::StartService(_) => "start_service",
            Self::SetEncryption(..) => "set_encryption",
            Self::ConfirmNumeric(..) => "confirm_numeric",
            Self::RespondSecurityRequest(..) => "respond_security_request",
        }
    }
}

/// A request the controller refused to accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// The controller rejected the request with a status code.
    #[error("Controller rejected {request}: status {status}")]
    Rejected {
        /// Which request was rejected.
        request: &'static str,
        /// Status returned by the controller.
        status: Status,
    },

    /// The controller or its transport is not available.
    #[error("Bluetooth controller unavailable: {0}")]
    Unavailable(String),

    /// The stack cannot apply the requested setting as configured.
    #[error("Not supported by the Bluetooth stack: {0}")]
    Unsupported(String),
}

/// Result of submitting a controller request.
pub type ControllerResult = Result<(), ControllerError>;

/// Requests the engine submits to the BLE controller.
///
/// Implementations must not block; completions are delivered as
/// [`ControllerEvent`]s.
pub trait BleController: Send + Sync {
    /// Apply the Security Manager parameters.
    fn set_security_params(&self, params: &SecurityParams) -> ControllerResult;

    /// Register the GATT application. Completes with
    /// [`ControllerEvent::RegistrationComplete`].
    fn register_application(&self) -> ControllerResult;

    /// Set the advertised device name.
    fn set_device_name(&self, name: &str) -> ControllerResult;

    /// Set the static random address used as own address.
    fn set_random_address(&self, address: Address) -> ControllerResult;

    /// Enable or disable local privacy (resolvable private addresses).
    /// Completes with [`ControllerEvent::LocalPrivacyConfigured`].
    fn configure_local_privacy(&self, enable: bool) -> ControllerResult;

    /// Set the primary advertising payload. Completes with
    /// [`ControllerEvent::AdvPayloadConfigured`].
    fn configure_adv_payload(&self, payload: &AdvPayload) -> ControllerResult;

    /// Set the scan-response payload. Completes with
    /// [`ControllerEvent::ScanResponseConfigured`].
    fn configure_scan_response(&self, payload: &ScanResponsePayload) -> ControllerResult;

    /// Start (or restart) advertising. Completes with
    /// [`ControllerEvent::AdvertisingStarted`].
    fn start_advertising(&self, params: &AdvParams) -> ControllerResult;

    /// Create the attribute table. Completes with
    /// [`ControllerEvent::AttributeTableCreated`].
    fn create_attribute_table(&self, table: &[AttributeDef]) -> ControllerResult;

    /// Start the service whose declaration has `service_handle`.
    fn start_service(&self, service_handle: u16) -> ControllerResult;

    /// Request link encryption at `level` with `peer`.
    fn set_encryption(&self, peer: Address, level: EncryptionLevel) -> ControllerResult;

    /// Answer a numeric comparison request.
    fn confirm_numeric(&self, peer: Address, accept: bool) -> ControllerResult;

    /// Answer a peer's security request.
    fn respond_security_request(&self, peer: Address, accept: bool) -> ControllerResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_and_ok() {
        assert!(Status::OK.is_ok());
        assert!(!Status(0x85).is_ok());
        assert_eq!(Status(0x85).to_string(), "0x85");
    }

    #[test]
    fn test_rejected_error_message() {
        let err = ControllerError::Rejected {
            request: ControllerRequest::StartAdvertising.name(),
            status: Status(0x103),
        };
        assert_eq!(
            err.to_string(),
            "Controller rejected start_advertising: status 0x103"
        );
    }
}
