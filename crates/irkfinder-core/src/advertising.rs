//! Advertising bring-up state machine.
//!
//! ```text
//! Idle ──begin──▶ PrivacyPending ──privacy ok──▶ PayloadsPending ──both confirmed──▶ Advertising
//!                        │                                                     ▲        │
//!                   privacy failed                                             └─disconnect
//!                        ▼
//!                      Halted
//! ```
//!
//! The advertising payload and scan response are configured by two
//! independent requests whose confirmations may arrive in either order.
//! Advertising starts exactly once, when the last pending confirmation lands.

use bitflags::bitflags;
use tracing::{debug, error, info, warn};

use crate::controller::{BleController, Status};

/// 128-bit UUID advertised in the primary payload, in on-air byte order
/// (`00000d18-0000-1000-8000-00805f9b34fb`). iOS only offers to pair with
/// peripherals advertising a service, and this one is known to work.
pub const SERVICE_UUID_128: [u8; 16] = [
    0xfb, 0x34, 0x9b, 0x5f, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x18, 0x0d, 0x00, 0x00,
];

bitflags! {
    /// Payload configurations still awaiting confirmation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PendingConfig: u8 {
        /// Primary advertising payload.
        const ADV_DATA = 1 << 0;
        /// Scan-response payload.
        const SCAN_RESPONSE = 1 << 1;
    }
}

bitflags! {
    /// Advertising data flags (AD type 0x01).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdvFlags: u8 {
        /// LE Limited Discoverable Mode.
        const LIMITED_DISCOVERABLE = 1 << 0;
        /// LE General Discoverable Mode.
        const GENERAL_DISCOVERABLE = 1 << 1;
        /// BR/EDR Not Supported.
        const BREDR_NOT_SUPPORTED = 1 << 2;
    }
}

/// Primary advertising payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvPayload {
    /// AD flags.
    pub flags: AdvFlags,
    /// Whether to include the TX power level.
    pub include_tx_power: bool,
    /// Preferred minimum connection interval, in 1.25 ms units.
    pub min_conn_interval: u16,
    /// Preferred maximum connection interval, in 1.25 ms units.
    pub max_conn_interval: u16,
    /// GAP appearance value.
    pub appearance: u16,
    /// Advertised 128-bit service UUID, little-endian.
    pub service_uuid: [u8; 16],
}

/// Scan-response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResponsePayload {
    /// Complete local name.
    pub local_name: String,
    /// Manufacturer-specific data.
    pub manufacturer_data: Vec<u8>,
}

/// Advertising PDU type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvType {
    /// Connectable undirected (`ADV_IND`).
    ConnectableUndirected,
}

/// Own address type used while advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnAddressType {
    /// Public device address.
    Public,
    /// Random (static or private) address.
    Random,
}

/// Advertising parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvParams {
    /// Minimum advertising interval, in 0.625 ms units.
    pub interval_min: u16,
    /// Maximum advertising interval, in 0.625 ms units.
    pub interval_max: u16,
    /// PDU type.
    pub adv_type: AdvType,
    /// Own address type.
    pub own_address_type: OwnAddressType,
    /// Primary channel map bitmask (bit 0 = ch 37).
    pub channel_map: u8,
    /// Whether any device may scan and connect.
    pub allow_any: bool,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            interval_min: 0x100,
            interval_max: 0x100,
            adv_type: AdvType::ConnectableUndirected,
            own_address_type: OwnAddressType::Random,
            channel_map: 0b111,
            allow_any: true,
        }
    }
}

/// Everything the controller needs to advertise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingConfig {
    /// Primary payload.
    pub payload: AdvPayload,
    /// Scan response.
    pub scan_response: ScanResponsePayload,
    /// Advertising parameters.
    pub params: AdvParams,
}

impl AdvertisingConfig {
    /// The standard configuration advertising `local_name` in the scan response.
    #[must_use]
    pub fn new(local_name: impl Into<String>, manufacturer_data: Vec<u8>) -> Self {
        Self {
            payload: AdvPayload {
                flags: AdvFlags::GENERAL_DISCOVERABLE | AdvFlags::BREDR_NOT_SUPPORTED,
                include_tx_power: true,
                min_conn_interval: 0x0006,
                max_conn_interval: 0x0010,
                appearance: 0,
                service_uuid: SERVICE_UUID_128,
            },
            scan_response: ScanResponsePayload {
                local_name: local_name.into(),
                manufacturer_data,
            },
            params: AdvParams::default(),
        }
    }
}

/// States of the advertising bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingState {
    /// Nothing requested yet.
    Idle,
    /// Waiting for local privacy confirmation.
    PrivacyPending,
    /// Waiting for the listed payload confirmations.
    PayloadsPending(PendingConfig),
    /// Advertising has been requested.
    Advertising,
    /// Bring-up failed; advertising is unavailable until restart.
    Halted,
}

/// Drives privacy → payloads → advertising.
#[derive(Debug)]
pub struct AdvertisingController {
    state: AdvertisingState,
    config: AdvertisingConfig,
    start_requests: u32,
}

impl AdvertisingController {
    /// A controller in the `Idle` state.
    #[must_use]
    pub const fn new(config: AdvertisingConfig) -> Self {
        Self {
            state: AdvertisingState::Idle,
            config,
            start_requests: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AdvertisingState {
        self.state
    }

    /// Number of start-advertising requests issued so far.
    #[must_use]
    pub const fn start_requests(&self) -> u32 {
        self.start_requests
    }

    /// Request local privacy. Advertising needs a non-public address.
    pub fn begin(&mut self, ctl: &dyn BleController) {
        if self.state != AdvertisingState::Idle {
            debug!(state = ?self.state, "Advertising bring-up already started");
            return;
        }

        match ctl.configure_local_privacy(true) {
            Ok(()) => self.state = AdvertisingState::PrivacyPending,
            Err(e) => {
                error!(error = %e, "Local privacy request rejected, advertising halted");
                self.state = AdvertisingState::Halted;
            }
        }
    }

    /// Handle the local privacy confirmation.
    pub fn on_privacy_configured(&mut self, ctl: &dyn BleController, status: Status) {
        if self.state != AdvertisingState::PrivacyPending {
            debug!(state = ?self.state, "Ignoring unexpected privacy confirmation");
            return;
        }

        if !status.is_ok() {
            error!(%status, "Local privacy configuration failed, advertising halted");
            self.state = AdvertisingState::Halted;
            return;
        }

        let mut pending = PendingConfig::empty();
        match ctl.configure_adv_payload(&self.config.payload) {
            Ok(()) => pending |= PendingConfig::ADV_DATA,
            Err(e) => error!(error = %e, "Advertising payload request rejected"),
        }
        match ctl.configure_scan_response(&self.config.scan_response) {
            Ok(()) => pending |= PendingConfig::SCAN_RESPONSE,
            Err(e) => error!(error = %e, "Scan response request rejected"),
        }

        if pending.is_empty() {
            error!("No advertising payload accepted, advertising halted");
            self.state = AdvertisingState::Halted;
        } else {
            self.state = AdvertisingState::PayloadsPending(pending);
        }
    }

    /// Handle the primary payload confirmation.
    pub fn on_adv_payload_configured(&mut self, ctl: &dyn BleController, status: Status) {
        self.on_payload_configured(ctl, PendingConfig::ADV_DATA, status);
    }

    /// Handle the scan-response confirmation.
    pub fn on_scan_response_configured(&mut self, ctl: &dyn BleController, status: Status) {
        self.on_payload_configured(ctl, PendingConfig::SCAN_RESPONSE, status);
    }

    fn on_payload_configured(
        &mut self,
        ctl: &dyn BleController,
        which: PendingConfig,
        status: Status,
    ) {
        let AdvertisingState::PayloadsPending(mut pending) = self.state else {
            debug!(state = ?self.state, ?which, "Ignoring payload confirmation");
            return;
        };

        if !status.is_ok() {
            warn!(?which, %status, "Payload configuration reported failure");
        }

        pending.remove(which);
        if pending.is_empty() {
            self.state = AdvertisingState::Advertising;
            self.request_start(ctl);
        } else {
            self.state = AdvertisingState::PayloadsPending(pending);
        }
    }

    /// Log the advertising-start completion. Failures are recoverable: the
    /// next disconnect retries.
    pub fn on_advertising_started(&self, status: Status) {
        if status.is_ok() {
            info!(
                name = %self.config.scan_response.local_name,
                "Advertising started"
            );
        } else {
            error!(%status, "Advertising start failed");
        }
    }

    /// Resume advertising after a peer disconnects.
    pub fn on_peer_disconnected(&mut self, ctl: &dyn BleController) {
        if self.state == AdvertisingState::Advertising {
            self.request_start(ctl);
        } else {
            debug!(state = ?self.state, "Disconnect before advertising, nothing to resume");
        }
    }

    fn request_start(&mut self, ctl: &dyn BleController) {
        self.start_requests += 1;
        if let Err(e) = ctl.start_advertising(&self.config.params) {
            error!(error = %e, "Start advertising request rejected");
        }
    }
}
