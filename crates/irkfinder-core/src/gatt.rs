//! GATT service registration.
//!
//! The attribute table is static. It exists to give the central something
//! to connect to and to put encrypted characteristics behind pairing; none
//! of its values are ever updated.

use bitflags::bitflags;
use tracing::{error, info, warn};

use crate::advertising::AdvertisingController;
use crate::controller::{BleController, Status};
use crate::types::Address;

/// Primary Service declaration.
pub const UUID_PRIMARY_SERVICE: u16 = 0x2800;
/// Characteristic declaration.
pub const UUID_CHARACTERISTIC: u16 = 0x2803;
/// Client Characteristic Configuration descriptor.
pub const UUID_CLIENT_CONFIG: u16 = 0x2902;
/// Heart Rate service.
pub const UUID_HEART_RATE_SERVICE: u16 = 0x180D;
/// Heart Rate Measurement characteristic.
pub const UUID_HEART_RATE_MEASUREMENT: u16 = 0x2A37;
/// Body Sensor Location characteristic.
pub const UUID_BODY_SENSOR_LOCATION: u16 = 0x2A38;
/// Heart Rate Control Point characteristic.
pub const UUID_HEART_RATE_CONTROL_POINT: u16 = 0x2A39;

bitflags! {
    /// Attribute access permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Readable.
        const READ = 1 << 0;
        /// Readable over an encrypted link.
        const READ_ENCRYPTED = 1 << 1;
        /// Writable.
        const WRITE = 1 << 4;
        /// Writable over an encrypted link.
        const WRITE_ENCRYPTED = 1 << 5;
    }
}

bitflags! {
    /// Characteristic properties carried in a characteristic declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharProps: u8 {
        /// Read.
        const READ = 0x02;
        /// Write.
        const WRITE = 0x08;
        /// Notify.
        const NOTIFY = 0x10;
    }
}

/// One row of the attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDef {
    /// 16-bit attribute type.
    pub uuid: u16,
    /// Access permissions.
    pub permissions: Permissions,
    /// Maximum value length in bytes.
    pub max_len: u16,
    /// Initial value.
    pub value: &'static [u8],
}

impl AttributeDef {
    const fn new(uuid: u16, permissions: Permissions, max_len: u16, value: &'static [u8]) -> Self {
        Self {
            uuid,
            permissions,
            max_len,
            value,
        }
    }
}

/// Positions in [`ATTRIBUTE_TABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum AttrIndex {
    /// Service declaration.
    Service,
    /// Notify characteristic declaration.
    NotifyDecl,
    /// Notify characteristic value.
    NotifyValue,
    /// Notify characteristic CCC descriptor.
    NotifyConfig,
    /// Read-encrypted characteristic declaration.
    SensorDecl,
    /// Read-encrypted characteristic value.
    SensorValue,
    /// Read/write-encrypted characteristic declaration.
    ControlDecl,
    /// Read/write-encrypted characteristic value.
    ControlValue,
}

/// Number of attributes in the table.
pub const ATTRIBUTE_COUNT: usize = 8;

const SERVICE_UUID_LE: [u8; 2] = UUID_HEART_RATE_SERVICE.to_le_bytes();
const PROPS_NOTIFY: [u8; 1] = [CharProps::NOTIFY.bits()];
const PROPS_READ: [u8; 1] = [CharProps::READ.bits()];
const PROPS_READ_WRITE: [u8; 1] = [CharProps::READ.bits() | CharProps::WRITE.bits()];

/// The service's attribute table, in handle order.
pub static ATTRIBUTE_TABLE: [AttributeDef; ATTRIBUTE_COUNT] = [
    AttributeDef::new(UUID_PRIMARY_SERVICE, Permissions::READ, 2, &SERVICE_UUID_LE),
    AttributeDef::new(UUID_CHARACTERISTIC, Permissions::READ, 1, &PROPS_NOTIFY),
    AttributeDef::new(UUID_HEART_RATE_MEASUREMENT, Permissions::READ, 13, &[]),
    AttributeDef::new(
        UUID_CLIENT_CONFIG,
        Permissions::READ.union(Permissions::WRITE),
        2,
        &[0x00, 0x00],
    ),
    AttributeDef::new(UUID_CHARACTERISTIC, Permissions::READ, 1, &PROPS_READ),
    AttributeDef::new(UUID_BODY_SENSOR_LOCATION, Permissions::READ_ENCRYPTED, 1, &[0x00]),
    AttributeDef::new(UUID_CHARACTERISTIC, Permissions::READ, 1, &PROPS_READ_WRITE),
    AttributeDef::new(
        UUID_HEART_RATE_CONTROL_POINT,
        Permissions::READ_ENCRYPTED.union(Permissions::WRITE_ENCRYPTED),
        1,
        &[0x00],
    ),
];

/// States of the service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    /// Waiting for the application registration.
    Unregistered,
    /// Attribute table submitted.
    TablePending,
    /// `start_service` requested.
    ServiceStarting,
    /// Service running.
    Started,
    /// Registration failed; the service is unavailable until restart.
    Failed,
}

/// Registers the attribute table and starts the service.
#[derive(Debug)]
pub struct GattRegistrar {
    state: RegistrarState,
    device_name: String,
    random_address: Address,
    handles: Vec<u16>,
}

impl GattRegistrar {
    /// A registrar that will name the device `device_name`.
    pub fn new(device_name: impl Into<String>, random_address: Address) -> Self {
        Self {
            state: RegistrarState::Unregistered,
            device_name: device_name.into(),
            random_address,
            handles: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RegistrarState {
        self.state
    }

    /// Handles assigned to the table, once created.
    #[must_use]
    pub fn handles(&self) -> &[u16] {
        &self.handles
    }

    /// Handle of `index`, once the table exists.
    #[must_use]
    pub fn handle(&self, index: AttrIndex) -> Option<u16> {
        self.handles.get(index as usize).copied()
    }

    /// Name the device, set its address, enable privacy and submit the table.
    pub fn on_registration_complete(
        &mut self,
        ctl: &dyn BleController,
        advertising: &mut AdvertisingController,
        status: Status,
    ) {
        if self.state != RegistrarState::Unregistered {
            warn!(state = ?self.state, "Duplicate GATT registration event");
            return;
        }

        if !status.is_ok() {
            error!(%status, "GATT application registration failed");
            self.state = RegistrarState::Failed;
            return;
        }

        if let Err(e) = ctl.set_device_name(&self.device_name) {
            warn!(error = %e, "Setting device name failed");
        }
        if let Err(e) = ctl.set_random_address(self.random_address) {
            warn!(error = %e, "Setting random address failed");
        }
        advertising.begin(ctl);

        match ctl.create_attribute_table(&ATTRIBUTE_TABLE) {
            Ok(()) => self.state = RegistrarState::TablePending,
            Err(e) => {
                error!(error = %e, "Attribute table request rejected");
                self.state = RegistrarState::Failed;
            }
        }
    }

    /// Verify the created table and start the service.
    ///
    /// The handle count must match the table exactly; anything else means
    /// the stack and the table disagree and the service is not started.
    pub fn on_table_created(&mut self, ctl: &dyn BleController, status: Status, handles: &[u16]) {
        if self.state != RegistrarState::TablePending {
            warn!(state = ?self.state, "Unexpected attribute table event");
            return;
        }

        if !status.is_ok() {
            error!(%status, "Attribute table creation failed");
            self.state = RegistrarState::Failed;
            return;
        }

        if handles.len() != ATTRIBUTE_COUNT {
            error!(
                expected = ATTRIBUTE_COUNT,
                actual = handles.len(),
                "Attribute table handle count mismatch"
            );
            self.state = RegistrarState::Failed;
            return;
        }

        self.handles = handles.to_vec();
        let service_handle = handles[AttrIndex::Service as usize];
        match ctl.start_service(service_handle) {
            Ok(()) => self.state = RegistrarState::ServiceStarting,
            Err(e) => {
                error!(error = %e, "Start service request rejected");
                self.state = RegistrarState::Failed;
            }
        }
    }

    /// Record the service start completion.
    pub fn on_service_started(&mut self, status: Status, service_handle: u16) {
        if self.state != RegistrarState::ServiceStarting {
            warn!(state = ?self.state, "Unexpected service start event");
            return;
        }

        if status.is_ok() {
            info!(service_handle, "GATT service started");
            self.state = RegistrarState::Started;
        } else {
            error!(%status, service_handle, "GATT service start failed");
            self.state = RegistrarState::Failed;
        }
    }
}
