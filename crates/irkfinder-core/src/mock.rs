//! In-memory stand-ins for the controller and bond database.
//!
//! Used by the test suites and by server builds without the `bluetooth`
//! feature, where no radio is available.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::advertising::{AdvParams, AdvPayload, ScanResponsePayload};
use crate::bonds::{BondDatabase, BondStoreError};
use crate::controller::{BleController, ControllerError, ControllerRequest, ControllerResult, Status};
use crate::gatt::AttributeDef;
use crate::security::{EncryptionLevel, SecurityParams};
use crate::types::{Address, BondedPeer};

/// A controller that records every request and accepts it unless told not to.
#[derive(Debug, Default)]
pub struct MockController {
    requests: Mutex<Vec<ControllerRequest>>,
    rejected: Mutex<Vec<&'static str>>,
}

impl MockController {
    /// A controller that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every future request with the given name (see
    /// [`ControllerRequest::name`]).
    pub fn reject(&self, request: &'static str) {
        self.rejected.lock().push(request);
    }

    /// All requests submitted so far, including rejected ones.
    pub fn requests(&self) -> Vec<ControllerRequest> {
        self.requests.lock().clone()
    }

    /// How many requests with `name` were submitted.
    pub fn count(&self, name: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.name() == name)
            .count()
    }

    /// Forget recorded requests.
    pub fn clear(&self) {
        self.requests.lock().clear();
    }

    fn submit(&self, request: ControllerRequest) -> ControllerResult {
        let name = request.name();
        self.requests.lock().push(request);
        if self.rejected.lock().contains(&name) {
            return Err(ControllerError::Rejected {
                request: name,
                status: Status(0x103),
            });
        }
        Ok(())
    }
}

impl BleController for MockController {
    fn set_security_params(&self, _params: &SecurityParams) -> ControllerResult {
        self.submit(ControllerRequest::SetSecurityParams)
    }

    fn register_application(&self) -> ControllerResult {
        self.submit(ControllerRequest::RegisterApplication)
    }

    fn set_device_name(&self, name: &str) -> ControllerResult {
        self.submit(ControllerRequest::SetDeviceName(name.to_string()))
    }

    fn set_random_address(&self, address: Address) -> ControllerResult {
        self.submit(ControllerRequest::SetRandomAddress(address))
    }

    fn configure_local_privacy(&self, enable: bool) -> ControllerResult {
        self.submit(ControllerRequest::ConfigureLocalPrivacy(enable))
    }

    fn configure_adv_payload(&self, _payload: &AdvPayload) -> ControllerResult {
        self.submit(ControllerRequest::ConfigureAdvPayload)
    }

    fn configure_scan_response(&self, _payload: &ScanResponsePayload) -> ControllerResult {
        self.submit(ControllerRequest::ConfigureScanResponse)
    }

    fn start_advertising(&self, _params: &AdvParams) -> ControllerResult {
        self.submit(ControllerRequest::StartAdvertising)
    }

    fn create_attribute_table(&self, table: &[AttributeDef]) -> ControllerResult {
        self.submit(ControllerRequest::CreateAttributeTable(table.len()))
    }

    fn start_service(&self, service_handle: u16) -> ControllerResult {
        self.submit(ControllerRequest::StartService(service_handle))
    }

    fn set_encryption(&self, peer: Address, level: EncryptionLevel) -> ControllerResult {
        self.submit(ControllerRequest::SetEncryption(peer, level))
    }

    fn confirm_numeric(&self, peer: Address, accept: bool) -> ControllerResult {
        self.submit(ControllerRequest::ConfirmNumeric(peer, accept))
    }

    fn respond_security_request(&self, peer: Address, accept: bool) -> ControllerResult {
        self.submit(ControllerRequest::RespondSecurityRequest(peer, accept))
    }
}

/// A bond database held in memory.
#[derive(Debug, Default)]
pub struct MemoryBondDatabase {
    peers: Mutex<Vec<BondedPeer>>,
    unavailable: AtomicBool,
}

impl MemoryBondDatabase {
    /// A database pre-populated with `peers`.
    #[must_use]
    pub fn with_peers(peers: Vec<BondedPeer>) -> Self {
        Self {
            peers: Mutex::new(peers),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Record a new bond, replacing any existing bond for the same address.
    pub fn insert(&self, peer: BondedPeer) {
        let mut peers = self.peers.lock();
        peers.retain(|p| p.address != peer.address);
        peers.push(peer);
    }

    /// Number of bonds held.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no bonds are held.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Make every operation fail as if the backing store were unreadable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BondStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BondStoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl BondDatabase for MemoryBondDatabase {
    fn list(&self) -> Result<Vec<BondedPeer>, BondStoreError> {
        self.check_available()?;
        Ok(self.peers.lock().clone())
    }

    fn remove(&self, address: Address) -> Result<(), BondStoreError> {
        self.check_available()?;
        self.peers.lock().retain(|p| p.address != address);
        Ok(())
    }
}
