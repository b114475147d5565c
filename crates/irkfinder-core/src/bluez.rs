//! BlueZ backend (Linux, via `bluer`).
//!
//! bluetoothd already runs the Security Manager, the GATT database and the
//! advertising manager, so most controller requests map onto a D-Bus call
//! whose reply is forwarded as a [`ControllerEvent`]. A few requests have no
//! D-Bus equivalent:
//!
//! - Local privacy is governed by `Privacy=` in bluetoothd's `main.conf`.
//!   The setting is read at startup and the privacy request succeeds only
//!   when it matches. A static random address cannot be set at all; with
//!   privacy on, bluetoothd rotates resolvable private addresses instead.
//! - The pairing agent registers no input or output handlers, so bluer
//!   announces it as `NoInputNoOutput`. Just Works pairing attempts arrive
//!   as authorization requests and are answered through
//!   `respond_security_request`.
//! - Attribute handles are assigned internally by bluetoothd. The table is
//!   served as one application and reported with sequential handles.
//! - The identity key is never exposed over D-Bus. It is read back from the
//!   bond records on disk by [`BluezBondDatabase`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bluer::adv::{Advertisement, AdvertisementHandle, Feature, Type as AdvertisementType};
use bluer::agent::{Agent, AgentHandle, AuthorizeService, ReqError, RequestAuthorization};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError as GattReqError, Service,
};
use bluer::{AdapterEvent, DeviceEvent, DeviceProperty, Uuid, UuidExt};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::advertising::{AdvParams, AdvPayload, ScanResponsePayload};
use crate::bluez_store::{BluezStorage, DaemonSettings};
use crate::bonds::{BondDatabase, BondStoreError};
use crate::controller::{
    AuthOutcome, BleController, ControllerError, ControllerEvent, ControllerResult, Status,
};
use crate::error::{IrkError, Result};
use crate::gatt::{AttributeDef, CharProps, Permissions, UUID_CHARACTERISTIC, UUID_PRIMARY_SERVICE};
use crate::config::BleConfig;
use crate::peripheral::EventSender;
use crate::security::{AuthMode, EncryptionLevel, IoCapability, KeyDistribution, SecurityParams};
use crate::types::{Address, BondedPeer};

/// Generic failure reported when a D-Bus call fails.
const STACK_FAILURE: Status = Status(0x0101);

/// Reported when bluetoothd's privacy setting differs from the request.
const PRIVACY_MISMATCH: Status = Status(0x0102);

/// bluetoothd always negotiates full-length keys.
const MAX_KEY_SIZE: u8 = 16;

/// HCI "remote user terminated connection"; bluetoothd does not report the
/// real reason.
const REASON_REMOTE_TERMINATED: u8 = 0x13;

/// SMP "unspecified reason".
const SMP_UNSPECIFIED: u8 = 0x08;

/// Advertising interval unit.
const ADV_INTERVAL_UNIT: Duration = Duration::from_micros(625);

fn to_bluer(address: Address) -> bluer::Address {
    bluer::Address(address.octets())
}

fn from_bluer(address: bluer::Address) -> Address {
    Address::new(address.0)
}

#[derive(Default)]
struct Registrations {
    payload: Option<AdvPayload>,
    scan_response: Option<ScanResponsePayload>,
    advertisement: Option<AdvertisementHandle>,
    application: Option<ApplicationHandle>,
    agent: Option<AgentHandle>,
}

/// Agent requests waiting for the engine's answer, by peer.
#[derive(Clone, Default)]
struct PendingReplies(Arc<Mutex<HashMap<Address, oneshot::Sender<bool>>>>);

impl PendingReplies {
    fn wait_for(&self, peer: Address) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        if self.0.lock().insert(peer, tx).is_some() {
            debug!(%peer, "Replacing unanswered pairing request");
        }
        rx
    }

    fn cancel(&self, peer: Address) {
        self.0.lock().remove(&peer);
    }

    fn resolve(&self, peer: Address, accept: bool) -> ControllerResult {
        let Some(reply) = self.0.lock().remove(&peer) else {
            return Err(ControllerError::Unavailable(format!(
                "no pending pairing request from {peer}"
            )));
        };
        if reply.send(accept).is_err() {
            debug!(%peer, "Pairing request withdrawn before reply");
        }
        Ok(())
    }
}

/// Check that bluetoothd can pair the way `params` asks.
fn check_security(params: &SecurityParams, daemon: DaemonSettings) -> ControllerResult {
    if params.max_key_size != MAX_KEY_SIZE {
        return Err(ControllerError::Unsupported(format!(
            "bluetoothd negotiates {MAX_KEY_SIZE}-byte keys, not {}",
            params.max_key_size
        )));
    }
    if !params.initiator_keys.contains(KeyDistribution::IDENTITY) {
        return Err(ControllerError::Unsupported(format!(
            "bluetoothd always requests the peer's identity key, but {:?} omits it",
            params.initiator_keys
        )));
    }
    if params.only_accept_specified_auth && !daemon.secure_connections_only {
        return Err(ControllerError::Unsupported(
            "refusing legacy pairing needs SecureConnections=only in main.conf".to_string(),
        ));
    }

    match (params.auth_mode, params.io_capability) {
        (AuthMode::SecureConnectionsMitmBond, IoCapability::NoInputNoOutput) => {
            warn!("MITM protection requested, but a NoInputNoOutput agent only allows Just Works");
        }
    }
    Ok(())
}

/// Completion status for a local privacy request under `daemon`.
fn privacy_status(daemon: DaemonSettings, enable: bool) -> Status {
    if daemon.privacy == enable {
        Status::OK
    } else {
        PRIVACY_MISMATCH
    }
}

/// [`BleController`] backed by bluetoothd.
pub struct BluezController {
    session: bluer::Session,
    adapter: bluer::Adapter,
    runtime: Handle,
    events: EventSender,
    registrations: Arc<Mutex<Registrations>>,
    daemon: DaemonSettings,
    security: Mutex<Option<SecurityParams>>,
    authorizations: PendingReplies,
}

impl BluezController {
    /// Connect to bluetoothd, power the adapter and start forwarding device
    /// events to `events`.
    ///
    /// Uses the adapter named in `config` (e.g. `hci0`) or the default one,
    /// and reads bluetoothd's settings from `config.bluez_main_conf`.
    ///
    /// # Errors
    ///
    /// Returns an error if bluetoothd is unreachable, no adapter is usable,
    /// or `main.conf` exists but cannot be read.
    pub async fn new(config: &BleConfig, events: EventSender) -> Result<Self> {
        let main_conf = config.bluez_main_conf.clone();
        let daemon = tokio::task::spawn_blocking(move || DaemonSettings::load(&main_conf))
            .await
            .map_err(|e| IrkError::ControllerUnavailable(e.to_string()))??;
        info!(
            privacy = daemon.privacy,
            secure_connections_only = daemon.secure_connections_only,
            "bluetoothd settings"
        );

        let session = bluer::Session::new()
            .await
            .map_err(|e| IrkError::ControllerUnavailable(e.to_string()))?;

        let adapter = match config.adapter.as_deref() {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| {
            error!(error = %e, "No Bluetooth adapter");
            IrkError::BluetoothAdapterNotFound
        })?;

        if !adapter.is_powered().await.unwrap_or(false) {
            info!(adapter = adapter.name(), "Powering on Bluetooth adapter");
            adapter
                .set_powered(true)
                .await
                .map_err(|_| IrkError::BluetoothAdapterPoweredOff)?;
        }
        if let Err(e) = adapter.set_pairable(true).await {
            warn!(error = %e, "Could not make adapter pairable");
        }
        info!(adapter = adapter.name(), "Using Bluetooth adapter");

        let monitor_adapter = adapter.clone();
        let monitor_events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor_devices(monitor_adapter, monitor_events).await {
                error!(error = %e, "Device monitor stopped");
            }
        });

        Ok(Self {
            session,
            adapter,
            runtime: Handle::current(),
            events,
            registrations: Arc::default(),
            daemon,
            security: Mutex::new(None),
            authorizations: PendingReplies::default(),
        })
    }

    /// The adapter in use.
    #[must_use]
    pub const fn adapter(&self) -> &bluer::Adapter {
        &self.adapter
    }

    /// The adapter's public address.
    ///
    /// # Errors
    ///
    /// Returns an error if bluetoothd does not answer.
    pub async fn adapter_address(&self) -> Result<Address> {
        self.adapter
            .address()
            .await
            .map(from_bluer)
            .map_err(|e| IrkError::ControllerUnavailable(e.to_string()))
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    fn emit(&self, event: ControllerEvent) {
        emit(&self.runtime, &self.events, event);
    }

    /// bluetoothd settings read at startup.
    #[must_use]
    pub const fn daemon_settings(&self) -> DaemonSettings {
        self.daemon
    }

    fn agent(&self) -> Agent {
        let events = self.events.clone();
        let authorizations = self.authorizations.clone();

        Agent {
            request_default: true,
            request_authorization: Some(Box::new(move |req: RequestAuthorization| {
                let events = events.clone();
                let authorizations = authorizations.clone();
                Box::pin(async move {
                    let address = from_bluer(req.device);
                    let reply = authorizations.wait_for(address);
                    let request = ControllerEvent::SecurityRequest { address };
                    if events.send(request).await.is_err() {
                        warn!(%address, "Controller event channel closed, refusing pairing");
                        authorizations.cancel(address);
                        return Err(ReqError::Rejected);
                    }
                    match reply.await {
                        Ok(true) => Ok(()),
                        _ => Err(ReqError::Rejected),
                    }
                })
            })),
            authorize_service: Some(Box::new(|req: AuthorizeService| {
                Box::pin(async move {
                    debug!(device = %req.device, "Authorizing service for bonded peer");
                    Ok::<(), ReqError>(())
                })
            })),
            ..Default::default()
        }
    }
}

fn emit(runtime: &Handle, events: &EventSender, event: ControllerEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            let events = events.clone();
            runtime.spawn(async move {
                if events.send(event).await.is_err() {
                    warn!("Controller event channel closed");
                }
            });
        }
        Err(TrySendError::Closed(_)) => warn!("Controller event channel closed"),
    }
}

async fn monitor_devices(adapter: bluer::Adapter, events: EventSender) -> bluer::Result<()> {
    let mut adapter_events = Box::pin(adapter.events().await?);
    for address in adapter.device_addresses().await? {
        watch_device(&adapter, address, events.clone());
    }
    while let Some(event) = adapter_events.next().await {
        if let AdapterEvent::DeviceAdded(address) = event {
            watch_device(&adapter, address, events.clone());
        }
    }
    Ok(())
}

fn watch_device(adapter: &bluer::Adapter, address: bluer::Address, events: EventSender) {
    let Ok(device) = adapter.device(address) else {
        return;
    };
    tokio::spawn(async move {
        let Ok(stream) = device.events().await else {
            return;
        };
        let mut stream = Box::pin(stream);
        let address = from_bluer(address);
        while let Some(DeviceEvent::PropertyChanged(property)) = stream.next().await {
            let event = match property {
                DeviceProperty::Connected(true) => ControllerEvent::PeerConnected { address },
                DeviceProperty::Connected(false) => ControllerEvent::PeerDisconnected {
                    address,
                    reason: REASON_REMOTE_TERMINATED,
                },
                DeviceProperty::Paired(true) => ControllerEvent::AuthenticationComplete {
                    address,
                    outcome: AuthOutcome::Success,
                },
                _ => continue,
            };
            if events.send(event).await.is_err() {
                debug!(%address, "Controller event channel closed, device watch stopped");
                break;
            }
        }
    });
}

fn advertisement(payload: &AdvPayload, scan: &ScanResponsePayload, params: &AdvParams) -> Advertisement {
    let mut service_uuid = payload.service_uuid;
    service_uuid.reverse();

    let mut manufacturer_data = BTreeMap::new();
    if let [lo, hi, rest @ ..] = scan.manufacturer_data.as_slice() {
        manufacturer_data.insert(u16::from_le_bytes([*lo, *hi]), rest.to_vec());
    }

    let mut system_includes = BTreeSet::new();
    if payload.include_tx_power {
        system_includes.insert(Feature::TxPower);
    }

    Advertisement {
        advertisement_type: AdvertisementType::Peripheral,
        service_uuids: BTreeSet::from([Uuid::from_bytes(service_uuid)]),
        manufacturer_data,
        discoverable: Some(true),
        local_name: Some(scan.local_name.clone()),
        appearance: (payload.appearance != 0).then_some(payload.appearance),
        system_includes,
        min_interval: Some(ADV_INTERVAL_UNIT * u32::from(params.interval_min)),
        max_interval: Some(ADV_INTERVAL_UNIT * u32::from(params.interval_max)),
        ..Default::default()
    }
}

fn characteristic(declaration: &AttributeDef, value: &AttributeDef) -> Characteristic {
    let props = CharProps::from_bits_truncate(declaration.value.first().copied().unwrap_or(0));
    let perms = value.permissions;
    let initial = value.value.to_vec();

    let read = (props.contains(CharProps::READ)
        || perms.intersects(Permissions::READ | Permissions::READ_ENCRYPTED))
    .then(|| CharacteristicRead {
        read: true,
        encrypt_read: perms.contains(Permissions::READ_ENCRYPTED),
        fun: Box::new(move |_req: CharacteristicReadRequest| {
            let value = initial.clone();
            Box::pin(async move { Ok::<_, GattReqError>(value) })
        }),
        ..Default::default()
    });

    let write = props.contains(CharProps::WRITE).then(|| CharacteristicWrite {
        write: true,
        encrypt_write: perms.contains(Permissions::WRITE_ENCRYPTED),
        method: CharacteristicWriteMethod::Fun(Box::new(|new_value: Vec<u8>, _req: CharacteristicWriteRequest| {
            Box::pin(async move {
                debug!(len = new_value.len(), "Ignoring characteristic write");
                Ok::<(), GattReqError>(())
            })
        })),
        ..Default::default()
    });

    let notify = props.contains(CharProps::NOTIFY).then(|| CharacteristicNotify {
        notify: true,
        method: CharacteristicNotifyMethod::Fun(Box::new(|_notifier: CharacteristicNotifier| {
            Box::pin(async { debug!("Notification session opened") })
        })),
        ..Default::default()
    });

    Characteristic {
        uuid: Uuid::from_u16(value.uuid),
        read,
        write,
        notify,
        ..Default::default()
    }
}

/// Translate an attribute table into a bluetoothd GATT application.
///
/// Client configuration descriptors are dropped; bluetoothd adds them to
/// every notifying characteristic itself.
fn application(table: &[AttributeDef]) -> std::result::Result<Application, String> {
    let Some(service) = table.first().filter(|a| a.uuid == UUID_PRIMARY_SERVICE) else {
        return Err("table does not start with a service declaration".to_string());
    };
    let service_uuid = match service.value {
        [lo, hi] => Uuid::from_u16(u16::from_le_bytes([*lo, *hi])),
        other => return Err(format!("unsupported service UUID length {}", other.len())),
    };

    let characteristics = table
        .windows(2)
        .filter(|pair| pair[0].uuid == UUID_CHARACTERISTIC)
        .map(|pair| characteristic(&pair[0], &pair[1]))
        .collect();

    Ok(Application {
        services: vec![Service {
            uuid: service_uuid,
            primary: true,
            characteristics,
            ..Default::default()
        }],
        ..Default::default()
    })
}

impl BleController for BluezController {
    fn set_security_params(&self, params: &SecurityParams) -> ControllerResult {
        check_security(params, self.daemon)?;
        debug!(?params, "Security parameters accepted, agent is NoInputNoOutput");
        *self.security.lock() = Some(params.clone());
        Ok(())
    }

    fn register_application(&self) -> ControllerResult {
        if self.security.lock().is_none() {
            return Err(ControllerError::Unavailable(
                "security parameters must be applied before the agent registers".to_string(),
            ));
        }
        let session = self.session.clone();
        let agent = self.agent();
        let registrations = self.registrations.clone();
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let status = match session.register_agent(agent).await {
                Ok(handle) => {
                    registrations.lock().agent = Some(handle);
                    Status::OK
                }
                Err(e) => {
                    error!(error = %e, "Agent registration failed");
                    STACK_FAILURE
                }
            };
            emit(&runtime, &events, ControllerEvent::RegistrationComplete { status });
        });
        Ok(())
    }

    fn set_device_name(&self, name: &str) -> ControllerResult {
        let adapter = self.adapter.clone();
        let name = name.to_string();
        self.spawn(async move {
            if let Err(e) = adapter.set_alias(name).await {
                warn!(error = %e, "Setting adapter alias failed");
            }
        });
        Ok(())
    }

    fn set_random_address(&self, address: Address) -> ControllerResult {
        Err(ControllerError::Unsupported(format!(
            "bluetoothd cannot be given a static random address ({address})"
        )))
    }

    fn configure_local_privacy(&self, enable: bool) -> ControllerResult {
        let status = privacy_status(self.daemon, enable);
        if status.is_ok() {
            info!(enable, "Local privacy matches bluetoothd's Privacy setting");
        } else {
            error!(
                requested = enable,
                configured = self.daemon.privacy,
                "Local privacy differs from Privacy= in bluetoothd's main.conf"
            );
        }
        self.emit(ControllerEvent::LocalPrivacyConfigured { status });
        Ok(())
    }

    fn configure_adv_payload(&self, payload: &AdvPayload) -> ControllerResult {
        self.registrations.lock().payload = Some(payload.clone());
        self.emit(ControllerEvent::AdvPayloadConfigured { status: Status::OK });
        Ok(())
    }

    fn configure_scan_response(&self, payload: &ScanResponsePayload) -> ControllerResult {
        self.registrations.lock().scan_response = Some(payload.clone());
        self.emit(ControllerEvent::ScanResponseConfigured { status: Status::OK });
        Ok(())
    }

    fn start_advertising(&self, params: &AdvParams) -> ControllerResult {
        let adv = {
            let regs = self.registrations.lock();
            match (&regs.payload, &regs.scan_response) {
                (Some(payload), Some(scan)) => advertisement(payload, scan, params),
                _ => {
                    return Err(ControllerError::Unavailable(
                        "advertising payloads not configured".to_string(),
                    ))
                }
            }
        };

        let adapter = self.adapter.clone();
        let registrations = self.registrations.clone();
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        self.spawn(async move {
            // Drop the previous registration first; bluetoothd limits instances.
            registrations.lock().advertisement = None;
            let status = match adapter.advertise(adv).await {
                Ok(handle) => {
                    registrations.lock().advertisement = Some(handle);
                    Status::OK
                }
                Err(e) => {
                    error!(error = %e, "Advertisement registration failed");
                    STACK_FAILURE
                }
            };
            emit(&runtime, &events, ControllerEvent::AdvertisingStarted { status });
        });
        Ok(())
    }

    fn create_attribute_table(&self, table: &[AttributeDef]) -> ControllerResult {
        let app = application(table).map_err(ControllerError::Unavailable)?;
        let count = u16::try_from(table.len()).unwrap_or(u16::MAX);

        let adapter = self.adapter.clone();
        let registrations = self.registrations.clone();
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let event = match adapter.serve_gatt_application(app).await {
                Ok(handle) => {
                    registrations.lock().application = Some(handle);
                    ControllerEvent::AttributeTableCreated {
                        status: Status::OK,
                        handles: (1..=count).collect(),
                    }
                }
                Err(e) => {
                    error!(error = %e, "GATT application registration failed");
                    ControllerEvent::AttributeTableCreated {
                        status: STACK_FAILURE,
                        handles: Vec::new(),
                    }
                }
            };
            emit(&runtime, &events, event);
        });
        Ok(())
    }

    fn start_service(&self, service_handle: u16) -> ControllerResult {
        // The application is live as soon as bluetoothd accepts it.
        self.emit(ControllerEvent::ServiceStarted {
            status: Status::OK,
            service_handle,
        });
        Ok(())
    }

    fn set_encryption(&self, peer: Address, level: EncryptionLevel) -> ControllerResult {
        let device = self
            .adapter
            .device(to_bluer(peer))
            .map_err(|e| ControllerError::Unavailable(e.to_string()))?;
        let events = self.events.clone();
        self.spawn(async move {
            if device.is_paired().await.unwrap_or(false) {
                debug!(%peer, "Peer already paired");
                return;
            }
            debug!(%peer, ?level, "Initiating pairing");
            if let Err(e) = device.pair().await {
                warn!(%peer, error = %e, "Pairing failed");
                let failed = ControllerEvent::AuthenticationComplete {
                    address: peer,
                    outcome: AuthOutcome::Failed {
                        reason: SMP_UNSPECIFIED,
                    },
                };
                if events.send(failed).await.is_err() {
                    debug!(%peer, "Controller event channel closed");
                }
            }
        });
        Ok(())
    }

    fn confirm_numeric(&self, peer: Address, _accept: bool) -> ControllerResult {
        Err(ControllerError::Unsupported(format!(
            "{peer}: a NoInputNoOutput agent is never asked for numeric comparison"
        )))
    }

    fn respond_security_request(&self, peer: Address, accept: bool) -> ControllerResult {
        debug!(%peer, accept, "Answering pairing authorization");
        self.authorizations.resolve(peer, accept)
    }
}

/// [`BondDatabase`] over bluetoothd: bonds are read from disk and removed
/// through D-Bus so bluetoothd forgets them too.
pub struct BluezBondDatabase {
    storage: BluezStorage,
    adapter: bluer::Adapter,
    runtime: Handle,
}

impl BluezBondDatabase {
    /// Bond database for `controller`'s adapter, reading records under
    /// `storage_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter address cannot be read.
    pub async fn new(
        controller: &BluezController,
        storage_dir: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        let address = controller.adapter_address().await?;
        Ok(Self {
            storage: BluezStorage::new(storage_dir, Some(address)),
            adapter: controller.adapter().clone(),
            runtime: Handle::current(),
        })
    }

    fn block_on<F: Future>(&self, task: F) -> F::Output {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.runtime.block_on(task))
            }
            _ => self.runtime.block_on(task),
        }
    }
}

impl BondDatabase for BluezBondDatabase {
    fn list(&self) -> std::result::Result<Vec<BondedPeer>, BondStoreError> {
        self.storage.list()
    }

    fn remove(&self, address: Address) -> std::result::Result<(), BondStoreError> {
        self.block_on(self.adapter.remove_device(to_bluer(address)))
            .map_err(|e| BondStoreError::RemoveFailed {
                address,
                message: e.to_string(),
            })
    }
}
