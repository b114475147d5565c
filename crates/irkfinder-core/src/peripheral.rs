//! The BLE peripheral: event dispatch and bond polling.
//!
//! The controller reports every completion and protocol event on a single
//! channel. [`Peripheral::run`] consumes that channel one event at a time and
//! routes each event to exactly one component transition, so the advertising
//! and GATT state machines never see concurrent access.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::advertising::{AdvertisingController, AdvertisingState};
use crate::config::BleConfig;
use crate::controller::{BleController, ControllerEvent};
use crate::error::Result;
use crate::gatt::{GattRegistrar, RegistrarState};
use crate::negotiation::SecurityNegotiationHandler;
use crate::security::SecurityParams;
use crate::session::Session;
use crate::types::Address;

/// Capacity of the controller event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Progress of the one-time bring-up, published for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct BringUpStatus {
    /// Advertising has been requested.
    pub advertising: bool,
    /// The GATT service is running.
    pub service_started: bool,
    /// A fatal bring-up step failed; restart to retry.
    pub halted: bool,
}

/// Owns the event-driven components and applies controller events to them.
pub struct Peripheral {
    ctl: Arc<dyn BleController>,
    security: SecurityParams,
    advertising: AdvertisingController,
    registrar: GattRegistrar,
    handler: SecurityNegotiationHandler,
    status: watch::Sender<BringUpStatus>,
    lookups: Vec<Address>,
}

/// The sending half of a controller event channel, handed to the backend.
pub type EventSender = mpsc::Sender<ControllerEvent>;

/// A bounded controller event channel.
#[must_use]
pub fn event_channel() -> (EventSender, mpsc::Receiver<ControllerEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

impl Peripheral {
    /// Build a peripheral for `config`, capturing keys into `session`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the random address or manufacturer data
    /// in `config` is malformed.
    pub fn new(
        ctl: Arc<dyn BleController>,
        config: &BleConfig,
        session: Arc<Session>,
    ) -> Result<Self> {
        let (status, _) = watch::channel(BringUpStatus::default());
        Ok(Self {
            ctl,
            security: config.security_params(),
            advertising: AdvertisingController::new(config.advertising_config()?),
            registrar: GattRegistrar::new(config.device_name.clone(), config.random_address()?),
            handler: SecurityNegotiationHandler::new(session),
            status,
            lookups: Vec::new(),
        })
    }

    /// Subscribe to bring-up progress.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BringUpStatus> {
        self.status.subscribe()
    }

    /// A handle to the negotiation handler, for the bond poll.
    #[must_use]
    pub fn handler(&self) -> SecurityNegotiationHandler {
        self.handler.clone()
    }

    /// Current advertising state.
    #[must_use]
    pub const fn advertising_state(&self) -> AdvertisingState {
        self.advertising.state()
    }

    /// Current registrar state.
    #[must_use]
    pub const fn registrar_state(&self) -> RegistrarState {
        self.registrar.state()
    }

    /// Apply the security parameters and register the GATT application.
    /// Everything after this is driven by controller events.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller rejects either request.
    pub fn start(&self) -> Result<()> {
        self.ctl.set_security_params(&self.security)?;
        self.ctl.register_application()?;
        info!(passkey = format_args!("{:06}", self.security.static_passkey), "Peripheral starting");
        Ok(())
    }

    /// Route one controller event.
    pub fn dispatch(&mut self, event: ControllerEvent) {
        let ctl = self.ctl.as_ref();
        match event {
            ControllerEvent::RegistrationComplete { status } => {
                self.registrar
                    .on_registration_complete(ctl, &mut self.advertising, status);
            }
            ControllerEvent::AttributeTableCreated { status, handles } => {
                self.registrar.on_table_created(ctl, status, &handles);
            }
            ControllerEvent::ServiceStarted {
                status,
                service_handle,
            } => self.registrar.on_service_started(status, service_handle),
            ControllerEvent::LocalPrivacyConfigured { status } => {
                self.advertising.on_privacy_configured(ctl, status);
            }
            ControllerEvent::AdvPayloadConfigured { status } => {
                self.advertising.on_adv_payload_configured(ctl, status);
            }
            ControllerEvent::ScanResponseConfigured { status } => {
                self.advertising.on_scan_response_configured(ctl, status);
            }
            ControllerEvent::AdvertisingStarted { status } => {
                self.advertising.on_advertising_started(status);
            }
            ControllerEvent::PeerConnected { address } => {
                self.handler.on_peer_connected(ctl, address);
            }
            ControllerEvent::PeerDisconnected { address, reason } => {
                self.handler
                    .on_peer_disconnected(ctl, &mut self.advertising, address, reason);
            }
            ControllerEvent::PasskeyNotification { address, passkey } => {
                self.handler.on_passkey_notification(address, passkey);
            }
            ControllerEvent::NumericComparisonRequest { address, passkey } => {
                self.handler.on_numeric_comparison(ctl, address, passkey);
            }
            ControllerEvent::SecurityRequest { address } => {
                self.handler.on_security_request(ctl, address);
            }
            ControllerEvent::AuthenticationComplete { address, outcome } => {
                if let Some(lookup) = self.handler.on_authentication_complete(address, outcome) {
                    self.lookups.push(lookup);
                }
            }
            ControllerEvent::KeyReceived { address, key } => {
                self.handler.on_key_received(address, key);
            }
        }
        self.publish_status();
    }

    /// Bond lookups requested by successful pairings since the last call.
    pub fn take_bond_lookups(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.lookups)
    }

    /// Consume controller events until every sender is dropped.
    ///
    /// Bond lookups run on the blocking pool so the next event is dispatched
    /// while the bond database is read.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut events: mpsc::Receiver<ControllerEvent>) {
        while let Some(event) = events.recv().await {
            debug!(?event, "Controller event");
            self.dispatch(event);
            for address in self.take_bond_lookups() {
                spawn_bond_lookup(self.handler.clone(), address);
            }
        }
        warn!("Controller event channel closed");
    }

    fn publish_status(&self) {
        let next = BringUpStatus {
            advertising: self.advertising.state() == AdvertisingState::Advertising,
            service_started: self.registrar.state() == RegistrarState::Started,
            halted: self.advertising.state() == AdvertisingState::Halted
                || self.registrar.state() == RegistrarState::Failed,
        };
        self.status.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

/// Capture the key from the bond written for `address` after pairing.
pub fn spawn_bond_lookup(
    handler: SecurityNegotiationHandler,
    address: Address,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let lookup = tokio::task::spawn_blocking(move || handler.capture_from_bonds(Some(address)));
        match lookup.await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(%address, error = %e, "Bond lookup task failed");
                false
            }
        }
    })
}

/// Periodically enumerate bonds while no key has been retrieved.
///
/// Peers that bonded before a restart are picked up this way without
/// pairing again. Enumeration runs on the blocking pool since bond databases
/// may touch the filesystem.
pub fn spawn_bond_poll(handler: SecurityNegotiationHandler, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if handler.session().is_retrieved() {
                continue;
            }
            let h = handler.clone();
            match tokio::task::spawn_blocking(move || h.capture_from_bonds(None)).await {
                Ok(true) => info!("Identity key recovered from existing bond"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Bond poll task failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bonds::{BondDatabase, BondStoreError, BondedDeviceStore};
    use crate::codec::IdentityKey;
    use crate::controller::{AuthOutcome, ControllerRequest, ExchangedKey, Status};
    use crate::gatt::ATTRIBUTE_COUNT;
    use crate::mock::{MemoryBondDatabase, MockController};
    use crate::types::{BondedPeer, CaptureSource};

    const PHONE: Address = Address::new([0x5C, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn setup(db: Arc<MemoryBondDatabase>) -> (Arc<MockController>, Peripheral, Arc<Session>) {
        let ctl = Arc::new(MockController::new());
        let session = Session::new(BondedDeviceStore::new(db));
        let peripheral = Peripheral::new(ctl.clone(), &BleConfig::default(), session.clone())
            .expect("default config is valid");
        (ctl, peripheral, session)
    }

    fn bring_up(p: &mut Peripheral) {
        p.start().unwrap();
        p.dispatch(ControllerEvent::RegistrationComplete { status: Status::OK });
        p.dispatch(ControllerEvent::LocalPrivacyConfigured { status: Status::OK });
        p.dispatch(ControllerEvent::AttributeTableCreated {
            status: Status::OK,
            handles: (1..=ATTRIBUTE_COUNT as u16).collect(),
        });
        p.dispatch(ControllerEvent::ScanResponseConfigured { status: Status::OK });
        p.dispatch(ControllerEvent::AdvPayloadConfigured { status: Status::OK });
        p.dispatch(ControllerEvent::ServiceStarted {
            status: Status::OK,
            service_handle: 1,
        });
    }

    #[test]
    fn test_start_sets_security_then_registers() {
        let (ctl, p, _) = setup(Arc::default());
        tokio_test::assert_ok!(p.start());
        assert_eq!(
            ctl.requests(),
            vec![
                ControllerRequest::SetSecurityParams,
                ControllerRequest::RegisterApplication
            ]
        );
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        let mut config = BleConfig::default();
        config.manufacturer_data = "zz".to_string();
        let session = Session::new(BondedDeviceStore::new(Arc::new(MemoryBondDatabase::default())));
        let Err(err) = Peripheral::new(Arc::new(MockController::new()), &config, session) else {
            panic!("expected a validation error");
        };
        assert_eq!(err.error_code(), "CONFIG_VALIDATION_ERROR");
    }

    #[test]
    fn test_start_propagates_rejection() {
        let (ctl, p, _) = setup(Arc::default());
        ctl.reject("register_application");
        let err = p.start().unwrap_err();
        assert_eq!(err.error_code(), "CONTROLLER_REJECTED");
    }

    #[test]
    fn test_full_bring_up() {
        let (ctl, mut p, _) = setup(Arc::default());
        let status = p.subscribe();
        bring_up(&mut p);

        assert_eq!(p.advertising_state(), AdvertisingState::Advertising);
        assert_eq!(p.registrar_state(), RegistrarState::Started);
        assert_eq!(ctl.count("start_advertising"), 1);
        assert_eq!(ctl.count("start_service"), 1);
        assert_eq!(
            *status.borrow(),
            BringUpStatus {
                advertising: true,
                service_started: true,
                halted: false
            }
        );
    }

    #[test]
    fn test_table_mismatch_halts() {
        let (_, mut p, _) = setup(Arc::default());
        let status = p.subscribe();
        p.dispatch(ControllerEvent::RegistrationComplete { status: Status::OK });
        p.dispatch(ControllerEvent::AttributeTableCreated {
            status: Status::OK,
            handles: vec![1, 2, 3],
        });
        assert_eq!(p.registrar_state(), RegistrarState::Failed);
        assert!(status.borrow().halted);
    }

    #[test]
    fn test_pairing_flow_captures_key() {
        let db = Arc::new(MemoryBondDatabase::default());
        let (ctl, mut p, session) = setup(db.clone());
        bring_up(&mut p);
        ctl.clear();

        p.dispatch(ControllerEvent::PeerConnected { address: PHONE });
        p.dispatch(ControllerEvent::NumericComparisonRequest {
            address: PHONE,
            passkey: 42,
        });
        db.insert(BondedPeer {
            address: PHONE,
            identity_key: Some(IdentityKey::from_bytes([0x11; 16])),
        });
        p.dispatch(ControllerEvent::AuthenticationComplete {
            address: PHONE,
            outcome: AuthOutcome::Success,
        });

        assert_eq!(ctl.count("set_encryption"), 1);
        assert_eq!(ctl.count("confirm_numeric"), 1);
        assert!(!session.is_retrieved());
        assert_eq!(p.take_bond_lookups(), vec![PHONE]);
        assert!(p.take_bond_lookups().is_empty());
        assert!(p.handler().capture_from_bonds(Some(PHONE)));

        let snap = session.read();
        assert!(snap.is_retrieved());
        assert_eq!(snap.peer_address(), Some(PHONE));

        p.dispatch(ControllerEvent::PeerDisconnected {
            address: PHONE,
            reason: 0x13,
        });
        assert_eq!(ctl.count("start_advertising"), 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (ctl, p, session) = setup(Arc::default());
        let (tx, rx) = event_channel();
        let task = tokio::spawn(p.run(rx));

        tx.send(ControllerEvent::KeyReceived {
            address: PHONE,
            key: ExchangedKey::Identity(IdentityKey::from_bytes([7; 16])),
        })
        .await
        .unwrap();
        tx.send(ControllerEvent::SecurityRequest { address: PHONE })
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(session.read().source(), Some(CaptureSource::KeyExchange));
        assert_eq!(ctl.count("respond_security_request"), 1);
    }

    #[test]
    fn test_failed_pairing_requests_no_lookup() {
        let (_, mut p, _) = setup(Arc::default());
        p.dispatch(ControllerEvent::AuthenticationComplete {
            address: PHONE,
            outcome: AuthOutcome::Failed { reason: 0x05 },
        });
        assert!(p.take_bond_lookups().is_empty());
    }

    /// A bond database whose reads wait until the test opens the gate.
    struct GatedBonds {
        inner: MemoryBondDatabase,
        gate: Mutex<()>,
    }

    impl BondDatabase for GatedBonds {
        fn list(&self) -> std::result::Result<Vec<BondedPeer>, BondStoreError> {
            let _open = self.gate.lock().unwrap();
            self.inner.list()
        }

        fn remove(&self, address: Address) -> std::result::Result<(), BondStoreError> {
            self.inner.remove(address)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_dispatch_while_bond_lookup_blocks() {
        let bonds = Arc::new(GatedBonds {
            inner: MemoryBondDatabase::with_peers(vec![BondedPeer {
                address: PHONE,
                identity_key: Some(IdentityKey::from_bytes([0x21; 16])),
            }]),
            gate: Mutex::new(()),
        });
        let ctl = Arc::new(MockController::new());
        let session = Session::new(BondedDeviceStore::new(bonds.clone()));
        let p = Peripheral::new(ctl.clone(), &BleConfig::default(), session.clone()).unwrap();
        let (tx, rx) = event_channel();
        let task = tokio::spawn(p.run(rx));

        let closed = bonds.gate.lock().unwrap();
        tx.send(ControllerEvent::AuthenticationComplete {
            address: PHONE,
            outcome: AuthOutcome::Success,
        })
        .await
        .unwrap();
        tx.send(ControllerEvent::SecurityRequest { address: PHONE })
            .await
            .unwrap();

        for _ in 0..200 {
            if ctl.count("respond_security_request") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctl.count("respond_security_request"), 1);
        assert!(!session.is_retrieved());

        drop(closed);
        for _ in 0..200 {
            if session.is_retrieved() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.read().source(), Some(CaptureSource::BondEnumeration));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_poll_recovers_existing_bond() {
        let db = Arc::new(MemoryBondDatabase::default());
        let (_, p, session) = setup(db.clone());
        let poll = spawn_bond_poll(p.handler(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!session.is_retrieved());

        db.insert(BondedPeer {
            address: PHONE,
            identity_key: Some(IdentityKey::from_bytes([3; 16])),
        });
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if session.is_retrieved() {
                break;
            }
        }
        poll.abort();

        let snap = session.read();
        assert!(snap.is_retrieved());
        assert_eq!(snap.source(), Some(CaptureSource::BondEnumeration));
    }
}
