//! Security negotiation policy.
//!
//! Every connection is pushed straight into authenticated pairing, and the
//! peer's Identity Resolving Key is captured from whichever event carries
//! it first: the key-distribution event or the bond record written once
//! authentication completes.
//!
//! The device has no display or keyboard. Numeric comparison requests are
//! confirmed automatically, which in practice downgrades the pairing to
//! "just works" with server-side confirmation. That is a deliberate policy
//! of this tool, not real MITM protection.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::advertising::AdvertisingController;
use crate::codec::IdentityKey;
use crate::controller::{AuthOutcome, BleController, ExchangedKey};
use crate::security::EncryptionLevel;
use crate::session::Session;
use crate::types::{Address, BondedPeer, CaptureSource};

/// Applies the pairing policy and writes captured keys to the session.
#[derive(Clone)]
pub struct SecurityNegotiationHandler {
    session: Arc<Session>,
}

impl SecurityNegotiationHandler {
    /// A handler writing into `session`.
    pub const fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// The session this handler writes to.
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Force authenticated pairing on every new connection.
    pub fn on_peer_connected(&self, ctl: &dyn BleController, address: Address) {
        info!(%address, "Peer connected, requesting MITM-protected encryption");
        if let Err(e) = ctl.set_encryption(address, EncryptionLevel::EncryptMitm) {
            error!(%address, error = %e, "Encryption request rejected");
        }
    }

    /// Stay discoverable for the next pairing attempt.
    pub fn on_peer_disconnected(
        &self,
        ctl: &dyn BleController,
        advertising: &mut AdvertisingController,
        address: Address,
        reason: u8,
    ) {
        info!(%address, reason = format_args!("0x{reason:02x}"), "Peer disconnected");
        advertising.on_peer_disconnected(ctl);
    }

    /// Auto-confirm numeric comparison (no display to show the value on).
    pub fn on_numeric_comparison(&self, ctl: &dyn BleController, address: Address, passkey: u32) {
        info!(%address, passkey = format_args!("{passkey:06}"), "Numeric comparison auto-confirmed");
        if let Err(e) = ctl.confirm_numeric(address, true) {
            error!(%address, error = %e, "Numeric comparison reply rejected");
        }
    }

    /// Accept a peer-initiated security request.
    pub fn on_security_request(&self, ctl: &dyn BleController, address: Address) {
        debug!(%address, "Accepting security request");
        if let Err(e) = ctl.respond_security_request(address, true) {
            error!(%address, error = %e, "Security response rejected");
        }
    }

    /// The passkey is static; it is only logged for the operator.
    pub fn on_passkey_notification(&self, address: Address, passkey: u32) {
        info!(%address, passkey = format_args!("{passkey:06}"), "Passkey displayed");
    }

    /// Record the outcome of pairing.
    ///
    /// On success, returns the address whose bond should be looked up. The
    /// lookup itself touches the bond database, so callers run
    /// [`Self::capture_from_bonds`] off the event path.
    pub fn on_authentication_complete(
        &self,
        address: Address,
        outcome: AuthOutcome,
    ) -> Option<Address> {
        match outcome {
            AuthOutcome::Success => {
                info!(%address, "Authentication succeeded");
                Some(address)
            }
            AuthOutcome::Failed { reason } => {
                warn!(%address, reason = format_args!("0x{reason:x}"), "Authentication failed");
                None
            }
        }
    }

    /// Capture an identity key carried directly by a key-distribution event.
    ///
    /// Returns `true` if the session changed.
    pub fn on_key_received(&self, address: Address, key: ExchangedKey) -> bool {
        match key {
            ExchangedKey::Identity(irk) => {
                info!(%address, "Received identity key via key exchange");
                self.capture(address, irk, CaptureSource::KeyExchange)
            }
            other => {
                debug!(%address, key = ?other, "Ignoring non-identity key");
                false
            }
        }
    }

    /// Look for a captured key in the bond database.
    ///
    /// Prefers the bond for `preferred`. A peer using a resolvable private
    /// address is bonded under its identity address, so when no bond matches
    /// the most recently listed bond carrying a key is used instead.
    /// Returns `true` if the session changed.
    pub fn capture_from_bonds(&self, preferred: Option<Address>) -> bool {
        let peers = self.session.bonds().list_bonded_peers();
        if peers.is_empty() {
            debug!("No bonded devices");
            return false;
        }

        match select_peer(&peers, preferred) {
            Some((address, key)) => self.capture(address, key, CaptureSource::BondEnumeration),
            None => {
                debug!(count = peers.len(), "No bonded peer carries an identity key");
                false
            }
        }
    }

    fn capture(&self, address: Address, key: IdentityKey, source: CaptureSource) -> bool {
        let changed = self.session.capture(address, key, source);
        if changed {
            let snapshot = self.session.read();
            if let Some(enc) = snapshot.encodings() {
                info!(
                    %address,
                    %source,
                    irk_hex = %enc.hex,
                    irk_reversed = %enc.reversed_hex,
                    irk_base64 = %enc.base64,
                    irk_array = %enc.array_literal,
                    "Identity Resolving Key retrieved"
                );
            }
        } else {
            debug!(%address, %source, "Identity key already captured");
        }
        changed
    }
}

fn select_peer(peers: &[BondedPeer], preferred: Option<Address>) -> Option<(Address, IdentityKey)> {
    let with_key = |p: &BondedPeer| p.identity_key.map(|k| (p.address, k));

    preferred
        .and_then(|addr| peers.iter().find(|p| p.address == addr))
        .and_then(with_key)
        .or_else(|| peers.iter().rev().find_map(with_key))
}
