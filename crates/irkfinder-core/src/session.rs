//! Session state: the most recently captured identity.
//!
//! One lock covers the whole tuple (key, encodings, address, flag) and the
//! tuple is always replaced wholesale, so a reader sees either "no key" or a
//! complete capture, never a mix. The negotiation handler is the only
//! writer apart from [`Session::reset`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::bonds::{BondStoreError, BondedDeviceStore};
use crate::codec::{IdentityKey, KeyEncodingSet};
use crate::types::{Address, CaptureSource};

/// An immutable view of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    key: Option<IdentityKey>,
    encodings: Option<KeyEncodingSet>,
    peer_address: Option<Address>,
    retrieved: bool,
    retrieved_at: Option<DateTime<Utc>>,
    source: Option<CaptureSource>,
}

impl SessionSnapshot {
    fn captured(address: Address, key: IdentityKey, source: CaptureSource) -> Self {
        Self {
            key: Some(key),
            encodings: Some(KeyEncodingSet::encode(&key)),
            peer_address: Some(address),
            retrieved: true,
            retrieved_at: Some(Utc::now()),
            source: Some(source),
        }
    }

    /// The captured key.
    #[must_use]
    pub const fn key(&self) -> Option<&IdentityKey> {
        self.key.as_ref()
    }

    /// All encodings of the captured key.
    #[must_use]
    pub const fn encodings(&self) -> Option<&KeyEncodingSet> {
        self.encodings.as_ref()
    }

    /// Address of the peer the key belongs to.
    #[must_use]
    pub const fn peer_address(&self) -> Option<Address> {
        self.peer_address
    }

    /// Whether a key has been retrieved.
    #[must_use]
    pub const fn is_retrieved(&self) -> bool {
        self.retrieved
    }

    /// When the key was captured.
    #[must_use]
    pub const fn retrieved_at(&self) -> Option<DateTime<Utc>> {
        self.retrieved_at
    }

    /// Which protocol path produced the key.
    #[must_use]
    pub const fn source(&self) -> Option<CaptureSource> {
        self.source
    }

    fn holds(&self, key: &IdentityKey) -> bool {
        self.retrieved && self.key.as_ref() == Some(key)
    }
}

/// Process-wide session state.
pub struct Session {
    snapshot: RwLock<SessionSnapshot>,
    bonds: BondedDeviceStore,
}

impl Session {
    /// A session in the "no key" state backed by `bonds`.
    pub fn new(bonds: BondedDeviceStore) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(SessionSnapshot::default()),
            bonds,
        })
    }

    /// A consistent copy of the current state.
    pub fn read(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Whether a key has been retrieved.
    pub fn is_retrieved(&self) -> bool {
        self.snapshot.read().retrieved
    }

    /// The bonded device store this session resets.
    pub const fn bonds(&self) -> &BondedDeviceStore {
        &self.bonds
    }

    /// Record `key` for `address`.
    ///
    /// Recapturing the key already held leaves the snapshot untouched, even
    /// when it arrives under a different address (the link address during
    /// key exchange, the identity address in the bond record). Whichever
    /// capture path fires first stays authoritative. Returns `true` if the
    /// snapshot changed.
    pub fn capture(&self, address: Address, key: IdentityKey, source: CaptureSource) -> bool {
        let mut snapshot = self.snapshot.write();
        if snapshot.holds(&key) {
            return false;
        }
        *snapshot = SessionSnapshot::captured(address, key, source);
        true
    }

    /// Clear to "no key" and delete every bond.
    ///
    /// The write lock is held across the bond deletion so a capture racing
    /// with the reset lands entirely before it (and is cleared) or entirely
    /// after it. Returns how many bonds were removed.
    ///
    /// # Errors
    ///
    /// Returns the bond store failure. The session is cleared regardless.
    pub fn reset(&self) -> Result<usize, BondStoreError> {
        let mut snapshot = self.snapshot.write();
        *snapshot = SessionSnapshot::default();
        let removed = self.bonds.remove_all_bonded_peers();
        drop(snapshot);

        info!(removed = ?removed.as_ref().ok(), "Session reset");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryBondDatabase;
    use crate::types::BondedPeer;

    fn session_with(db: Arc<MemoryBondDatabase>) -> Arc<Session> {
        Session::new(BondedDeviceStore::new(db))
    }

    fn key(byte: u8) -> IdentityKey {
        IdentityKey::from_bytes([byte; 16])
    }

    const PEER: Address = Address::new([0x4A, 0x11, 0x22, 0x33, 0x44, 0x55]);

    #[test]
    fn test_starts_without_key() {
        let session = session_with(Arc::default());
        let snap = session.read();
        assert!(!snap.is_retrieved());
        assert!(snap.key().is_none());
        assert!(snap.encodings().is_none());
        assert!(snap.peer_address().is_none());
    }

    #[test]
    fn test_capture_then_read_is_consistent() {
        let session = session_with(Arc::default());
        assert!(session.capture(PEER, key(0xAB), CaptureSource::KeyExchange));

        let snap = session.read();
        assert!(snap.is_retrieved());
        assert_eq!(snap.peer_address(), Some(PEER));
        assert_eq!(snap.source(), Some(CaptureSource::KeyExchange));
        let enc = snap.encodings().unwrap();
        assert_eq!(enc, &key(0xAB).encodings());
        assert!(!enc.hex.is_empty() && !enc.base64.is_empty());
        assert_eq!(crate::codec::decode_base64(&enc.base64).unwrap(), key(0xAB));
        assert_eq!(
            crate::codec::parse_array_literal(&enc.array_literal).unwrap(),
            key(0xAB)
        );
    }

    #[test]
    fn test_duplicate_capture_is_idempotent() {
        let session = session_with(Arc::default());
        session.capture(PEER, key(7), CaptureSource::KeyExchange);
        let first = session.read();

        assert!(!session.capture(PEER, key(7), CaptureSource::BondEnumeration));
        assert_eq!(session.read(), first);
    }

    #[test]
    fn test_same_key_under_other_address_is_idempotent() {
        let identity = Address::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let session = session_with(Arc::default());
        session.capture(PEER, key(7), CaptureSource::KeyExchange);
        let first = session.read();

        assert!(!session.capture(identity, key(7), CaptureSource::BondEnumeration));
        assert_eq!(session.read(), first);
        assert_eq!(session.read().peer_address(), Some(PEER));
    }

    #[test]
    fn test_new_key_overwrites() {
        let session = session_with(Arc::default());
        session.capture(PEER, key(1), CaptureSource::KeyExchange);
        assert!(session.capture(PEER, key(2), CaptureSource::BondEnumeration));
        assert_eq!(session.read().key(), Some(&key(2)));
    }

    #[test]
    fn test_reset_clears_state_and_bonds() {
        let db = Arc::new(MemoryBondDatabase::with_peers(vec![BondedPeer {
            address: PEER,
            identity_key: Some(key(3)),
        }]));
        let session = session_with(db.clone());
        session.capture(PEER, key(3), CaptureSource::BondEnumeration);

        assert_eq!(session.reset(), Ok(1));
        assert_eq!(session.read(), SessionSnapshot::default());
        assert!(db.is_empty());
    }

    #[test]
    fn test_reset_from_empty_state() {
        let session = session_with(Arc::default());
        assert_eq!(session.reset(), Ok(0));
        assert!(!session.read().is_retrieved());
    }

    #[test]
    fn test_reset_clears_even_when_store_fails() {
        let db = Arc::new(MemoryBondDatabase::default());
        db.set_unavailable(true);
        let session = session_with(db);
        session.capture(PEER, key(9), CaptureSource::KeyExchange);

        assert!(session.reset().is_err());
        assert!(!session.read().is_retrieved());
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_state() {
        let session = session_with(Arc::default());
        let writer = {
            let session = session.clone();
            std::thread::spawn(move || {
                for i in 0..200u8 {
                    session.capture(PEER, key(i), CaptureSource::KeyExchange);
                    if i % 3 == 0 {
                        session.reset().unwrap();
                    }
                }
            })
        };

        for _ in 0..2000 {
            let snap = session.read();
            match (snap.key(), snap.encodings()) {
                (Some(k), Some(enc)) => {
                    assert!(snap.is_retrieved());
                    assert_eq!(enc, &k.encodings());
                }
                (None, None) => assert!(!snap.is_retrieved()),
                _ => panic!("torn snapshot"),
            }
        }
        writer.join().unwrap();
    }
}
