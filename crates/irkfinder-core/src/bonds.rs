//! Bonded device store.
//!
//! A thin view over the BLE stack's persistent bond database. The database
//! owns the lifecycle of every bond; this module only reads it and can ask
//! for bonds to be deleted.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{Address, BondedPeer};

/// Failures of the underlying bond database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BondStoreError {
    /// The bond database could not be read.
    #[error("Bond database unavailable: {0}")]
    Unavailable(String),

    /// A single bond could not be deleted.
    #[error("Failed to remove bond for {address}: {message}")]
    RemoveFailed {
        /// The peer whose bond survived.
        address: Address,
        /// Reason reported by the database.
        message: String,
    },
}

/// The BLE stack's persistent list of bonded peers.
pub trait BondDatabase: Send + Sync {
    /// Every bonded peer, in database order.
    fn list(&self) -> Result<Vec<BondedPeer>, BondStoreError>;

    /// Delete the bond for `address`.
    fn remove(&self, address: Address) -> Result<(), BondStoreError>;
}

/// Read/delete access to bonded peers.
#[derive(Clone)]
pub struct BondedDeviceStore {
    db: Arc<dyn BondDatabase>,
}

impl BondedDeviceStore {
    /// Wrap a bond database.
    pub fn new(db: Arc<dyn BondDatabase>) -> Self {
        Self { db }
    }

    /// Every bonded peer, or an empty list when none exist.
    ///
    /// An unreadable database is reported as zero peers: "nothing bonded yet"
    /// is the common case and callers treat both the same way. Use
    /// [`Self::try_list_bonded_peers`] to tell them apart.
    pub fn list_bonded_peers(&self) -> Vec<BondedPeer> {
        match self.db.list() {
            Ok(peers) => {
                debug!(count = peers.len(), "Enumerated bonded peers");
                peers
            }
            Err(e) => {
                warn!(error = %e, "Bond database unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    /// Every bonded peer, surfacing database failures.
    ///
    /// # Errors
    ///
    /// Returns [`BondStoreError::Unavailable`] if the database cannot be read.
    pub fn try_list_bonded_peers(&self) -> Result<Vec<BondedPeer>, BondStoreError> {
        self.db.list()
    }

    /// Delete every bonded peer. Returns how many bonds were removed.
    ///
    /// Removing from an empty database succeeds with `0`. Session state is
    /// not touched here.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be read or a bond cannot be deleted.
    /// Bonds removed before the failure stay removed.
    pub fn remove_all_bonded_peers(&self) -> Result<usize, BondStoreError> {
        let peers = self.db.list()?;
        if peers.is_empty() {
            debug!("No bonded peers to remove");
            return Ok(0);
        }

        for peer in &peers {
            self.db.remove(peer.address)?;
            debug!(address = %peer.address, "Removed bond");
        }

        info!(count = peers.len(), "Removed all bonded peers");
        Ok(peers.len())
    }
}
