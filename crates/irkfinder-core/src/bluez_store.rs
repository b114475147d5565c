//! Reader for BlueZ's on-disk bond records.
//!
//! bluetoothd keeps one directory per bonded peer under
//! `<storage>/<adapter address>/<peer address>/`, with the keys in an
//! INI-style `info` file:
//!
//! ```text
//! [IdentityResolvingKey]
//! Key=00112233445566778899AABBCCDDEEFF
//! ```
//!
//! The key is stored as 32 hex digits in the byte order bluetoothd received
//! it. The identity key is not exposed over D-Bus, so this file is the only
//! place to read it from.
//!
//! The daemon's own `main.conf` uses the same format and is read for the
//! privacy and pairing settings bluetoothd applies itself.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bonds::BondStoreError;
use crate::codec::{CodecError, IdentityKey};
use crate::types::{is_valid_mac_address, Address, BondedPeer};

const IRK_SECTION: &str = "IdentityResolvingKey";
const KEY_ENTRY: &str = "Key";
const GENERAL_SECTION: &str = "General";

/// Value of `key` in `[section]` of a bluetoothd INI-style file.
///
/// bluetoothd writes these files itself: one `key=value` per line, `#` or
/// `;` comments, no continuation lines and no quoting.
fn ini_entry<'a>(contents: &'a str, section: &str, key: &str) -> Option<&'a str> {
    let mut in_section = false;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((k, value)) = line.split_once('=') {
            if k.trim() == key {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Extract the identity key from the contents of an `info` file.
///
/// Returns `Ok(None)` when the file has no identity key section.
///
/// # Errors
///
/// Returns a codec error if the section exists but the key is malformed.
pub fn parse_identity_key(info: &str) -> Result<Option<IdentityKey>, CodecError> {
    ini_entry(info, IRK_SECTION, KEY_ENTRY)
        .map(str::parse)
        .transpose()
}

/// The `main.conf` settings that decide how bluetoothd pairs and addresses
/// on our behalf. Neither can be changed over D-Bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Controller privacy is on, so the adapter advertises with resolvable
    /// private addresses.
    pub privacy: bool,
    /// Pairing is refused unless the peer supports Secure Connections.
    pub secure_connections_only: bool,
}

impl DaemonSettings {
    /// Settings from the contents of `main.conf`. Absent entries take
    /// bluetoothd's defaults: privacy off, Secure Connections preferred.
    #[must_use]
    pub fn parse(main_conf: &str) -> Self {
        let privacy = ini_entry(main_conf, GENERAL_SECTION, "Privacy")
            .is_some_and(|mode| !matches!(mode, "off" | "false"));
        let secure_connections_only =
            ini_entry(main_conf, GENERAL_SECTION, "SecureConnections") == Some("only");
        Self {
            privacy,
            secure_connections_only,
        }
    }

    /// Settings from the `main.conf` at `path`; defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file exists but cannot be read.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let settings = Self::parse(&contents);
                debug!(path = %path.display(), ?settings, "Read bluetoothd settings");
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No bluetoothd main.conf; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Read-only view of a BlueZ storage directory.
#[derive(Debug, Clone)]
pub struct BluezStorage {
    root: PathBuf,
    adapter: Option<Address>,
}

impl BluezStorage {
    /// Storage rooted at `root` (normally `/var/lib/bluetooth`). With an
    /// `adapter` only that adapter's bonds are listed.
    pub fn new(root: impl Into<PathBuf>, adapter: Option<Address>) -> Self {
        Self {
            root: root.into(),
            adapter,
        }
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every bonded peer on disk, ordered by directory modification time
    /// (oldest first) so the most recent bond comes last.
    ///
    /// A peer whose key cannot be parsed is listed without a key.
    ///
    /// # Errors
    ///
    /// Returns [`BondStoreError::Unavailable`] if the storage root cannot be
    /// read.
    pub fn list(&self) -> Result<Vec<BondedPeer>, BondStoreError> {
        let mut peers = Vec::new();
        for adapter_dir in self.adapter_dirs()? {
            let entries = match fs::read_dir(&adapter_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %adapter_dir.display(), error = %e, "Cannot read adapter storage");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(address) = name.to_str().and_then(|n| n.parse::<Address>().ok()) else {
                    continue;
                };
                let info_path = entry.path().join("info");
                let Ok(info) = fs::read_to_string(&info_path) else {
                    continue;
                };
                let identity_key = match parse_identity_key(&info) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(%address, error = %e, "Malformed identity key in bond record");
                        None
                    }
                };
                let modified = entry.metadata().and_then(|m| m.modified()).ok();
                peers.push((
                    modified,
                    BondedPeer {
                        address,
                        identity_key,
                    },
                ));
            }
        }

        peers.sort_by_key(|(modified, _)| *modified);
        debug!(count = peers.len(), root = %self.root.display(), "Read bond records");
        Ok(peers.into_iter().map(|(_, peer)| peer).collect())
    }

    fn adapter_dirs(&self) -> Result<Vec<PathBuf>, BondStoreError> {
        if let Some(adapter) = self.adapter {
            let dir = self.root.join(adapter.to_string());
            return Ok(if dir.is_dir() { vec![dir] } else { Vec::new() });
        }

        let entries = fs::read_dir(&self.root).map_err(|e| {
            BondStoreError::Unavailable(format!("{}: {e}", self.root.display()))
        })?;
        Ok(entries
            .flatten()
            .filter(|e| e.file_name().to_str().is_some_and(is_valid_mac_address))
            .map(|e| e.path())
            .collect())
    }
}
