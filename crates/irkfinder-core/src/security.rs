//! Security Manager parameters applied to the controller at boot.
//!
//! These are fixed: every connection is forced through authenticated,
//! bonded LE Secure Connections pairing, and both sides distribute their
//! encryption and identity keys so the peer's IRK reaches us.

use bitflags::bitflags;

bitflags! {
    /// Key types distributed during bonding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyDistribution: u8 {
        /// Long Term Key / encryption information.
        const ENCRYPTION = 1 << 0;
        /// Identity Resolving Key and identity address.
        const IDENTITY = 1 << 1;
        /// Connection Signature Resolving Key.
        const SIGNING = 1 << 2;
    }
}

/// Authentication requirements requested from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// LE Secure Connections with MITM protection and bonding.
    SecureConnectionsMitmBond,
}

/// Local input/output capability advertised during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// No display and no keyboard.
    NoInputNoOutput,
}

/// Link security requested when a peer connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    /// Encryption without MITM protection.
    Encrypt,
    /// Encryption with MITM protection; forces authenticated pairing.
    EncryptMitm,
}

/// Fixed Security Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityParams {
    /// Authentication requirements.
    pub auth_mode: AuthMode,
    /// Local IO capability.
    pub io_capability: IoCapability,
    /// Maximum encryption key size in bytes.
    pub max_key_size: u8,
    /// Keys the initiator distributes.
    pub initiator_keys: KeyDistribution,
    /// Keys the responder distributes.
    pub responder_keys: KeyDistribution,
    /// Static six-digit passkey.
    pub static_passkey: u32,
    /// Whether pairing is refused when the peer cannot meet `auth_mode`.
    pub only_accept_specified_auth: bool,
}

impl SecurityParams {
    /// The boot-time parameters with the given static passkey.
    #[must_use]
    pub const fn with_passkey(static_passkey: u32) -> Self {
        Self {
            auth_mode: AuthMode::SecureConnectionsMitmBond,
            io_capability: IoCapability::NoInputNoOutput,
            max_key_size: 16,
            initiator_keys: KeyDistribution::ENCRYPTION.union(KeyDistribution::IDENTITY),
            responder_keys: KeyDistribution::ENCRYPTION.union(KeyDistribution::IDENTITY),
            static_passkey,
            only_accept_specified_auth: false,
        }
    }
}

impl Default for SecurityParams {
    fn default() -> Self {
        Self::with_passkey(crate::config::DEFAULT_PASSKEY)
    }
}
