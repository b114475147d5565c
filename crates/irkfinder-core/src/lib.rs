//! # irkfinder-core
//!
//! Core logic for irkfinder: a BLE peripheral that pairs with a phone and
//! surfaces the phone's Identity Resolving Key for presence-detection tools.
//!
//! This crate provides:
//! - The advertising and GATT bring-up state machines
//! - The pairing policy and identity key capture
//! - Encodings of the captured key (hex, reversed hex, base64, array literal)
//! - Configuration management
//! - A BlueZ backend (feature `bluetooth`)
//!
//! ## Architecture
//!
//! - [`controller`] - The controller seam: fire-and-forget requests, events back
//! - [`peripheral`] - Event dispatch and the periodic bond poll
//! - [`advertising`] - Privacy → payloads → advertising state machine
//! - [`gatt`] - Static attribute table and service registration
//! - [`negotiation`] - Pairing policy and key capture
//! - [`session`] - The latest captured identity, behind one lock
//! - [`bonds`] - Bonded device store over a [`bonds::BondDatabase`]
//! - [`codec`] - Identity key encodings and their parsers
//! - [`config`] - Layered configuration loading, saving and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod advertising;
#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod bluez_store;
pub mod bonds;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod gatt;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;
pub mod negotiation;
pub mod peripheral;
pub mod security;
pub mod session;
pub mod types;

// Re-export primary types for convenience
pub use advertising::{AdvertisingConfig, AdvertisingController, AdvertisingState};
#[cfg(feature = "bluetooth")]
pub use bluez::{BluezBondDatabase, BluezController};
pub use bluez_store::{BluezStorage, DaemonSettings};
pub use bonds::{BondDatabase, BondStoreError, BondedDeviceStore};
pub use codec::{CodecError, IdentityKey, KeyEncodingSet};
pub use config::{BleConfig, Config, ConfigError, ConfigResult, ServerConfig};
pub use controller::{BleController, ControllerError, ControllerEvent, Status};
pub use error::{IrkError, Result};
pub use gatt::{GattRegistrar, RegistrarState};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{MemoryBondDatabase, MockController};
pub use negotiation::SecurityNegotiationHandler;
pub use peripheral::{
    event_channel, spawn_bond_lookup, spawn_bond_poll, BringUpStatus, EventSender, Peripheral,
};
pub use session::{Session, SessionSnapshot};
pub use types::{is_valid_mac_address, Address, BondedPeer, CaptureSource};
