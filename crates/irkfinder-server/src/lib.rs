//! # irkfinder-server
//!
//! HTTP layer for irkfinder: the status, reset and health endpoints over a
//! shared [`irkfinder_core::Session`], plus logging setup for the daemon.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
