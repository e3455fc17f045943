//! Kernel-facing wireguard layer.
//!
//! [`WgApi`] is the capability handle for one kernel's wireguard state; the
//! server and the device agent both drive their interfaces through it. The
//! Linux implementation talks generic netlink (wireguard-uapi) for device
//! config and rtnetlink for addresses and link state.

pub mod client;
pub mod platform;

#[cfg(test)]
mod mock;

pub use client::{ClientConfig, start_client};
pub use platform::{CurrentWg, PeerSpec, StubWg, WgApi, WgError, ensure_interface};

/// Interface created when the host has none yet.
pub const DEFAULT_INTERFACE: &str = "wg0";

/// UDP port the mesh server listens on.
pub const LISTEN_PORT: u16 = 51820;

/// Keepalive interval in seconds; keeps NAT'd peers reachable.
pub const PERSISTENT_KEEPALIVE: u16 = 5;
