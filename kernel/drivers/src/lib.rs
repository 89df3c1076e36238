//! Hardware drivers for the Meson kernel.
//!
//! Network devices implement [`meson_net::iface::DeviceOps`] and are handed
//! to the interface registry at boot.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod e1000;
pub mod loopback;
