#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Teegate core mediation logic
//!
//! A hypervisor-side mediator between virtual machines and the TEE living
//! in the CPU's secure processing state. Guests issue secure-monitor calls
//! meant for the TEE; the mediator intercepts each one, validates and
//! shadows its message buffers, translates guest-physical references into
//! host-physical ones, tracks RPC conversations across suspensions, and
//! replays the call to the firmware under a per-VM identity.
//!
//! The host wires the mediator in through the seams defined in
//! `teegate-hal` and drives it through the operations shim in [`shim`].

extern crate alloc;

pub mod call;
pub mod dispatch;
pub mod log;
pub mod mediator;
pub mod msg;
pub mod shim;
pub mod shm;
pub mod smc;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;

pub use mediator::{Mediator, MediatorConfig, FIRST_GUEST_VMID, HOST_VMID, HYP_VMID};
pub use shim::MediatorOps;
pub use shm::MAX_SHM_BUFFER_PAGES;

/// Teegate core error types. These travel to the host; guests only ever see
/// protocol return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediatorError {
    /// A null or unknown handle, or a configuration the mediator cannot
    /// accept.
    InvalidArgument,
    /// The firmware refused the request, or an operations set is already
    /// registered.
    Busy,
    /// The firmware does not support VM lifecycle notifications.
    NotSupported,
    /// No live operations set behind the shim.
    NotRegistered,
}
