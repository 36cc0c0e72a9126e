#![no_std]

//! Teegate, a hypervisor-side TEE mediator
//!
//! Re-exports the core mediation logic and the host abstraction layer;
//! architecture crates are pulled in by feature.

pub use teegate_core::{
    log, mediator, msg, shim, shm, smc, vm, Mediator, MediatorConfig, MediatorError, MediatorOps,
    FIRST_GUEST_VMID, HOST_VMID, HYP_VMID, MAX_SHM_BUFFER_PAGES,
};
pub use teegate_hal as hal;

#[cfg(feature = "arm64")]
pub use teegate_arm64 as arm64;
