//! Mediator lifecycle and VM directory
//!
//! The [`Mediator`] is the process-wide resource the host embeds: it owns
//! the directory of per-VM contexts, assigns firmware-facing VM identities,
//! and announces VM births and deaths to the TEE. Construction probes the
//! firmware for virtualization support; everything after that is driven by
//! the host through the operations shim and the dispatcher.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use teegate_hal::{GuestId, SmcArgs, TeePlatform};

use crate::log;
use crate::msg;
use crate::shm::MAX_SHM_BUFFER_PAGES;
use crate::smc;
use crate::vm::VmContext;
use crate::MediatorError;

/// VM identity reserved for the hypervisor itself.
pub const HYP_VMID: u64 = 0;
/// VM identity reserved for the host.
pub const HOST_VMID: u64 = 1;
/// First identity handed to a guest.
pub const FIRST_GUEST_VMID: u64 = 2;

/// Tunables validated at init.
#[derive(Debug, Clone, Copy)]
pub struct MediatorConfig {
    /// Pinned shared-memory pages a single VM may hold.
    pub max_shm_pages: u64,
    /// Bound on firmware re-entries while chasing a lost RPC cookie.
    pub rpc_restart_limit: u32,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        MediatorConfig {
            max_shm_pages: MAX_SHM_BUFFER_PAGES,
            rpc_restart_limit: 64,
        }
    }
}

impl MediatorConfig {
    fn validate(&self) -> Result<(), MediatorError> {
        if self.max_shm_pages == 0 || self.rpc_restart_limit == 0 {
            return Err(MediatorError::InvalidArgument);
        }
        Ok(())
    }
}

/// Process-wide mediator state.
pub struct Mediator<P: TeePlatform> {
    platform: P,
    config: MediatorConfig,
    vms: Mutex<BTreeMap<GuestId, Arc<VmContext<P::Guest>>>>,
    next_vmid: AtomicU64,
    /// Concurrent standard calls the firmware can take per VM; learned from
    /// the firmware's thread-count reply. Standard calls are refused until
    /// a query succeeds.
    thread_limit: AtomicU32,
    alive: Mutex<bool>,
}

impl<P: TeePlatform> core::fmt::Debug for Mediator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mediator").finish_non_exhaustive()
    }
}

impl<P: TeePlatform> Mediator<P> {
    /// Probe the firmware and bring up an empty mediator.
    ///
    /// Fails with `NotSupported` if the firmware does not acknowledge VM
    /// lifecycle calls, and with `InvalidArgument` if the host page size is
    /// smaller than the protocol page unit.
    pub fn new(platform: P, config: MediatorConfig) -> Result<Self, MediatorError> {
        config.validate()?;

        if msg::NONCONTIG_PAGE_SIZE > platform.page_size() {
            return Err(MediatorError::InvalidArgument);
        }

        let probe = platform.smc(&SmcArgs {
            a0: smc::VM_DESTROYED,
            ..SmcArgs::default()
        });
        if probe.a0 == smc::RETURN_UNKNOWN_FUNCTION {
            return Err(MediatorError::NotSupported);
        }

        log!("mediator initialised");

        Ok(Mediator {
            platform,
            config,
            vms: Mutex::new(BTreeMap::new()),
            next_vmid: AtomicU64::new(FIRST_GUEST_VMID),
            thread_limit: AtomicU32::new(0),
            alive: Mutex::new(true),
        })
    }

    pub(crate) fn platform(&self) -> &P {
        &self.platform
    }

    pub(crate) fn config(&self) -> &MediatorConfig {
        &self.config
    }

    pub(crate) fn thread_limit(&self) -> u32 {
        self.thread_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn latch_thread_limit(&self, limit: u32) {
        self.thread_limit.store(limit, Ordering::Relaxed);
    }

    pub(crate) fn find_vm(&self, guest: GuestId) -> Option<Arc<VmContext<P::Guest>>> {
        self.vms.lock().get(&guest).cloned()
    }

    fn announce(&self, func: u32, vmid: u64) -> u32 {
        let res = self.platform.smc(&SmcArgs {
            a0: func,
            a1: vmid as u32,
            ..SmcArgs::default()
        });
        res.a0
    }

    /// Tell the firmware the host exists. The host shares the mediator's
    /// fate, so a refusal is reported as `Busy` just like a guest refusal.
    pub fn create_host(&self) -> Result<(), MediatorError> {
        if self.announce(smc::VM_CREATED, HOST_VMID) == smc::RETURN_ENOTAVAIL {
            return Err(MediatorError::Busy);
        }
        Ok(())
    }

    pub fn destroy_host(&self) -> Result<(), MediatorError> {
        self.announce(smc::VM_DESTROYED, HOST_VMID);
        Ok(())
    }

    /// Register a guest: assign the next VM identity and announce it to the
    /// firmware. Identities are never reused, even when the firmware
    /// refuses the guest.
    pub fn create_vm(&self, guest: GuestId) -> Result<u64, MediatorError> {
        let mem = self
            .platform
            .guest_memory(guest)
            .ok_or(MediatorError::InvalidArgument)?;
        if self.vms.lock().contains_key(&guest) {
            return Err(MediatorError::InvalidArgument);
        }

        let vmid = self.next_vmid.fetch_add(1, Ordering::Relaxed);

        if self.announce(smc::VM_CREATED, vmid) == smc::RETURN_ENOTAVAIL {
            return Err(MediatorError::Busy);
        }

        self.vms
            .lock()
            .insert(guest, Arc::new(VmContext::new(mem, vmid)));

        log!("vm {} created for guest {}", vmid, guest);
        Ok(vmid)
    }

    /// Unregister a guest. The firmware hears about the death first, so no
    /// resume can race the teardown; afterwards every call, buffer and RPC
    /// object is destroyed and every pin dropped.
    pub fn destroy_vm(&self, guest: GuestId) -> Result<(), MediatorError> {
        let ctx = self
            .vms
            .lock()
            .remove(&guest)
            .ok_or(MediatorError::InvalidArgument)?;

        self.announce(smc::VM_DESTROYED, ctx.vmid());
        ctx.teardown();

        log!("vm {} destroyed", ctx.vmid());
        Ok(())
    }

    /// Lifecycle gate consulted by the operations shim.
    pub fn is_active(&self) -> bool {
        *self.alive.lock()
    }

    /// Tear the mediator down: close the gate and release every remaining
    /// VM context.
    pub fn shutdown(&self) {
        *self.alive.lock() = false;

        let contexts = core::mem::take(&mut *self.vms.lock());
        for ctx in contexts.values() {
            ctx.teardown();
        }

        log!("mediator exiting");
    }
}
