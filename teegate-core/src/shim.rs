//! Host operations shim
//!
//! The host kernel does not talk to a concrete mediator type; it calls the
//! free functions here, which forward to whatever operations set is
//! currently registered. A mediator registers its capability set once at
//! init and pulls it on teardown; every entry point checks registration and
//! the mediator's own liveness gate before forwarding.

extern crate alloc;

use alloc::sync::Arc;
use spin::Mutex;

use teegate_hal::{GuestId, TeePlatform, VcpuRegisters};

use crate::mediator::Mediator;
use crate::MediatorError;

/// The six operations a mediator offers the host.
pub trait MediatorOps: Send + Sync {
    fn create_host(&self) -> Result<(), MediatorError>;
    fn destroy_host(&self) -> Result<(), MediatorError>;
    fn create_vm(&self, guest: GuestId) -> Result<(), MediatorError>;
    fn destroy_vm(&self, guest: GuestId) -> Result<(), MediatorError>;
    fn forward_request(&self, guest: GuestId, vcpu: &mut dyn VcpuRegisters);
    fn is_active(&self) -> bool;
}

impl<P> MediatorOps for Mediator<P>
where
    P: TeePlatform + Send + Sync,
    P::Guest: Send + Sync,
{
    fn create_host(&self) -> Result<(), MediatorError> {
        Mediator::create_host(self)
    }

    fn destroy_host(&self) -> Result<(), MediatorError> {
        Mediator::destroy_host(self)
    }

    fn create_vm(&self, guest: GuestId) -> Result<(), MediatorError> {
        Mediator::create_vm(self, guest).map(|_| ())
    }

    fn destroy_vm(&self, guest: GuestId) -> Result<(), MediatorError> {
        Mediator::destroy_vm(self, guest)
    }

    fn forward_request(&self, guest: GuestId, vcpu: &mut dyn VcpuRegisters) {
        Mediator::forward_request(self, guest, vcpu);
    }

    fn is_active(&self) -> bool {
        Mediator::is_active(self)
    }
}

static OPS: Mutex<Option<Arc<dyn MediatorOps>>> = Mutex::new(None);

/// Install an operations set. Refused while another one is live.
pub fn register_ops(ops: Arc<dyn MediatorOps>) -> Result<(), MediatorError> {
    let mut slot = OPS.lock();
    if slot.is_some() {
        return Err(MediatorError::Busy);
    }
    *slot = Some(ops);
    Ok(())
}

pub fn unregister_ops() {
    *OPS.lock() = None;
}

fn active_ops() -> Option<Arc<dyn MediatorOps>> {
    let ops = OPS.lock().clone()?;
    ops.is_active().then_some(ops)
}

pub fn is_active() -> bool {
    active_ops().is_some()
}

pub fn create_host() -> Result<(), MediatorError> {
    active_ops()
        .ok_or(MediatorError::NotRegistered)?
        .create_host()
}

pub fn destroy_host() -> Result<(), MediatorError> {
    active_ops()
        .ok_or(MediatorError::NotRegistered)?
        .destroy_host()
}

pub fn create_vm(guest: GuestId) -> Result<(), MediatorError> {
    active_ops()
        .ok_or(MediatorError::NotRegistered)?
        .create_vm(guest)
}

pub fn destroy_vm(guest: GuestId) -> Result<(), MediatorError> {
    active_ops()
        .ok_or(MediatorError::NotRegistered)?
        .destroy_vm(guest)
}

/// Forward a trapped call. A quiet no-op when nothing is registered; the
/// guest simply resumes.
pub fn forward_request(guest: GuestId, vcpu: &mut dyn VcpuRegisters) {
    if let Some(ops) = active_ops() {
        ops.forward_request(guest, vcpu);
    }
}
