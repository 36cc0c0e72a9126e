//! Guest memory gateway
//!
//! All traffic between the mediator and guest memory goes through this
//! trait: pinning pages for long-term firmware use, translating
//! guest-physical addresses, and moving bytes in and out of guest pages.
//! Guest-physical addresses are opaque integers on the mediator side; the
//! gateway is the only component that resolves them, and the mediator never
//! hands a host pointer back to the guest.

use crate::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};

/// Host-assigned handle naming one guest. Distinct from the VM identity the
/// mediator assigns for the firmware's benefit.
pub type GuestId = u64;

/// Gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The guest frame is not currently mapped; the caller may retry.
    Retry,
    /// The address does not resolve to guest memory at all.
    BadAddress,
}

/// Per-guest memory gateway.
///
/// Callers pair every successful `pin` with exactly one `unpin`; pinning is
/// not idempotent at page granularity. A pin that cannot take the whole
/// requested page is a failure, never a partial success.
pub trait GuestMemory {
    /// Pin the page containing `gpa` for long-term use by the firmware.
    fn pin(&self, gpa: GuestPhysAddr) -> Result<(), MemoryError>;

    /// Release a previously pinned page. Safe no-op if the page is not
    /// present.
    fn unpin(&self, gpa: GuestPhysAddr);

    /// Resolve `gpa` to the host-virtual address of its containing page, or
    /// `None` if the frame is unmapped. Page offsets are the caller's
    /// business.
    fn gpa_to_hva(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr>;

    /// Resolve `gpa` to the host-physical address of its containing page.
    fn gpa_to_phys(&self, gpa: GuestPhysAddr) -> Option<HostPhysAddr>;

    /// Copy bytes out of guest memory starting at `gpa`.
    fn read(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy bytes into guest memory starting at `gpa`.
    fn write(&self, gpa: GuestPhysAddr, buf: &[u8]) -> Result<(), MemoryError>;
}
