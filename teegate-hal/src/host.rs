//! Host-side address services
//!
//! The mediator allocates shadow pages and page-table records from the host
//! heap but hands them to the firmware by physical address; this trait
//! provides the translation. It also reports the host page granule so init
//! can refuse hosts whose pages are smaller than the firmware's
//! non-contiguous page unit.

use crate::{HostPhysAddr, HostVirtAddr};

pub trait HostMemory {
    /// Translate a host-virtual address of mediator-owned memory into the
    /// host-physical address the firmware will consume.
    fn virt_to_phys(&self, hva: HostVirtAddr) -> HostPhysAddr;

    /// Host page size in bytes.
    fn page_size(&self) -> usize {
        4096
    }
}
