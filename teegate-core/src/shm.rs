//! Shared-memory shadow builder
//!
//! Guests describe non-contiguous buffers as a chain of page-table records
//! in their own memory. The firmware must never read those records after
//! validation, so the builder walks the guest chain once and produces a
//! parallel, mediator-owned chain holding host-physical page addresses.
//! The guest pages named by the list are pinned for the life of the
//! resulting buffer, and their tally is charged against the per-VM budget.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use teegate_hal::{GuestMemory, GuestPhysAddr, TeePlatform};

use crate::mediator::Mediator;
use crate::msg::{self, PageData, BUFFER_ENTRIES, NONCONTIG_PAGE_SIZE};
use crate::vm::{RegistryError, ShmBuf, VmContext};

/// Pinned shared-memory pages a single VM may hold.
pub const MAX_SHM_BUFFER_PAGES: u64 = 512;

/// Builder errors, reported to the guest as protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    /// The buffer would push the VM past its pinned-page budget.
    OutOfMemory,
    /// The page list is malformed: unmapped records, a chain that ends
    /// early, an empty buffer, or a cookie already in use.
    BadParameters,
}

impl<P: TeePlatform> Mediator<P> {
    /// Convert the guest page list at `buf_ptr` into a shadow chain and
    /// register it under `cookie`, pinning every recorded page.
    ///
    /// Returns the value the parameter's buffer pointer must be rewritten
    /// to: the physical address of the first shadow record with the
    /// original page offset in the low bits. A zero `buf_ptr` is passed
    /// through untouched.
    ///
    /// On failure all partially built state unwinds; the VM's tally and
    /// pins are untouched.
    pub(crate) fn resolve_noncontig(
        &self,
        vm: &VmContext<P::Guest>,
        buf_ptr: u64,
        size: u64,
        cookie: u64,
    ) -> Result<u64, ShmError> {
        if buf_ptr == 0 {
            return Ok(0);
        }

        let page_size = NONCONTIG_PAGE_SIZE as u64;
        let offset = buf_ptr & (page_size - 1);
        let num_entries = match size.checked_add(offset + page_size - 1) {
            Some(total) => total / page_size,
            None => return Err(ShmError::BadParameters),
        };
        if num_entries == 0 {
            return Err(ShmError::BadParameters);
        }

        if vm.shm_buf_page_count() + num_entries > self.config().max_shm_pages {
            return Err(ShmError::OutOfMemory);
        }

        let num_buffers = (num_entries + BUFFER_ENTRIES as u64 - 1) / BUFFER_ENTRIES as u64;

        let mut shadow: Vec<Box<PageData>> = Vec::new();
        let mut guest_pages: Vec<GuestPhysAddr> = Vec::new();
        let mut record = alloc::vec![0u8; NONCONTIG_PAGE_SIZE];
        let mut record_gpa = buf_ptr & !(page_size - 1);

        for i in 0..num_buffers {
            vm.guest()
                .read(record_gpa, &mut record)
                .map_err(|_| ShmError::BadParameters)?;

            let mut shadow_record = PageData::new_zeroed();
            for entry in 0..BUFFER_ENTRIES {
                let entry_gpa = msg::page_data_entry(&record, entry);
                // empty slots are skipped but keep their index
                if entry_gpa == 0 {
                    continue;
                }
                if vm.guest().gpa_to_hva(entry_gpa).is_none() {
                    continue;
                }
                if (guest_pages.len() as u64) < num_entries {
                    guest_pages.push(entry_gpa);
                }
                if let Some(phys) = vm.guest().gpa_to_phys(entry_gpa) {
                    shadow_record.pages[entry] = phys;
                }
            }

            let record_phys = self
                .platform()
                .virt_to_phys(shadow_record.as_ref() as *const PageData as u64);
            if let Some(prev) = shadow.last_mut() {
                prev.next_page_data = record_phys;
            }
            shadow.push(shadow_record);

            if i + 1 < num_buffers {
                let next = msg::page_data_next(&record);
                if next == 0 || vm.guest().gpa_to_hva(next).is_none() {
                    return Err(ShmError::BadParameters);
                }
                record_gpa = next & !(page_size - 1);
            }
        }

        let head_phys = self
            .platform()
            .virt_to_phys(shadow[0].as_ref() as *const PageData as u64);

        vm.enlist_shm_buf(
            ShmBuf {
                cookie,
                guest_pages,
                num_pages: num_entries,
                shadow,
            },
            self.config().max_shm_pages,
        )
        .map_err(|err| match err {
            RegistryError::PageCapExceeded => ShmError::OutOfMemory,
            RegistryError::CookieInUse | RegistryError::PinFailed => ShmError::BadParameters,
        })?;

        Ok(head_phys | offset)
    }
}
