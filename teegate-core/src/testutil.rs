//! In-memory fakes for the HAL seams, shared by the unit tests.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use teegate_hal::{
    GuestId, GuestMemory, GuestPhysAddr, HostMemory, HostPhysAddr, HostVirtAddr, MemoryError,
    SmcArgs, SmcConduit, SmcResult, TeePlatform, VcpuRegisters,
};

use crate::msg::{self, NONCONTIG_PAGE_SIZE};
use crate::smc;

const PAGE_MASK: u64 = NONCONTIG_PAGE_SIZE as u64 - 1;

struct FakeGuestInner {
    pages: Mutex<BTreeMap<u64, Box<[u8; NONCONTIG_PAGE_SIZE]>>>,
    pins: Mutex<BTreeMap<u64, u32>>,
    // pages that translate fine but refuse to pin
    deny_pin: Mutex<BTreeSet<u64>>,
}

/// Guest memory backed by a sparse page map with pin counting. Host-virtual
/// and host-physical addresses are both the page's heap address, so the
/// fake firmware can reach "physical" memory with plain pointer arithmetic.
#[derive(Clone)]
pub struct FakeGuestMem(Arc<FakeGuestInner>);

impl FakeGuestMem {
    pub fn new() -> Self {
        FakeGuestMem(Arc::new(FakeGuestInner {
            pages: Mutex::new(BTreeMap::new()),
            pins: Mutex::new(BTreeMap::new()),
            deny_pin: Mutex::new(BTreeSet::new()),
        }))
    }

    /// Make a mapped page refuse pinning, modelling a frame the host cannot
    /// hold long-term even though it translates.
    pub fn deny_pin(&self, gpa: GuestPhysAddr) {
        self.0.deny_pin.lock().insert(gpa & !PAGE_MASK);
    }

    /// Map a zeroed page at the given page-aligned guest-physical address.
    pub fn add_page(&self, gpa: GuestPhysAddr) {
        assert_eq!(gpa & PAGE_MASK, 0, "page base required");
        self.0
            .pages
            .lock()
            .insert(gpa, Box::new([0; NONCONTIG_PAGE_SIZE]));
    }

    pub fn pin_count(&self, gpa: GuestPhysAddr) -> u32 {
        self.0
            .pins
            .lock()
            .get(&(gpa & !PAGE_MASK))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_pins(&self) -> u32 {
        self.0.pins.lock().values().sum()
    }

    /// Test-side write into guest memory.
    pub fn poke(&self, gpa: GuestPhysAddr, bytes: &[u8]) {
        self.write(gpa, bytes).expect("poke into unmapped page");
    }

    pub fn poke_u32(&self, gpa: GuestPhysAddr, value: u32) {
        self.poke(gpa, &value.to_le_bytes());
    }

    pub fn poke_u64(&self, gpa: GuestPhysAddr, value: u64) {
        self.poke(gpa, &value.to_le_bytes());
    }

    /// Test-side read out of guest memory.
    pub fn peek(&self, gpa: GuestPhysAddr, len: usize) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; len];
        self.read(gpa, &mut buf).expect("peek from unmapped page");
        buf
    }

    pub fn peek_u32(&self, gpa: GuestPhysAddr) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.peek(gpa, 4));
        u32::from_le_bytes(bytes)
    }

    pub fn peek_u64(&self, gpa: GuestPhysAddr) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.peek(gpa, 8));
        u64::from_le_bytes(bytes)
    }

    /// Snapshot a whole guest page.
    pub fn page_snapshot(&self, gpa: GuestPhysAddr) -> Vec<u8> {
        self.peek(gpa & !PAGE_MASK, NONCONTIG_PAGE_SIZE)
    }
}

impl GuestMemory for FakeGuestMem {
    fn pin(&self, gpa: GuestPhysAddr) -> Result<(), MemoryError> {
        let base = gpa & !PAGE_MASK;
        if !self.0.pages.lock().contains_key(&base) {
            return Err(MemoryError::Retry);
        }
        if self.0.deny_pin.lock().contains(&base) {
            return Err(MemoryError::Retry);
        }
        *self.0.pins.lock().entry(base).or_insert(0) += 1;
        Ok(())
    }

    fn unpin(&self, gpa: GuestPhysAddr) {
        let base = gpa & !PAGE_MASK;
        let mut pins = self.0.pins.lock();
        if let Some(count) = pins.get_mut(&base) {
            if *count > 0 {
                *count -= 1;
            }
        }
    }

    fn gpa_to_hva(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr> {
        let base = gpa & !PAGE_MASK;
        self.0
            .pages
            .lock()
            .get(&base)
            .map(|page| page.as_ptr() as HostVirtAddr)
    }

    fn gpa_to_phys(&self, gpa: GuestPhysAddr) -> Option<HostPhysAddr> {
        self.gpa_to_hva(gpa)
    }

    fn read(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let pages = self.0.pages.lock();
        let mut offset = 0usize;
        while offset < buf.len() {
            let addr = gpa + offset as u64;
            let base = addr & !PAGE_MASK;
            let page = pages.get(&base).ok_or(MemoryError::BadAddress)?;
            let in_page = (addr & PAGE_MASK) as usize;
            let take = (NONCONTIG_PAGE_SIZE - in_page).min(buf.len() - offset);
            buf[offset..offset + take].copy_from_slice(&page[in_page..in_page + take]);
            offset += take;
        }
        Ok(())
    }

    fn write(&self, gpa: GuestPhysAddr, buf: &[u8]) -> Result<(), MemoryError> {
        let mut pages = self.0.pages.lock();
        let mut offset = 0usize;
        while offset < buf.len() {
            let addr = gpa + offset as u64;
            let base = addr & !PAGE_MASK;
            let page = pages.get_mut(&base).ok_or(MemoryError::BadAddress)?;
            let in_page = (addr & PAGE_MASK) as usize;
            let take = (NONCONTIG_PAGE_SIZE - in_page).min(buf.len() - offset);
            page[in_page..in_page + take].copy_from_slice(&buf[offset..offset + take]);
            offset += take;
        }
        Ok(())
    }
}

type Firmware = Box<dyn FnMut(&SmcArgs) -> SmcResult + Send>;

/// Platform fake: guest directory, identity virt-to-phys, and a scripted
/// firmware closure standing in for the secure monitor.
pub struct FakePlatform {
    guests: Mutex<BTreeMap<GuestId, FakeGuestMem>>,
    firmware: Mutex<Firmware>,
    smc_log: Mutex<Vec<SmcArgs>>,
}

impl FakePlatform {
    /// Firmware that acknowledges everything with `RETURN_OK`.
    pub fn new() -> Self {
        Self::with_firmware(|_| SmcResult {
            a0: smc::RETURN_OK,
            ..SmcResult::default()
        })
    }

    pub fn with_firmware(f: impl FnMut(&SmcArgs) -> SmcResult + Send + 'static) -> Self {
        FakePlatform {
            guests: Mutex::new(BTreeMap::new()),
            firmware: Mutex::new(Box::new(f)),
            smc_log: Mutex::new(Vec::new()),
        }
    }

    pub fn set_firmware(&self, f: impl FnMut(&SmcArgs) -> SmcResult + Send + 'static) {
        *self.firmware.lock() = Box::new(f);
    }

    pub fn add_guest(&self, id: GuestId) -> FakeGuestMem {
        let mem = FakeGuestMem::new();
        self.guests.lock().insert(id, mem.clone());
        mem
    }

    /// Every invocation the firmware has seen, in order.
    pub fn smc_log(&self) -> Vec<SmcArgs> {
        self.smc_log.lock().clone()
    }
}

impl SmcConduit for FakePlatform {
    fn smc(&self, args: &SmcArgs) -> SmcResult {
        self.smc_log.lock().push(*args);
        (self.firmware.lock())(args)
    }
}

impl HostMemory for FakePlatform {
    fn virt_to_phys(&self, hva: HostVirtAddr) -> HostPhysAddr {
        hva
    }
}

impl TeePlatform for FakePlatform {
    type Guest = FakeGuestMem;

    fn guest_memory(&self, guest: GuestId) -> Option<FakeGuestMem> {
        self.guests.lock().get(&guest).cloned()
    }
}

/// Write into "physical" memory the way the secure world would. Valid only
/// for addresses minted by [`FakePlatform`]'s identity mapping.
pub fn poke_phys(phys: HostPhysAddr, offset: usize, bytes: &[u8]) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            (phys as usize + offset) as *mut u8,
            bytes.len(),
        );
    }
}

pub fn poke_phys_u32(phys: HostPhysAddr, offset: usize, value: u32) {
    poke_phys(phys, offset, &value.to_le_bytes());
}

/// Read "physical" memory the way the secure world would.
pub fn peek_phys_u64(phys: HostPhysAddr, offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    unsafe {
        core::ptr::copy_nonoverlapping(
            (phys as usize + offset) as *const u8,
            bytes.as_mut_ptr(),
            8,
        );
    }
    u64::from_le_bytes(bytes)
}

/// Lay out a non-contiguous page-list chain in guest memory: the records at
/// `list_gpa`, the data pages at 1 MiB steps. Returns the data page
/// addresses in list order.
pub fn build_page_list(guest: &FakeGuestMem, list_gpa: u64, num_pages: usize) -> Vec<u64> {
    let page = NONCONTIG_PAGE_SIZE as u64;
    let records = num_pages.div_ceil(msg::BUFFER_ENTRIES);
    for r in 0..records {
        guest.add_page(list_gpa + r as u64 * page);
    }
    let mut data_pages = Vec::new();
    for i in 0..num_pages {
        let gpa = 0x10_0000 + i as u64 * 0x10_0000;
        guest.add_page(gpa);
        data_pages.push(gpa);
        let record = list_gpa + (i / msg::BUFFER_ENTRIES) as u64 * page;
        let slot = (i % msg::BUFFER_ENTRIES) as u64;
        guest.poke_u64(record + slot * 8, gpa);
    }
    for r in 0..records.saturating_sub(1) {
        let link_offs = msg::BUFFER_ENTRIES as u64 * 8;
        guest.poke_u64(
            list_gpa + r as u64 * page + link_offs,
            list_gpa + (r as u64 + 1) * page,
        );
    }
    data_pages
}

/// Compose a message argument in guest memory: the command, the parameter
/// count, and one `[attr, slot0, slot1, slot2]` row per parameter.
pub fn write_arg_page(guest: &FakeGuestMem, gpa: u64, cmd: u32, params: &[[u64; 4]]) {
    guest.poke_u32(gpa + msg::OFFS_CMD as u64, cmd);
    guest.poke_u32(gpa + msg::OFFS_NUM_PARAMS as u64, params.len() as u32);
    for (i, param) in params.iter().enumerate() {
        guest.poke_u64(gpa + msg::param_offset(i) as u64, param[0]);
        for slot in 0..3 {
            guest.poke_u64(
                gpa + msg::param_slot_offset(i, slot) as u64,
                param[slot + 1],
            );
        }
    }
}

/// Register file fake for dispatcher tests.
pub struct FakeVcpu {
    args: SmcArgs,
    pub result: Option<SmcResult>,
}

impl FakeVcpu {
    pub fn new(args: SmcArgs) -> Self {
        FakeVcpu { args, result: None }
    }
}

impl VcpuRegisters for FakeVcpu {
    fn args(&self) -> SmcArgs {
        self.args
    }

    fn set_result(&mut self, res: &SmcResult) {
        self.result = Some(*res);
    }
}
