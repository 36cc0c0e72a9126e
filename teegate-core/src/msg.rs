//! Message ABI shared with the TEE firmware
//!
//! A call argument is a little-endian structure at the head of a guest page:
//! a 32-byte header followed by 32-byte parameters. The mediator never maps
//! that structure over raw memory; fields are decoded and encoded at fixed
//! offsets so writes back into guest pages touch exactly the bytes the
//! protocol allows and nothing else.
//!
//! Non-contiguous buffers are described by a chain of page-table records
//! ([`PageData`]): 511 physical page addresses plus a physical link to the
//! next record.

extern crate alloc;

use alloc::boxed::Box;
use static_assertions::const_assert_eq;

/// Page unit of the non-contiguous buffer protocol. Must not exceed the
/// host page size; init enforces this.
pub const NONCONTIG_PAGE_SIZE: usize = 4096;

/// Entries in one page-table record.
pub const BUFFER_ENTRIES: usize = NONCONTIG_PAGE_SIZE / 8 - 1;

/// Header is eight u32 fields.
pub const HEADER_SIZE: usize = 32;
/// Each parameter is an attribute word plus three payload words.
pub const PARAM_SIZE: usize = 32;

/// Most parameters that fit in a one-page argument.
pub const MAX_PARAMS: usize = (NONCONTIG_PAGE_SIZE - HEADER_SIZE) / PARAM_SIZE;

/// Total argument size for a given parameter count.
pub const fn arg_size(num_params: u32) -> usize {
    HEADER_SIZE + PARAM_SIZE * num_params as usize
}

// Header field offsets.
pub const OFFS_CMD: usize = 0;
pub const OFFS_FUNC: usize = 4;
pub const OFFS_SESSION: usize = 8;
pub const OFFS_CANCEL_ID: usize = 12;
pub const OFFS_RET: usize = 20;
pub const OFFS_RET_ORIGIN: usize = 24;
pub const OFFS_NUM_PARAMS: usize = 28;

/// Byte offset of parameter `i`'s attribute word.
pub const fn param_offset(i: usize) -> usize {
    HEADER_SIZE + i * PARAM_SIZE
}

/// Byte offset of payload word `slot` (0..=2) of parameter `i`. Slot 0 is
/// `tmem.buf_ptr` / `rmem.offs` / `value.a`, slot 1 the sizes / `value.b`,
/// slot 2 the shared-memory reference / `value.c`.
pub const fn param_slot_offset(i: usize, slot: usize) -> usize {
    param_offset(i) + 8 + slot * 8
}

// Parameter attribute types.
pub const ATTR_TYPE_MASK: u64 = 0xFF;
pub const ATTR_TYPE_NONE: u64 = 0;
pub const ATTR_TYPE_VALUE_INPUT: u64 = 1;
pub const ATTR_TYPE_VALUE_OUTPUT: u64 = 2;
pub const ATTR_TYPE_VALUE_INOUT: u64 = 3;
pub const ATTR_TYPE_RMEM_INPUT: u64 = 5;
pub const ATTR_TYPE_RMEM_OUTPUT: u64 = 6;
pub const ATTR_TYPE_RMEM_INOUT: u64 = 7;
pub const ATTR_TYPE_TMEM_INPUT: u64 = 9;
pub const ATTR_TYPE_TMEM_OUTPUT: u64 = 0xA;
pub const ATTR_TYPE_TMEM_INOUT: u64 = 0xB;

/// The buffer is a chain of page-table records rather than one contiguous
/// region.
pub const ATTR_NONCONTIG: u64 = 1 << 8;

/// Is this attribute any of the three TMEM types?
#[inline]
pub const fn attr_is_tmem(attr: u64) -> bool {
    matches!(
        attr & ATTR_TYPE_MASK,
        ATTR_TYPE_TMEM_INPUT | ATTR_TYPE_TMEM_OUTPUT | ATTR_TYPE_TMEM_INOUT
    )
}

// Commands carried in the argument header.
pub const CMD_OPEN_SESSION: u32 = 0;
pub const CMD_INVOKE_COMMAND: u32 = 1;
pub const CMD_CLOSE_SESSION: u32 = 2;
pub const CMD_CANCEL: u32 = 3;
pub const CMD_REGISTER_SHM: u32 = 4;
pub const CMD_UNREGISTER_SHM: u32 = 5;

// Commands carried in a firmware RPC argument.
pub const RPC_CMD_SHM_ALLOC: u32 = 6;
pub const RPC_CMD_SHM_FREE: u32 = 7;

// Client-visible error codes and origins.
pub const TEEC_ERROR_BAD_PARAMETERS: u32 = 0xFFFF_0006;
pub const TEEC_ERROR_OUT_OF_MEMORY: u32 = 0xFFFF_000C;
pub const TEEC_ORIGIN_COMMS: u32 = 2;

#[inline]
fn read_u32(page: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&page[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn write_u32(page: &mut [u8], offset: usize, value: u32) {
    page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_u64(page: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&page[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn write_u64(page: &mut [u8], offset: usize, value: u64) {
    page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn cmd(page: &[u8]) -> u32 {
    read_u32(page, OFFS_CMD)
}

pub fn session(page: &[u8]) -> u32 {
    read_u32(page, OFFS_SESSION)
}

pub fn ret(page: &[u8]) -> u32 {
    read_u32(page, OFFS_RET)
}

pub fn set_ret(page: &mut [u8], value: u32) {
    write_u32(page, OFFS_RET, value);
}

pub fn ret_origin(page: &[u8]) -> u32 {
    read_u32(page, OFFS_RET_ORIGIN)
}

pub fn set_ret_origin(page: &mut [u8], value: u32) {
    write_u32(page, OFFS_RET_ORIGIN, value);
}

pub fn num_params(page: &[u8]) -> u32 {
    read_u32(page, OFFS_NUM_PARAMS)
}

pub fn set_num_params(page: &mut [u8], value: u32) {
    write_u32(page, OFFS_NUM_PARAMS, value);
}

pub fn param_attr(page: &[u8], i: usize) -> u64 {
    read_u64(page, param_offset(i))
}

pub fn param_slot(page: &[u8], i: usize, slot: usize) -> u64 {
    read_u64(page, param_slot_offset(i, slot))
}

pub fn set_param_slot(page: &mut [u8], i: usize, slot: usize, value: u64) {
    write_u64(page, param_slot_offset(i, slot), value);
}

/// One page of mediator-owned memory used as a shadow argument. Page-aligned
/// so its physical address can be handed to the firmware directly.
#[repr(C, align(4096))]
pub struct MsgPage {
    bytes: [u8; NONCONTIG_PAGE_SIZE],
}

const_assert_eq!(core::mem::size_of::<MsgPage>(), NONCONTIG_PAGE_SIZE);

impl MsgPage {
    pub fn new_zeroed() -> Box<MsgPage> {
        Box::new(MsgPage {
            bytes: [0; NONCONTIG_PAGE_SIZE],
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// One record of a non-contiguous buffer description: physical page
/// addresses plus a physical link to the next record (0 terminates the
/// chain). The firmware reads these records directly out of mediator
/// memory.
#[repr(C, align(4096))]
pub struct PageData {
    pub pages: [u64; BUFFER_ENTRIES],
    pub next_page_data: u64,
}

const_assert_eq!(core::mem::size_of::<PageData>(), NONCONTIG_PAGE_SIZE);

impl PageData {
    pub fn new_zeroed() -> Box<PageData> {
        Box::new(PageData {
            pages: [0; BUFFER_ENTRIES],
            next_page_data: 0,
        })
    }
}

/// Entry `i` of a raw page-table record read out of guest memory.
pub fn page_data_entry(record: &[u8], i: usize) -> u64 {
    read_u64(record, i * 8)
}

/// The chain link of a raw page-table record.
pub fn page_data_next(record: &[u8]) -> u64 {
    read_u64(record, BUFFER_ENTRIES * 8)
}
