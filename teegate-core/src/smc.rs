//! Secure-monitor function numbers and return codes
//!
//! The register-level ABI between normal world and the TEE firmware: fast
//! and yielding call function numbers, return codes, the RPC return
//! encoding, and the capability bits exchanged at negotiation time.

use bitflags::bitflags;

/// SMCCC fast-call bit.
const FAST_CALL: u32 = 0x8000_0000;
/// SMCCC owning-entity field for trusted-OS calls.
const OWNER_TRUSTED_OS: u32 = 50;

/// Mask selecting the SMCCC function-number field.
pub const FUNC_NUM_MASK: u32 = 0xFFFF;

/// Build a full trusted-OS fast-call identifier from a function number.
pub const fn fast_call(func: u32) -> u32 {
    FAST_CALL | (OWNER_TRUSTED_OS << 24) | func
}

/// Build a full trusted-OS yielding-call identifier from a function number.
pub const fn yielding_call(func: u32) -> u32 {
    (OWNER_TRUSTED_OS << 24) | func
}

/// Extract the function number from a full call identifier.
#[inline]
pub const fn func_num(a0: u32) -> u32 {
    a0 & FUNC_NUM_MASK
}

// Function numbers understood by the firmware.
pub const FUNCID_GET_OS_UUID: u32 = 0;
pub const FUNCID_GET_OS_REVISION: u32 = 1;
pub const FUNCID_RETURN_FROM_RPC: u32 = 3;
pub const FUNCID_CALL_WITH_ARG: u32 = 4;
pub const FUNCID_EXCHANGE_CAPABILITIES: u32 = 9;
pub const FUNCID_DISABLE_SHM_CACHE: u32 = 10;
pub const FUNCID_ENABLE_SHM_CACHE: u32 = 11;
pub const FUNCID_GET_THREAD_COUNT: u32 = 15;
pub const FUNCID_ENABLE_ASYNC_NOTIF: u32 = 16;
pub const FUNCID_GET_ASYNC_NOTIF_VALUE: u32 = 17;
pub const FUNCID_VM_CREATED: u32 = 19;
pub const FUNCID_VM_DESTROYED: u32 = 20;
pub const FUNCID_CALLS_COUNT: u32 = 0xFF00;
pub const FUNCID_CALLS_UID: u32 = 0xFF01;
pub const FUNCID_CALLS_REVISION: u32 = 0xFF03;

// Full identifiers for the calls the mediator originates itself.
pub const VM_CREATED: u32 = fast_call(FUNCID_VM_CREATED);
pub const VM_DESTROYED: u32 = fast_call(FUNCID_VM_DESTROYED);

// Return codes in a0.
pub const RETURN_OK: u32 = 0;
pub const RETURN_ETHREAD_LIMIT: u32 = 1;
pub const RETURN_EBUSY: u32 = 2;
pub const RETURN_ERESUME: u32 = 3;
pub const RETURN_EBADADDR: u32 = 4;
pub const RETURN_EBADCMD: u32 = 5;
pub const RETURN_ENOMEM: u32 = 6;
pub const RETURN_ENOTAVAIL: u32 = 7;
pub const RETURN_UNKNOWN_FUNCTION: u32 = 0xFFFF_FFFF;

// A yielding call that suspended into an RPC returns with the RPC prefix in
// the upper half of a0 and the requested function in the lower half.
pub const RPC_PREFIX: u32 = 0xFFFF_0000;
pub const RPC_PREFIX_MASK: u32 = 0xFFFF_0000;
pub const RPC_FUNC_MASK: u32 = 0x0000_FFFF;

pub const RPC_FUNC_ALLOC: u32 = 0;
pub const RPC_FUNC_FREE: u32 = 2;
pub const RPC_FUNC_FOREIGN_INTR: u32 = 4;
pub const RPC_FUNC_CMD: u32 = 5;

/// Does this a0 value announce an RPC suspension?
#[inline]
pub const fn is_rpc(a0: u32) -> bool {
    a0 != RETURN_UNKNOWN_FUNCTION && (a0 & RPC_PREFIX_MASK) == RPC_PREFIX
}

/// The RPC function requested by a suspension return.
#[inline]
pub const fn rpc_func(a0: u32) -> u32 {
    a0 & RPC_FUNC_MASK
}

/// Argument-shared-memory attribute passed in a3 of a yielding call.
pub const SHM_CACHED: u32 = 1;

bitflags! {
    /// Non-secure world capabilities offered during the exchange.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NsecCaps: u32 {
        const UNIPROCESSOR = 1 << 0;
    }
}

bitflags! {
    /// Secure world capabilities reported by the firmware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecCaps: u32 {
        const HAVE_RESERVED_SHM = 1 << 0;
        const UNREGISTERED_SHM = 1 << 1;
        const DYNAMIC_SHM = 1 << 2;
        const MEMREF_NULL = 1 << 3;
    }
}
