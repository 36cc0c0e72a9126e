//! Per-VM context and call registry
//!
//! One [`VmContext`] exists per guest. It owns the guest's memory gateway,
//! the mediator-assigned VM identity, and three collections of in-flight
//! state: standard calls (keyed by firmware thread id), shared-memory
//! buffers and RPC argument buffers (keyed by guest-chosen cookie). A single
//! mutex covers the collections and the two resource counters.
//!
//! Pinning can sleep on real hosts, so the registry pins after insertion
//! and unpins after removal, always outside the lock. A pin that fails, in
//! whole or in part, unwinds the insertion; an enlisted item always holds
//! every pin it accounts for.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use teegate_hal::{GuestMemory, GuestPhysAddr, SmcArgs};

use crate::log;
use crate::msg::{MsgPage, PageData};

/// Thread id of a standard call that has never been suspended into an RPC.
pub const INVALID_THREAD_ID: u32 = 0xFFFF_FFFF;

/// Registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The cookie already names a live object in this list.
    CookieInUse,
    /// Enlisting would push the VM past its pinned-page budget.
    PageCapExceeded,
    /// A page the item depends on could not be pinned.
    PinFailed,
}

/// One in-flight guest-to-TEE message.
pub struct StdCall {
    /// Guest-physical address of the argument page. Pinned for the lifetime
    /// of the call.
    pub guest_arg_gpa: GuestPhysAddr,
    /// Mediator-owned copy of the argument page; the firmware works on this
    /// copy, never on the guest original.
    pub shadow_arg: Box<MsgPage>,
    /// Assigned by the firmware on first suspension.
    pub thread_id: u32,
    /// RPC function requested by the last suspension.
    pub rpc_func: u32,
    /// Register image the call last entered the firmware with; re-entry and
    /// retries replay it.
    pub rpc_state: SmcArgs,
}

impl StdCall {
    pub fn new(guest_arg_gpa: GuestPhysAddr, shadow_arg: Box<MsgPage>) -> Self {
        StdCall {
            guest_arg_gpa,
            shadow_arg,
            thread_id: INVALID_THREAD_ID,
            rpc_func: 0,
            rpc_state: SmcArgs::default(),
        }
    }
}

/// One piece of guest memory converted into a TEE-consumable page list.
pub struct ShmBuf {
    pub cookie: u64,
    /// Guest-physical address of every constituent page, each pinned.
    pub guest_pages: Vec<GuestPhysAddr>,
    /// Page tally charged against the VM budget. Counts list slots, so it
    /// can exceed `guest_pages.len()` when the guest left slots empty.
    pub num_pages: u64,
    /// The shadow page-table chain the firmware reads. Dropped early for a
    /// successful buffer registration; the pins and the cookie stay live.
    pub shadow: Vec<Box<PageData>>,
}

/// A firmware-requested RPC argument buffer.
#[derive(Debug, Clone, Copy)]
pub struct ShmRpc {
    pub cookie: u64,
    /// Guest-physical address of the page holding the RPC message. Pinned.
    pub arg_gpa: GuestPhysAddr,
}

struct VmInner {
    calls: Vec<Arc<Mutex<StdCall>>>,
    shm_bufs: BTreeMap<u64, ShmBuf>,
    shm_rpcs: BTreeMap<u64, ShmRpc>,
    call_count: u32,
    shm_buf_page_count: u64,
}

/// Per-guest mediator state.
pub struct VmContext<G: GuestMemory> {
    guest: G,
    vmid: u64,
    inner: Mutex<VmInner>,
}

impl<G: GuestMemory> VmContext<G> {
    pub fn new(guest: G, vmid: u64) -> Self {
        VmContext {
            guest,
            vmid,
            inner: Mutex::new(VmInner {
                calls: Vec::new(),
                shm_bufs: BTreeMap::new(),
                shm_rpcs: BTreeMap::new(),
                call_count: 0,
                shm_buf_page_count: 0,
            }),
        }
    }

    pub fn guest(&self) -> &G {
        &self.guest
    }

    pub fn vmid(&self) -> u64 {
        self.vmid
    }

    /// Standard calls currently in flight.
    pub fn call_count(&self) -> u32 {
        self.inner.lock().call_count
    }

    /// Pages currently pinned on behalf of shared-memory buffers.
    pub fn shm_buf_page_count(&self) -> u64 {
        self.inner.lock().shm_buf_page_count
    }

    /// True when no call, buffer or RPC state remains.
    pub fn is_quiescent(&self) -> bool {
        let inner = self.inner.lock();
        inner.calls.is_empty() && inner.shm_bufs.is_empty() && inner.shm_rpcs.is_empty()
    }

    // ---------------------------------------------------------------------
    // Standard calls (keyed by thread id)
    // ---------------------------------------------------------------------

    /// Enlist a call and pin its argument page. A pin failure unwinds the
    /// insertion.
    pub fn enlist_std_call(&self, call: StdCall) -> Result<Arc<Mutex<StdCall>>, RegistryError> {
        let gpa = call.guest_arg_gpa;
        let entry = Arc::new(Mutex::new(call));

        let mut inner = self.inner.lock();
        inner.calls.push(entry.clone());
        inner.call_count += 1;
        drop(inner);

        if self.guest.pin(gpa).is_err() {
            log!("vm {}: argument page {:#x} not pinnable", self.vmid, gpa);
            let mut inner = self.inner.lock();
            let before = inner.calls.len();
            inner.calls.retain(|c| !Arc::ptr_eq(c, &entry));
            if inner.calls.len() != before {
                inner.call_count -= 1;
            }
            return Err(RegistryError::PinFailed);
        }
        Ok(entry)
    }

    pub fn delist_std_call(&self, call: &Arc<Mutex<StdCall>>) {
        let mut inner = self.inner.lock();
        let before = inner.calls.len();
        inner.calls.retain(|c| !Arc::ptr_eq(c, call));
        let removed = inner.calls.len() != before;
        if removed {
            inner.call_count -= 1;
        }
        drop(inner);

        if removed {
            let gpa = call.lock().guest_arg_gpa;
            self.guest.unpin(gpa);
        }
    }

    pub fn find_std_call(&self, thread_id: u32) -> Option<Arc<Mutex<StdCall>>> {
        if thread_id == INVALID_THREAD_ID {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .calls
            .iter()
            .find(|c| c.lock().thread_id == thread_id)
            .cloned()
    }

    // ---------------------------------------------------------------------
    // Shared-memory buffers (keyed by cookie)
    // ---------------------------------------------------------------------

    /// Enlist a buffer, charging its page tally against `page_cap`. The
    /// check and the insertion are one critical section, so the budget holds
    /// under concurrent enlists. If any page fails to pin, the pages pinned
    /// so far are released and the insertion unwinds.
    pub fn enlist_shm_buf(&self, buf: ShmBuf, page_cap: u64) -> Result<(), RegistryError> {
        let cookie = buf.cookie;
        let num_pages = buf.num_pages;
        let pages: Vec<GuestPhysAddr> = buf.guest_pages.clone();

        let mut inner = self.inner.lock();
        if inner.shm_bufs.contains_key(&cookie) {
            return Err(RegistryError::CookieInUse);
        }
        if inner.shm_buf_page_count + num_pages > page_cap {
            return Err(RegistryError::PageCapExceeded);
        }
        inner.shm_buf_page_count += num_pages;
        inner.shm_bufs.insert(cookie, buf);
        drop(inner);

        for (i, &gpa) in pages.iter().enumerate() {
            if self.guest.pin(gpa).is_err() {
                log!("vm {}: shm page {:#x} not pinnable", self.vmid, gpa);
                for &pinned in &pages[..i] {
                    self.guest.unpin(pinned);
                }
                let mut inner = self.inner.lock();
                if inner.shm_bufs.remove(&cookie).is_some() {
                    inner.shm_buf_page_count -= num_pages;
                }
                return Err(RegistryError::PinFailed);
            }
        }
        Ok(())
    }

    /// Release the buffer named by `cookie`: shadow chain freed, every
    /// recorded guest page unpinned, tally restored. No-op for unknown
    /// cookies.
    pub fn free_shm_buf(&self, cookie: u64) {
        let mut inner = self.inner.lock();
        let buf = match inner.shm_bufs.remove(&cookie) {
            Some(buf) => buf,
            None => return,
        };
        inner.shm_buf_page_count -= buf.num_pages;
        drop(inner);

        for &gpa in &buf.guest_pages {
            self.guest.unpin(gpa);
        }
        // shadow chain dropped with `buf`
    }

    /// Drop only the shadow page-table chain of a registered buffer. The
    /// registration, its cookie and its pins stay live until the buffer is
    /// unregistered.
    pub fn clear_shm_buf_shadow(&self, cookie: u64) {
        let mut inner = self.inner.lock();
        let shadow = inner
            .shm_bufs
            .get_mut(&cookie)
            .map(|buf| core::mem::take(&mut buf.shadow));
        drop(inner);
        drop(shadow);
    }

    pub fn shm_buf_cookies(&self) -> Vec<u64> {
        self.inner.lock().shm_bufs.keys().copied().collect()
    }

    // ---------------------------------------------------------------------
    // RPC argument buffers (keyed by cookie)
    // ---------------------------------------------------------------------

    /// Enlist an RPC argument buffer and pin its page. A pin failure
    /// unwinds the insertion.
    pub fn enlist_shm_rpc(&self, rpc: ShmRpc) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.shm_rpcs.contains_key(&rpc.cookie) {
            return Err(RegistryError::CookieInUse);
        }
        inner.shm_rpcs.insert(rpc.cookie, rpc);
        drop(inner);

        if self.guest.pin(rpc.arg_gpa).is_err() {
            log!("vm {}: rpc page {:#x} not pinnable", self.vmid, rpc.arg_gpa);
            self.inner.lock().shm_rpcs.remove(&rpc.cookie);
            return Err(RegistryError::PinFailed);
        }
        Ok(())
    }

    pub fn find_shm_rpc(&self, cookie: u64) -> Option<ShmRpc> {
        self.inner.lock().shm_rpcs.get(&cookie).copied()
    }

    pub fn free_shm_rpc(&self, cookie: u64) {
        let mut inner = self.inner.lock();
        let rpc = match inner.shm_rpcs.remove(&cookie) {
            Some(rpc) => rpc,
            None => return,
        };
        drop(inner);

        self.guest.unpin(rpc.arg_gpa);
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Forcibly end everything this VM has in flight and release every pin.
    /// Runs after the firmware has been told the VM is gone, so no resume
    /// races with it.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        let calls = core::mem::take(&mut inner.calls);
        let bufs = core::mem::take(&mut inner.shm_bufs);
        let rpcs = core::mem::take(&mut inner.shm_rpcs);
        inner.call_count = 0;
        inner.shm_buf_page_count = 0;
        drop(inner);

        for call in &calls {
            let gpa = call.lock().guest_arg_gpa;
            self.guest.unpin(gpa);
        }
        for buf in bufs.values() {
            for &gpa in &buf.guest_pages {
                self.guest.unpin(gpa);
            }
        }
        for rpc in rpcs.values() {
            self.guest.unpin(rpc.arg_gpa);
        }
    }
}
