//! Standard-call state machine and RPC sub-machine
//!
//! A standard call shadows the guest's argument page, resolves its buffer
//! parameters into firmware-readable form, and replays the call into the
//! secure world under the VM's identity. The firmware may suspend the call
//! with an RPC request; the call then parks in the registry under its
//! firmware-assigned thread id until the guest drives the RPC to completion
//! and resumes it. On a terminal return, selected output fields are
//! mirrored back into the guest-visible argument and the call's resources
//! are released according to the command that ran.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use teegate_hal::smccc::{reg_pair, reg_pair_split};
use teegate_hal::{GuestMemory, GuestPhysAddr, SmcArgs, SmcResult, TeePlatform};

use crate::log;
use crate::mediator::Mediator;
use crate::msg::{self, MsgPage, NONCONTIG_PAGE_SIZE};
use crate::shm::ShmError;
use crate::smc;
use crate::vm::{ShmRpc, StdCall, VmContext, INVALID_THREAD_ID};

/// Result slots with only a0 populated.
pub(crate) fn result(a0: u32) -> SmcResult {
    SmcResult {
        a0,
        a1: 0,
        a2: 0,
        a3: 0,
    }
}

/// What the RPC-return handler decided while the guest was out of the
/// picture.
pub(crate) enum RpcOutcome {
    /// The suspension is recorded; deliver it to the guest.
    Handled,
    /// A cookie the firmware named is not enlisted yet; re-enter the
    /// firmware with the same registers instead of involving the guest.
    Retry,
}

fn guest_u32<G: GuestMemory>(guest: &G, gpa: GuestPhysAddr) -> Option<u32> {
    let mut bytes = [0u8; 4];
    guest.read(gpa, &mut bytes).ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn guest_u64<G: GuestMemory>(guest: &G, gpa: GuestPhysAddr) -> Option<u64> {
    let mut bytes = [0u8; 8];
    guest.read(gpa, &mut bytes).ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl<P: TeePlatform> Mediator<P> {
    /// Entry point for a guest `CALL_WITH_ARG`. Returns what lands in the
    /// guest's a0..a3.
    pub(crate) fn handle_std_call(
        &self,
        vm: &VmContext<P::Guest>,
        regs: &mut SmcArgs,
    ) -> SmcResult {
        let guest_arg_gpa = reg_pair(regs.a1, regs.a2);
        if vm.guest().gpa_to_hva(guest_arg_gpa).is_none() {
            return result(smc::RETURN_EBADADDR);
        }

        if vm.call_count() >= self.thread_limit() {
            return result(smc::RETURN_ETHREAD_LIMIT);
        }

        // Shadow the argument page so the guest cannot change it underneath
        // the firmware.
        let mut shadow = MsgPage::new_zeroed();
        if vm
            .guest()
            .read(guest_arg_gpa, shadow.as_mut_slice())
            .is_err()
        {
            return result(smc::RETURN_EBADADDR);
        }
        let call = match vm.enlist_std_call(StdCall::new(guest_arg_gpa, shadow)) {
            Ok(call) => call,
            // the argument page must stay pinned for the call's lifetime
            Err(_) => return result(smc::RETURN_EBADADDR),
        };

        let num_params = msg::num_params(call.lock().shadow_arg.as_slice());
        if msg::arg_size(num_params) > NONCONTIG_PAGE_SIZE {
            {
                let mut locked = call.lock();
                let page = locked.shadow_arg.as_mut_slice();
                msg::set_ret(page, msg::TEEC_ERROR_BAD_PARAMETERS);
                msg::set_ret_origin(page, msg::TEEC_ORIGIN_COMMS);
                msg::set_num_params(page, 0);
            }
            self.sync_shadow_to_guest(vm, &call);
            vm.delist_std_call(&call);
            return result(smc::RETURN_OK);
        }

        let cmd = msg::cmd(call.lock().shadow_arg.as_slice());
        match cmd {
            msg::CMD_OPEN_SESSION
            | msg::CMD_CLOSE_SESSION
            | msg::CMD_INVOKE_COMMAND
            | msg::CMD_CANCEL
            | msg::CMD_REGISTER_SHM
            | msg::CMD_UNREGISTER_SHM => {
                if self.resolve_params(vm, &call).is_err() {
                    // the protocol error is already in the shadow header
                    self.sync_shadow_to_guest(vm, &call);
                    vm.delist_std_call(&call);
                    return result(smc::RETURN_OK);
                }
            }
            _ => {
                vm.delist_std_call(&call);
                return result(smc::RETURN_EBADCMD);
            }
        }

        let shadow_phys = {
            let locked = call.lock();
            self.platform()
                .virt_to_phys(locked.shadow_arg.as_slice().as_ptr() as u64)
        };
        let (hi, lo) = reg_pair_split(shadow_phys);
        regs.a1 = hi;
        regs.a2 = lo;
        regs.a3 = smc::SHM_CACHED;

        let res = self.do_call_with_arg(vm, &call, regs);
        self.sync_shadow_to_guest(vm, &call);

        if smc::is_rpc(res.a0) {
            // suspended; the call stays enlisted under its thread id
            return res;
        }
        vm.delist_std_call(&call);
        res
    }

    /// Entry point for a guest `RETURN_FROM_RPC`. `None` means the resume
    /// could not be serviced and the guest's registers stay untouched.
    pub(crate) fn handle_rpc_resume(
        &self,
        vm: &VmContext<P::Guest>,
        regs: &mut SmcArgs,
    ) -> Option<SmcResult> {
        let call = match vm.find_std_call(regs.a3) {
            Some(call) => call,
            None => return Some(result(smc::RETURN_ERESUME)),
        };

        let (suspended_thread, rpc_func) = {
            let mut locked = call.lock();
            let thread = locked.thread_id;
            locked.thread_id = INVALID_THREAD_ID;
            (thread, locked.rpc_func)
        };

        match rpc_func {
            smc::RPC_FUNC_ALLOC => self.handle_rpc_alloc(vm, regs),
            smc::RPC_FUNC_CMD => {
                if !self.handle_rpc_cmd(vm, regs) {
                    // nothing to hand the firmware; park the call again so
                    // the guest can retry the resume
                    call.lock().thread_id = suspended_thread;
                    return None;
                }
            }
            // FOREIGN_INTR and anything else just re-enters the firmware
            _ => {}
        }

        let res = self.do_call_with_arg(vm, &call, regs);
        self.sync_shadow_to_guest(vm, &call);

        if smc::is_rpc(res.a0) || res.a0 == smc::RETURN_ERESUME {
            return Some(res);
        }
        vm.delist_std_call(&call);
        Some(res)
    }

    /// Tag the registers with the VM identity, enter the firmware, and run
    /// the lost-cookie retry loop. Terminal returns release the call's
    /// buffers according to the command that ran.
    fn do_call_with_arg(
        &self,
        vm: &VmContext<P::Guest>,
        call: &Arc<Mutex<StdCall>>,
        regs: &mut SmcArgs,
    ) -> SmcResult {
        regs.a7 = vm.vmid() as u32;
        call.lock().rpc_state = *regs;

        let mut res = self.platform().smc(regs);
        if smc::is_rpc(res.a0) {
            let mut restarts = 0u32;
            while let RpcOutcome::Retry = self.handle_rpc_return(vm, call, &res) {
                restarts += 1;
                if restarts > self.config().rpc_restart_limit {
                    log!("vm {}: rpc cookie never appeared, giving up", vm.vmid());
                    break;
                }
                let replay = call.lock().rpc_state;
                res = self.platform().smc(&replay);
                if !smc::is_rpc(res.a0) {
                    break;
                }
            }
        }

        if !smc::is_rpc(res.a0) {
            self.release_call_resources(vm, call);
        }
        res
    }

    /// Record a suspension and perform the work the firmware asked for
    /// before the guest sees the RPC.
    fn handle_rpc_return(
        &self,
        vm: &VmContext<P::Guest>,
        call: &Arc<Mutex<StdCall>>,
        res: &SmcResult,
    ) -> RpcOutcome {
        let func = smc::rpc_func(res.a0);
        {
            let mut locked = call.lock();
            locked.rpc_func = func;
            locked.thread_id = res.a3;
        }

        match func {
            smc::RPC_FUNC_FREE => {
                vm.free_shm_rpc(reg_pair(res.a1, res.a2));
                RpcOutcome::Handled
            }
            smc::RPC_FUNC_CMD => {
                let cookie = reg_pair(res.a1, res.a2);
                let rpc = match vm.find_shm_rpc(cookie) {
                    Some(rpc) => rpc,
                    None => return RpcOutcome::Retry,
                };
                let cmd = guest_u32(vm.guest(), rpc.arg_gpa + msg::OFFS_CMD as u64);
                if cmd == Some(msg::RPC_CMD_SHM_FREE) {
                    if let Some(cookie) =
                        guest_u64(vm.guest(), rpc.arg_gpa + msg::param_slot_offset(0, 1) as u64)
                    {
                        vm.free_shm_buf(cookie);
                    }
                }
                RpcOutcome::Handled
            }
            _ => RpcOutcome::Handled,
        }
    }

    /// Guest answered an allocation request: adopt the page it donated
    /// under the cookie it chose, and rewrite the register pair to the
    /// page's physical address. Refusals answer with a zero pair.
    fn handle_rpc_alloc(&self, vm: &VmContext<P::Guest>, regs: &mut SmcArgs) {
        let arg_gpa = reg_pair(regs.a1, regs.a2);
        let cookie = reg_pair(regs.a4, regs.a5);

        let refused = vm.find_shm_rpc(cookie).is_some()
            || vm.guest().gpa_to_hva(arg_gpa).is_none()
            || vm.enlist_shm_rpc(ShmRpc { cookie, arg_gpa }).is_err();
        if refused {
            regs.a1 = 0;
            regs.a2 = 0;
            return;
        }

        let phys = vm.guest().gpa_to_phys(arg_gpa).unwrap_or(0);
        let (hi, lo) = reg_pair_split(phys);
        regs.a1 = hi;
        regs.a2 = lo;
    }

    /// Dispatch a firmware command carried in an RPC argument buffer.
    /// Returns false when the buffer is unknown or unreadable, in which
    /// case the firmware is not re-entered.
    fn handle_rpc_cmd(&self, vm: &VmContext<P::Guest>, regs: &mut SmcArgs) -> bool {
        let cookie = reg_pair(regs.a1, regs.a2);
        let rpc = match vm.find_shm_rpc(cookie) {
            Some(rpc) => rpc,
            None => return false,
        };
        let guest = vm.guest();

        let num_params = match guest_u32(guest, rpc.arg_gpa + msg::OFFS_NUM_PARAMS as u64) {
            Some(n) => n,
            None => return false,
        };
        if msg::arg_size(num_params) > NONCONTIG_PAGE_SIZE {
            let _ = guest.write(
                rpc.arg_gpa + msg::OFFS_RET as u64,
                &msg::TEEC_ERROR_BAD_PARAMETERS.to_le_bytes(),
            );
            return true;
        }

        match guest_u32(guest, rpc.arg_gpa + msg::OFFS_CMD as u64) {
            Some(msg::RPC_CMD_SHM_ALLOC) => {
                let buf_ptr = guest_u64(guest, rpc.arg_gpa + msg::param_slot_offset(0, 0) as u64);
                let size = guest_u64(guest, rpc.arg_gpa + msg::param_slot_offset(0, 1) as u64);
                let buf_cookie =
                    guest_u64(guest, rpc.arg_gpa + msg::param_slot_offset(0, 2) as u64);
                let (buf_ptr, size, buf_cookie) = match (buf_ptr, size, buf_cookie) {
                    (Some(p), Some(s), Some(c)) => (p, s, c),
                    _ => return false,
                };
                match self.resolve_noncontig(vm, buf_ptr, size, buf_cookie) {
                    Ok(new_ptr) => {
                        let _ = guest.write(
                            rpc.arg_gpa + msg::param_slot_offset(0, 0) as u64,
                            &new_ptr.to_le_bytes(),
                        );
                        true
                    }
                    Err(_) => false,
                }
            }
            Some(msg::RPC_CMD_SHM_FREE) => {
                if let Some(cookie) =
                    guest_u64(guest, rpc.arg_gpa + msg::param_slot_offset(0, 1) as u64)
                {
                    vm.free_shm_buf(cookie);
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Resolve every buffer parameter of the shadowed argument. On a
    /// protocol error the shadow header carries the error code and origin.
    fn resolve_params(
        &self,
        vm: &VmContext<P::Guest>,
        call: &Arc<Mutex<StdCall>>,
    ) -> Result<(), ()> {
        let num_params =
            (msg::num_params(call.lock().shadow_arg.as_slice()) as usize).min(msg::MAX_PARAMS);

        for i in 0..num_params {
            let (attr, buf_ptr, size, cookie) = {
                let locked = call.lock();
                let page = locked.shadow_arg.as_slice();
                (
                    msg::param_attr(page, i),
                    msg::param_slot(page, i, 0),
                    msg::param_slot(page, i, 1),
                    msg::param_slot(page, i, 2),
                )
            };
            if !msg::attr_is_tmem(attr) {
                continue;
            }

            if attr & msg::ATTR_NONCONTIG != 0 {
                match self.resolve_noncontig(vm, buf_ptr, size, cookie) {
                    Ok(new_ptr) => {
                        let mut locked = call.lock();
                        msg::set_param_slot(locked.shadow_arg.as_mut_slice(), i, 0, new_ptr);
                    }
                    Err(err) => {
                        let code = match err {
                            ShmError::OutOfMemory => msg::TEEC_ERROR_OUT_OF_MEMORY,
                            ShmError::BadParameters => msg::TEEC_ERROR_BAD_PARAMETERS,
                        };
                        self.fail_shadow(call, code);
                        return Err(());
                    }
                }
            } else if buf_ptr != 0 {
                // plain physical pointers from a guest are never accepted
                self.fail_shadow(call, msg::TEEC_ERROR_BAD_PARAMETERS);
                return Err(());
            }
        }
        Ok(())
    }

    fn fail_shadow(&self, call: &Arc<Mutex<StdCall>>, code: u32) {
        let mut locked = call.lock();
        let page = locked.shadow_arg.as_mut_slice();
        msg::set_ret(page, code);
        msg::set_ret_origin(page, msg::TEEC_ORIGIN_COMMS);
    }

    /// Mirror the permitted output fields from the shadow into the
    /// guest-visible argument: the header result triple plus the output
    /// halves of each parameter. Nothing else is ever written back.
    pub(crate) fn sync_shadow_to_guest(
        &self,
        vm: &VmContext<P::Guest>,
        call: &Arc<Mutex<StdCall>>,
    ) {
        let (gpa, page): (GuestPhysAddr, Vec<u8>) = {
            let locked = call.lock();
            (locked.guest_arg_gpa, locked.shadow_arg.as_slice().to_vec())
        };
        let guest = vm.guest();
        let w32 = |offs: usize, value: u32| {
            let _ = guest.write(gpa + offs as u64, &value.to_le_bytes());
        };
        let w64 = |offs: usize, value: u64| {
            let _ = guest.write(gpa + offs as u64, &value.to_le_bytes());
        };

        w32(msg::OFFS_RET, msg::ret(&page));
        w32(msg::OFFS_RET_ORIGIN, msg::ret_origin(&page));
        w32(msg::OFFS_SESSION, msg::session(&page));

        let num_params = (msg::num_params(&page) as usize).min(msg::MAX_PARAMS);
        for i in 0..num_params {
            match msg::param_attr(&page, i) & msg::ATTR_TYPE_MASK {
                msg::ATTR_TYPE_TMEM_OUTPUT
                | msg::ATTR_TYPE_TMEM_INOUT
                | msg::ATTR_TYPE_RMEM_OUTPUT
                | msg::ATTR_TYPE_RMEM_INOUT => {
                    w64(msg::param_slot_offset(i, 1), msg::param_slot(&page, i, 1));
                }
                msg::ATTR_TYPE_VALUE_OUTPUT | msg::ATTR_TYPE_VALUE_INOUT => {
                    for slot in 0..3 {
                        w64(msg::param_slot_offset(i, slot), msg::param_slot(&page, i, slot));
                    }
                }
                _ => {}
            }
        }
    }

    /// A call came back from the firmware for good; release what the
    /// command owned.
    fn release_call_resources(&self, vm: &VmContext<P::Guest>, call: &Arc<Mutex<StdCall>>) {
        let page: Vec<u8> = call.lock().shadow_arg.as_slice().to_vec();
        let cmd = msg::cmd(&page);
        let call_ret = msg::ret(&page);

        match cmd {
            msg::CMD_REGISTER_SHM => {
                let cookie = msg::param_slot(&page, 0, 2);
                if call_ret == 0 {
                    // registration holds: keep the pins and the cookie, the
                    // firmware no longer needs the shadow chain
                    vm.clear_shm_buf_shadow(cookie);
                } else {
                    vm.free_shm_buf(cookie);
                }
            }
            msg::CMD_UNREGISTER_SHM => {
                if call_ret == 0 {
                    vm.free_shm_buf(msg::param_slot(&page, 0, 2));
                }
            }
            _ => {
                let num_params = (msg::num_params(&page) as usize).min(msg::MAX_PARAMS);
                for i in 0..num_params {
                    if msg::attr_is_tmem(msg::param_attr(&page, i)) {
                        vm.free_shm_buf(msg::param_slot(&page, i, 2));
                    }
                }
            }
        }
    }
}
