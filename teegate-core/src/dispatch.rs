//! Call dispatcher
//!
//! Classifies every trapped secure-monitor call by function number and
//! sequences the matching handler: fast-call passthrough with identity
//! rewrite, capability-exchange masking, standard-call entry, or RPC
//! resume. The dispatcher writes back exactly a0..a3 into the guest
//! register file and never surfaces an error to its caller; a guest always
//! resumes.

use teegate_hal::smccc::reg_pair;
use teegate_hal::{GuestId, SmcArgs, SmcResult, TeePlatform, VcpuRegisters};

use crate::call::result;
use crate::mediator::Mediator;
use crate::smc::{self, NsecCaps, SecCaps};

impl<P: TeePlatform> Mediator<P> {
    /// Handle one trapped call from `guest`.
    pub fn forward_request(&self, guest: GuestId, vcpu: &mut dyn VcpuRegisters) {
        let entry = vcpu.args();
        let mut regs = entry;

        let res = match smc::func_num(regs.a0) {
            smc::FUNCID_CALLS_COUNT
            | smc::FUNCID_CALLS_UID
            | smc::FUNCID_CALLS_REVISION
            | smc::FUNCID_GET_OS_UUID
            | smc::FUNCID_GET_OS_REVISION
            | smc::FUNCID_GET_THREAD_COUNT
            | smc::FUNCID_ENABLE_ASYNC_NOTIF
            | smc::FUNCID_ENABLE_SHM_CACHE
            | smc::FUNCID_GET_ASYNC_NOTIF_VALUE
            | smc::FUNCID_DISABLE_SHM_CACHE => self.handle_fast_call(guest, &mut regs),

            smc::FUNCID_EXCHANGE_CAPABILITIES => self.handle_exchange_caps(guest, &mut regs),

            smc::FUNCID_CALL_WITH_ARG => match self.find_vm(guest) {
                Some(vm) => self.handle_std_call(&vm, &mut regs),
                None => result(smc::RETURN_ENOTAVAIL),
            },

            smc::FUNCID_RETURN_FROM_RPC => match self.find_vm(guest) {
                Some(vm) => self
                    .handle_rpc_resume(&vm, &mut regs)
                    .unwrap_or(SmcResult {
                        a0: entry.a0,
                        a1: entry.a1,
                        a2: entry.a2,
                        a3: entry.a3,
                    }),
                None => result(smc::RETURN_ENOTAVAIL),
            },

            _ => SmcResult {
                a0: smc::RETURN_UNKNOWN_FUNCTION,
                a1: entry.a1,
                a2: entry.a2,
                a3: entry.a3,
            },
        };

        vcpu.set_result(&res);
    }

    /// Forward a recognized fast call under the VM's identity and latch the
    /// side effects the mediator cares about.
    fn handle_fast_call(&self, guest: GuestId, regs: &mut SmcArgs) -> SmcResult {
        let vm = match self.find_vm(guest) {
            Some(vm) => vm,
            None => return result(smc::RETURN_ENOTAVAIL),
        };

        regs.a7 = vm.vmid() as u32;
        let res = self.platform().smc(regs);

        match smc::func_num(regs.a0) {
            smc::FUNCID_GET_THREAD_COUNT => {
                let limit = if res.a0 != smc::RETURN_UNKNOWN_FUNCTION {
                    res.a1
                } else {
                    0
                };
                self.latch_thread_limit(limit);
            }
            smc::FUNCID_DISABLE_SHM_CACHE => {
                if res.a0 == smc::RETURN_OK {
                    vm.free_shm_buf(reg_pair(res.a1, res.a2));
                }
            }
            _ => {}
        }

        res
    }

    /// Mask the capability exchange in both directions. Dynamic shared
    /// memory is the only transport the mediator can virtualize, so its
    /// absence downgrades the whole exchange; the reserved-SHM region is
    /// the firmware's and is always hidden from guests.
    fn handle_exchange_caps(&self, guest: GuestId, regs: &mut SmcArgs) -> SmcResult {
        let vm = match self.find_vm(guest) {
            Some(vm) => vm,
            None => return result(smc::RETURN_ENOTAVAIL),
        };

        regs.a1 &= NsecCaps::all().bits();
        regs.a7 = vm.vmid() as u32;

        let mut res = self.platform().smc(regs);
        if res.a0 != smc::RETURN_OK {
            return res;
        }

        res.a1 &= SecCaps::all().bits();
        res.a1 &= !SecCaps::HAVE_RESERVED_SHM.bits();

        if res.a1 & SecCaps::DYNAMIC_SHM.bits() == 0 {
            res.a0 = smc::RETURN_ENOTAVAIL;
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::MediatorConfig;
    use crate::testutil::{FakePlatform, FakeVcpu};
    use crate::vm::ShmBuf;
    use alloc::vec::Vec;
    use teegate_hal::smccc::reg_pair_split;

    fn harness(platform: FakePlatform) -> Mediator<FakePlatform> {
        platform.add_guest(1);
        let med = Mediator::new(platform, MediatorConfig::default()).unwrap();
        med.create_vm(1).unwrap();
        med
    }

    fn run(med: &Mediator<FakePlatform>, args: SmcArgs) -> SmcResult {
        let mut vcpu = FakeVcpu::new(args);
        med.forward_request(1, &mut vcpu);
        vcpu.result.expect("dispatcher always answers")
    }

    #[test]
    fn unknown_function_is_refused_in_place() {
        let med = harness(FakePlatform::new());
        let before = med.platform().smc_log().len();
        let res = run(
            &med,
            SmcArgs {
                a0: smc::fast_call(0x123),
                a1: 7,
                a2: 8,
                a3: 9,
                ..SmcArgs::default()
            },
        );
        assert_eq!(res.a0, smc::RETURN_UNKNOWN_FUNCTION);
        assert_eq!((res.a1, res.a2, res.a3), (7, 8, 9));
        // the firmware never saw the call
        assert_eq!(med.platform().smc_log().len(), before);
    }

    #[test]
    fn calls_from_unregistered_guests_are_unavailable() {
        let med = harness(FakePlatform::new());
        let mut vcpu = FakeVcpu::new(SmcArgs {
            a0: smc::fast_call(smc::FUNCID_GET_THREAD_COUNT),
            ..SmcArgs::default()
        });
        med.forward_request(99, &mut vcpu);
        assert_eq!(vcpu.result.unwrap().a0, smc::RETURN_ENOTAVAIL);
    }

    #[test]
    fn fast_calls_are_tagged_with_the_vm_identity() {
        let platform = FakePlatform::with_firmware(|args| {
            if smc::func_num(args.a0) == smc::FUNCID_GET_OS_REVISION {
                assert_eq!(args.a7, 2);
            }
            SmcResult {
                a0: smc::RETURN_OK,
                ..SmcResult::default()
            }
        });
        let med = harness(platform);
        let res = run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_GET_OS_REVISION),
                ..SmcArgs::default()
            },
        );
        assert_eq!(res.a0, smc::RETURN_OK);
    }

    #[test]
    fn thread_count_reply_is_latched_and_forwarded() {
        let platform = FakePlatform::with_firmware(|args| {
            let mut res = SmcResult {
                a0: smc::RETURN_OK,
                ..SmcResult::default()
            };
            if smc::func_num(args.a0) == smc::FUNCID_GET_THREAD_COUNT {
                res.a1 = 0x20;
            }
            res
        });
        let med = harness(platform);
        let res = run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_GET_THREAD_COUNT),
                ..SmcArgs::default()
            },
        );
        assert_eq!((res.a0, res.a1, res.a2, res.a3), (smc::RETURN_OK, 0x20, 0, 0));
        assert_eq!(med.thread_limit(), 32);
    }

    #[test]
    fn unanswered_thread_count_resets_the_limit() {
        let med = harness(FakePlatform::new());
        med.latch_thread_limit(8);
        med.platform().set_firmware(|_| SmcResult {
            a0: smc::RETURN_UNKNOWN_FUNCTION,
            ..SmcResult::default()
        });
        run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_GET_THREAD_COUNT),
                ..SmcArgs::default()
            },
        );
        assert_eq!(med.thread_limit(), 0);
    }

    #[test]
    fn capability_exchange_masks_both_directions() {
        let platform = FakePlatform::with_firmware(|args| {
            if smc::func_num(args.a0) == smc::FUNCID_EXCHANGE_CAPABILITIES {
                // the mediator must have masked the guest's wild claim
                assert_eq!(args.a1, NsecCaps::UNIPROCESSOR.bits());
                assert_eq!(args.a7, 2);
                return SmcResult {
                    a0: smc::RETURN_OK,
                    a1: 0x0F,
                    ..SmcResult::default()
                };
            }
            SmcResult {
                a0: smc::RETURN_OK,
                ..SmcResult::default()
            }
        });
        let med = harness(platform);
        let res = run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_EXCHANGE_CAPABILITIES),
                a1: 0xFFFF_FFFF,
                ..SmcArgs::default()
            },
        );
        assert_eq!(res.a0, smc::RETURN_OK);
        // reserved SHM stripped, everything else intact
        assert_eq!(res.a1, 0x0E);
    }

    #[test]
    fn capability_exchange_requires_dynamic_shm() {
        let platform = FakePlatform::with_firmware(|args| {
            let a1 = if smc::func_num(args.a0) == smc::FUNCID_EXCHANGE_CAPABILITIES {
                (SecCaps::HAVE_RESERVED_SHM | SecCaps::UNREGISTERED_SHM).bits()
            } else {
                0
            };
            SmcResult {
                a0: smc::RETURN_OK,
                a1,
                ..SmcResult::default()
            }
        });
        let med = harness(platform);
        let res = run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_EXCHANGE_CAPABILITIES),
                ..SmcArgs::default()
            },
        );
        assert_eq!(res.a0, smc::RETURN_ENOTAVAIL);
    }

    #[test]
    fn disable_shm_cache_frees_the_returned_buffer() {
        let platform = FakePlatform::with_firmware(|args| {
            let mut res = SmcResult {
                a0: smc::RETURN_OK,
                ..SmcResult::default()
            };
            if smc::func_num(args.a0) == smc::FUNCID_DISABLE_SHM_CACHE {
                let (hi, lo) = reg_pair_split(0xCAFE);
                res.a1 = hi;
                res.a2 = lo;
            }
            res
        });
        let med = harness(platform);
        let vm = med.find_vm(1).unwrap();
        vm.guest().add_page(0x7000);
        vm.enlist_shm_buf(
            ShmBuf {
                cookie: 0xCAFE,
                guest_pages: alloc::vec![0x7000],
                num_pages: 1,
                shadow: Vec::new(),
            },
            512,
        )
        .unwrap();

        run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_DISABLE_SHM_CACHE),
                ..SmcArgs::default()
            },
        );
        assert_eq!(vm.shm_buf_page_count(), 0);
        assert_eq!(vm.guest().pin_count(0x7000), 0);
    }

    #[test]
    fn resume_for_unknown_thread_is_refused() {
        let med = harness(FakePlatform::new());
        let res = run(
            &med,
            SmcArgs {
                a0: smc::fast_call(smc::FUNCID_RETURN_FROM_RPC),
                a3: 42,
                ..SmcArgs::default()
            },
        );
        assert_eq!(res.a0, smc::RETURN_ERESUME);
    }
}
