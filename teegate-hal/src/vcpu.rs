//! Trapped vCPU register file
//!
//! The host's trap handler hands the mediator a view of the registers the
//! guest used for its secure-monitor call. The mediator reads all eight
//! argument slots and writes back exactly a0..a3; it never touches the
//! guest program counter.

use crate::smccc::{SmcArgs, SmcResult};

pub trait VcpuRegisters {
    /// The guest's a0..a7 at the trap.
    fn args(&self) -> SmcArgs;

    /// Deliver a0..a3 back into the guest register file.
    fn set_result(&mut self, res: &SmcResult);
}
