//! Mediator logging subsystem
//!
//! Lock-free ring-buffer logging that works in a `no_std` environment. The
//! buffer overwrites old data when full and can be fetched by the host's
//! debugging tooling without mediator involvement.
//!
//! Logs are pushed via the `log!` macro which accepts standard `format!`
//! syntax. This module is self-contained and does not rely on `alloc`.

#![allow(dead_code)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 16 * 1024; // 16 KiB

static mut LOG_BUFFER: [u8; LOG_BUF_SIZE] = [0; LOG_BUF_SIZE];
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

/// Internal writer implementing `core::fmt::Write`.
pub struct RingBufferWriter;

impl Write for RingBufferWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    unsafe {
        (*core::ptr::addr_of_mut!(LOG_BUFFER))[pos] = b;
    }
}

/// Low-level logging macro.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\r\n");
    }};
}

/// Expose log buffer for external tools (read-only).
pub fn get_buffer() -> &'static [u8; LOG_BUF_SIZE] {
    unsafe { &*core::ptr::addr_of!(LOG_BUFFER) }
}
