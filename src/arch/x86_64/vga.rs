//! Minimal VGA text-mode console.
//!
//! The full console/printf infrastructure (multi-tty, scrollback, hotkeys)
//! is out of scope for this crate; this is only a last-resort sink used
//! before the serial port is confirmed live and on the panic path, where
//! taking a lock that might already be held is not acceptable.

use core::sync::atomic::{AtomicUsize, Ordering};

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_ADDRESS: usize = 0xb8000;
const ATTR_WHITE_ON_BLACK: u8 = 0x0f;

static CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Writes `s` to the VGA text buffer starting at the current cursor,
/// wrapping at the end of the 80x25 grid. No locking: callers on the
/// panic path may be the only CPU alive, and the buffer tears gracefully.
pub fn print(s: &str) {
    let buf = VGA_ADDRESS as *mut u8;
    let mut pos = CURSOR.load(Ordering::Relaxed);
    let capacity = BUFFER_WIDTH * BUFFER_HEIGHT;
    for byte in s.bytes() {
        if byte == b'\n' {
            pos = (pos / BUFFER_WIDTH + 1) * BUFFER_WIDTH;
        } else {
            if pos >= capacity {
                pos = 0;
            }
            unsafe {
                *buf.add(pos * 2) = byte;
                *buf.add(pos * 2 + 1) = ATTR_WHITE_ON_BLACK;
            }
            pos += 1;
        }
        if pos >= capacity {
            pos = 0;
        }
    }
    CURSOR.store(pos, Ordering::Relaxed);
}

pub fn clear() {
    let buf = VGA_ADDRESS as *mut u8;
    for i in 0..(BUFFER_WIDTH * BUFFER_HEIGHT) {
        unsafe {
            *buf.add(i * 2) = b' ';
            *buf.add(i * 2 + 1) = ATTR_WHITE_ON_BLACK;
        }
    }
    CURSOR.store(0, Ordering::Relaxed);
}
