//! The console device: a 128-byte line-buffered input ring fed by UART
//! receive interrupts, and raw byte output through the same UART.
//! Grounded on xv6/rv6's `console.c`.
//!
//! Three indices walk the ring, the same three xv6 uses: `read_pos` is
//! the next byte `read()` will consume; `committed_pos` is the end of
//! the region a reader is allowed to see (advanced a whole line at a
//! time, on `'\n'`/^D/a full buffer); `edit_pos` is the end of the raw,
//! not-yet-committed typed region that backspace and ^U roll back.

use crate::file::CharDevice;
use crate::hal::Uart;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::CONSOLE_BUF_SIZE;

const BACKSPACE: u8 = 0x7f;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const CTRL_U: u8 = 0x15;

struct ConsoleBuf {
    data: [u8; CONSOLE_BUF_SIZE],
    read_pos: usize,
    committed_pos: usize,
    edit_pos: usize,
}

pub struct Console {
    uart: &'static dyn Uart,
    inner: Sleepablelock<ConsoleBuf>,
    /// Serializes `write()` output from concurrent processes; separate
    /// from `crate::printer::PRINTER`'s lock, which guards the kernel's
    /// own `println!` traffic on the same wire.
    out_lock: Spinlock<()>,
}

impl Console {
    pub const fn new(uart: &'static dyn Uart) -> Self {
        Self {
            uart,
            inner: Sleepablelock::new(
                "console",
                ConsoleBuf {
                    data: [0; CONSOLE_BUF_SIZE],
                    read_pos: 0,
                    committed_pos: 0,
                    edit_pos: 0,
                },
            ),
            out_lock: Spinlock::new("console.out", ()),
        }
    }

    fn putc_raw(&self, c: u8) {
        self.uart.putc(c);
    }

    /// Drains one pending byte from the UART, if any. Called from the
    /// external-interrupt path, which loops this until the FIFO is empty.
    pub fn poll_uart(&self) -> Option<u8> {
        self.uart.getc()
    }

    /// Called from the UART receive-interrupt path with one newly
    /// arrived byte.
    pub fn intr(&self, c: u8) {
        match c {
            CTRL_C => {
                crate::proc::kill(crate::proc::current_pid_or(0));
            }
            CTRL_U => {
                let mut buf = self.inner.lock();
                while buf.edit_pos != buf.committed_pos
                    && buf.data[(buf.edit_pos - 1) % CONSOLE_BUF_SIZE] != b'\n'
                {
                    buf.edit_pos -= 1;
                    self.putc_raw(BACKSPACE);
                    self.putc_raw(b' ');
                    self.putc_raw(BACKSPACE);
                }
            }
            BACKSPACE => {
                let mut buf = self.inner.lock();
                if buf.edit_pos != buf.committed_pos {
                    buf.edit_pos -= 1;
                    self.putc_raw(BACKSPACE);
                    self.putc_raw(b' ');
                    self.putc_raw(BACKSPACE);
                }
            }
            _ => {
                let mut buf = self.inner.lock();
                if buf.edit_pos - buf.read_pos >= CONSOLE_BUF_SIZE {
                    return;
                }
                let c = if c == b'\r' { b'\n' } else { c };
                self.putc_raw(c);
                let idx = buf.edit_pos % CONSOLE_BUF_SIZE;
                buf.data[idx] = c;
                buf.edit_pos += 1;
                if c == b'\n' || c == CTRL_D || buf.edit_pos - buf.read_pos == CONSOLE_BUF_SIZE {
                    buf.committed_pos = buf.edit_pos;
                    buf.wakeup();
                }
            }
        }
    }
}

impl CharDevice for Console {
    /// Delivers bytes up to and including a newline, or up to (but not
    /// including) a ^D, blocking while no committed line is available.
    /// Reads the consumed byte before advancing `read_pos`, not after:
    /// an off-by-one in the source this was grounded on advanced the
    /// index first and read from the new position, silently skipping
    /// the byte at the old one.
    fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut buf = self.inner.lock();
        let mut n = 0;
        while n < dst.len() {
            while buf.read_pos == buf.committed_pos {
                if crate::proc::current_killed() {
                    return Err(());
                }
                buf.sleep();
            }
            let c = buf.data[buf.read_pos % CONSOLE_BUF_SIZE];
            buf.read_pos += 1;
            if c == CTRL_D {
                if n == 0 {
                    // Put it back so the next read also sees EOF right away.
                    buf.read_pos -= 1;
                }
                break;
            }
            dst[n] = c;
            n += 1;
            if c == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let _guard = self.out_lock.lock();
        for &c in src {
            self.putc_raw(c);
        }
        Ok(src.len())
    }
}
