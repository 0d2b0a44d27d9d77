//! Trap dispatch: what happens once control reaches Rust after an
//! exception entry. Grounded on the teacher's `arch/arm/trap.rs`, trimmed
//! to the three outcomes this kernel's core actually needs to act on --
//! the vector table, trapframe save/restore, and `SVC`/abort decoding
//! itself are CPU bring-up glue outside this crate's scope.
//!
//! The syscall number and arguments arrive already decoded in a
//! [`TrapFrame`]; how they got there (which register the vector table
//! saved them to) is this module's only architecture-specific knowledge.

use crate::console::Console;
use crate::file::{DevSw, FTable};
use crate::fs::FileSystem;
use crate::hal::{BlockDevice, Plic};
use crate::pipe::PipePool;
use crate::proc::Proc;
use crate::syscall;

/// What kind of exception brought control into the kernel.
pub enum TrapTypes {
    Syscall,
    TimerInterrupt,
    ExternalInterrupt,
    PageFault { addr: usize },
    BadTrap,
}

/// The saved user-mode register file at the point of the trap. Layout is
/// architecture-specific outside this crate's scope; only the fields the
/// kernel core reads or writes are modeled here.
pub struct TrapFrame {
    /// Syscall number / return value, architecture's `x0`.
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    /// Syscall number, architecture's `x8`.
    pub syscall_no: usize,
    pub epc: usize,
    /// User stack pointer, set by `execve` on success.
    pub sp: usize,
}

/// Resources the trap handler needs to finish dispatching a syscall or
/// device interrupt. Borrowed from the not-yet-returned-to caller's
/// `Kernel` aggregate; nothing here outlives one trap.
pub struct TrapContext<'a> {
    pub fs: &'a FileSystem,
    pub dev: &'a dyn BlockDevice,
    pub ftable: &'a FTable,
    pub devsw: &'a DevSw,
    pub pipes: &'a PipePool,
    pub plic: &'a dyn Plic,
    pub console: &'a Console,
}

/// Entered from architecture glue with the trap already classified and
/// `p`'s `TrapFrame` filled in. Returns only for traps the caller should
/// resume from (syscall, timer, handled page fault); a `BadTrap` or an
/// unrecoverable page fault kills the process instead of returning.
pub fn handle_trap(kind: TrapTypes, p: &Proc, tf: &mut TrapFrame, ctx: &TrapContext<'_>) {
    match kind {
        TrapTypes::Syscall => {
            tf.epc += 4;
            let ret = syscall::dispatch(p, tf, ctx);
            tf.a0 = ret as usize;
        }
        TrapTypes::TimerInterrupt => {
            crate::proc::yield_(p);
        }
        TrapTypes::ExternalInterrupt => {
            if let Some(irq) = ctx.plic.claim() {
                handle_device_irq(ctx);
                ctx.plic.complete(irq);
            }
        }
        TrapTypes::PageFault { addr } => {
            // SAFETY: `p` is the process currently taking this trap; no
            // other hart touches its `memory` concurrently.
            let data = unsafe { p.data_mut() };
            let handled = match &mut data.memory {
                Some(mem) => mem
                    .handle_write_fault(crate::addr::VirtAddr::new(addr))
                    .is_ok(),
                None => false,
            };
            if !handled {
                p.kill();
            }
        }
        TrapTypes::BadTrap => {
            p.kill();
        }
    }
}

/// Routes a claimed external IRQ to the console's UART, the only
/// interrupt source this kernel wires up.
fn handle_device_irq(ctx: &TrapContext<'_>) {
    while let Some(c) = ctx.console.poll_uart() {
        ctx.console.intr(c);
    }
}
