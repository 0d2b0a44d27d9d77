//! Per-process and per-CPU state.
//!
//! `Proc` bundles together everything `spec.md` §3 calls out for a
//! process; the scheduler's runqueue and pid allocator live in
//! `procs::Procs`, and the sleep/wakeup primitive lives in
//! `wait_channel::WaitChannel`. This module provides the data types and
//! the handful of free functions (`myproc`, `current_cpu`, `park`) that
//! every other subsystem calls into without needing to know the
//! scheduler's internals.

mod procs;
mod wait_channel;

pub use procs::{exit, fork, kill, scheduler, wait, yield_, Procs, ROOT_PID};
pub use wait_channel::WaitChannel;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::file::RcFile;
use crate::fs::RcInode;
use crate::lock::Spinlock;
use crate::param::{MAXPROCNAME, NCPU, NOFILE};
use crate::vm::UserMemory;

/// Saved callee-saved registers for a kernel-to-kernel context switch.
/// The actual save/restore sequence (`swtch`) is hand-written assembly
/// outside this crate's scope; this struct only needs to be the right
/// size and alignment for that assembly to agree with.
#[repr(C)]
#[derive(Default)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub callee_saved: [usize; 12],
}

extern "C" {
    /// Saves the caller's callee-saved registers into `old` and restores
    /// them from `new`. Implemented in architecture assembly, outside
    /// this crate's scope.
    fn swtch(old: *mut Context, new: *mut Context);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Runnable,
    Running,
    Sleeping,
    Deepsleeping,
    Zombie,
}

pub type Pid = i32;

/// Fields requiring the scheduler lock to read or mutate.
pub struct ProcInfo {
    pub state: Procstate,
    /// Address of the `WaitChannel` this process is parked on, or 0.
    pub waitchannel: usize,
    /// Set once, non-alertably, while parked: distinguishes `Sleeping`
    /// (alertable) from `Deepsleeping` (not) without a second enum.
    pub exitcode: i32,
    pub pid: Pid,
    /// The parent's pid (not a table index), stored as `usize` so it
    /// doubles as the wait/exit rendezvous channel: a parent blocked in
    /// `wait` parks on its own pid, and `exit` wakes that same value.
    pub parent: Option<usize>,
}

/// Fields private to the owning process; safe to touch without the
/// scheduler lock because only the process itself (or its creator,
/// before it is scheduled) ever does.
pub struct ProcData {
    pub kstack: usize,
    pub memory: Option<UserMemory>,
    pub context: Context,
    pub open_files: [Option<RcFile>; NOFILE],
    pub cwd: Option<RcInode>,
    pub name: [u8; MAXPROCNAME],
}

impl Default for ProcData {
    fn default() -> Self {
        Self {
            kstack: 0,
            memory: None,
            context: Context::default(),
            open_files: Default::default(),
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }
}

pub struct Proc {
    pub info: Spinlock<ProcInfo>,
    pub data: core::cell::UnsafeCell<ProcData>,
    /// Set by `kill`; consulted on every return-to-userspace path and by
    /// interruptible waits (`pipe_read`/`pipe_write`/`console_read`).
    killed: AtomicBool,
}

// SAFETY: `data` is only ever touched by the owning process (or, before
// scheduling, by its creator), never concurrently.
unsafe impl Sync for Proc {}

impl Proc {
    pub fn new() -> Self {
        Self {
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: Procstate::Unused,
                    waitchannel: 0,
                    exitcode: 0,
                    pid: 0,
                    parent: None,
                },
            ),
            data: core::cell::UnsafeCell::new(ProcData::default()),
            killed: AtomicBool::new(false),
        }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// Caller must be the process itself, or hold a guarantee that no
    /// other hart is concurrently running it.
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn pid(&self) -> Pid {
        self.info.lock().pid
    }
}

/// Per-hart scheduling state.
pub struct Cpu {
    /// The process currently running on this hart, or null when idle.
    pub proc: *mut Proc,
    /// This hart's own idle process, scheduled when the runqueue is empty.
    pub idle: *mut Proc,
    pub scheduler_context: Context,
    /// `push_off`/`pop_off` nesting depth.
    pub noff: i32,
    /// IRQ-enabled state saved by the outermost `push_off`.
    pub interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: core::ptr::null_mut(),
            idle: core::ptr::null_mut(),
            scheduler_context: Context {
                ra: 0,
                sp: 0,
                callee_saved: [0; 12],
            },
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

static mut CPUS: [Cpu; NCPU] = {
    const INIT: Cpu = Cpu::new();
    [INIT; NCPU]
};

/// Returns this hart's `Cpu`. Must be called with interrupts disabled by
/// the caller (every caller in this crate is already inside a
/// `push_off`'d spinlock, or inside the scheduler itself).
pub fn current_cpu() -> *mut Cpu {
    let id = crate::arch::hart_id();
    // SAFETY: `id < NCPU` by construction of the boot protocol; `CPUS`
    // is only accessed through this function, one element per hart.
    unsafe { CPUS.as_mut_ptr().add(id) }
}

/// Returns the process running on this hart, or `None` if it is idle.
pub fn myproc() -> Option<*mut Proc> {
    // SAFETY: reading another hart's `Cpu::proc` field races benignly:
    // it only ever changes while holding the scheduler lock, and we only
    // read our own hart's slot here.
    let p = unsafe { (*current_cpu()).proc };
    if p.is_null() {
        None
    } else {
        Some(p)
    }
}

pub fn current_pid_or(default: Pid) -> Pid {
    match myproc() {
        // SAFETY: `p` is the process running on this hart.
        Some(p) => unsafe { (*p).pid() },
        None => default,
    }
}

/// Whether the currently running process has been `kill`ed. Used by
/// blocking loops (pipe read/write, console read) to abandon a wait
/// early instead of sleeping non-alertably forever.
pub fn current_killed() -> bool {
    match myproc() {
        // SAFETY: `p` is the process running on this hart.
        Some(p) => unsafe { (*p).killed() },
        None => false,
    }
}

/// Suspends the currently running process on wait-channel `chan`.
///
/// # Safety (invariant, not `unsafe fn`)
///
/// Must only be called from process context (never from an interrupt
/// handler), with no spinlock other than the process's own `info` lock
/// held by this hart.
pub(crate) fn park(chan: usize, unalertable: bool) {
    let p = myproc().expect("park: no current process");
    // SAFETY: `p` is this hart's own running process.
    let mut guard = unsafe { (*p).info.lock() };

    // A `kill` racing just ahead of us must not put this process to
    // sleep with no one left to wake it: an alertable wait that finds
    // itself already killed skips sleeping entirely and returns so the
    // caller's loop can observe `killed()` and unwind. Non-alertable
    // waits ignore `killed` by design (see `WaitChannel::unalertable_sleep`).
    if !unalertable && unsafe { (*p).killed() } {
        return;
    }

    guard.waitchannel = chan;
    guard.state = if unalertable {
        Procstate::Deepsleeping
    } else {
        Procstate::Sleeping
    };
    procs::sched(guard);
    // SAFETY: the scheduler hands the lock back held (not reacquired) at
    // the point it `swtch`es back into this process; see `Lock::assume_held`.
    let mut guard = unsafe { (*p).info.assume_held() };
    guard.waitchannel = 0;
}
