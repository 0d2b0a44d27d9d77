//! The process table, pid allocator, and the scheduler itself.
//!
//! Scheduling here is the same table-scan design xv6 uses rather than a
//! separate runqueue: `NPROC` is small enough (64) that scanning the
//! whole table every reschedule is cheap, and it sidesteps keeping a
//! second data structure in sync with `ProcInfo::state`.

use core::sync::atomic::{AtomicI32, Ordering};

use array_macro::array;
use arrayvec::ArrayVec;
use spin::Once;

use super::{current_cpu, myproc, swtch, Context, Pid, Proc, ProcInfo, Procstate};
use crate::file::FTable;
use crate::fs::FileSystem;
use crate::hal::BlockDevice;
use crate::lock::{Guard, RawSpinlock, Spinlock};
use crate::param::NPROC;
use crate::pipe::PipePool;

/// pid of the first process started at boot. `exit`s reparent onto it;
/// its own `exit` is the fatal-shutdown policy `spec.md` §6 calls for.
pub const ROOT_PID: Pid = 1;

pub struct Procs {
    table: [Proc; NPROC],
}

static PROCS: Once<Procs> = Once::new();
static NEXTPID: AtomicI32 = AtomicI32::new(ROOT_PID);
/// Pids reaped by `wait` but not yet handed back out. Drained FIFO by
/// `alloc_pid` before it falls back to `NEXTPID`, so a pid is not
/// reused until every earlier-freed one has been.
static FREE_PIDS: Spinlock<ArrayVec<Pid, NPROC>> = Spinlock::new("pid_freelist", ArrayVec::new());

fn procs() -> &'static Procs {
    PROCS.call_once(|| Procs {
        table: array![_ => Proc::new(); NPROC],
    })
}

impl Procs {
    fn alloc_pid() -> Pid {
        let mut free = FREE_PIDS.lock();
        if free.is_empty() {
            drop(free);
            NEXTPID.fetch_add(1, Ordering::Relaxed)
        } else {
            free.remove(0)
        }
    }

    /// Returns `pid` to the free list for FIFO reuse by a future
    /// `alloc_pid`.
    fn free_pid(pid: Pid) {
        FREE_PIDS.lock().push(pid);
    }

    /// Finds an `Unused` slot, assigns it a fresh pid, and marks it
    /// `Runnable` with `parent` set. Returns `None` if the table is full.
    pub fn alloc(parent: Option<Pid>) -> Option<&'static Proc> {
        let p = procs();
        for proc in p.table.iter() {
            let mut guard = proc.info.lock();
            if guard.state == Procstate::Unused {
                let old_pid = guard.pid;
                guard.pid = Self::alloc_pid();
                guard.exitcode = 0;
                guard.parent = parent.map(|pid| pid as usize);
                if old_pid != 0 {
                    crate::log_info!("proc slot recycled: pid {} -> {}", old_pid, guard.pid);
                }
                drop(guard);
                return Some(proc);
            }
        }
        None
    }

    fn find_by_pid(pid: Pid) -> Option<&'static Proc> {
        for proc in procs().table.iter() {
            let guard = proc.info.lock();
            let matches = guard.state != Procstate::Unused && guard.pid == pid;
            drop(guard);
            if matches {
                return Some(proc);
            }
        }
        None
    }

    fn iter() -> impl Iterator<Item = &'static Proc> {
        procs().table.iter()
    }
}

/// Suspends the current process, whose `info` lock `guard` is already
/// held with its new state set, and hands control to the scheduler.
///
/// The lock is *not* released here: it is handed off across the context
/// switch (xv6's "lock must be held when entering the scheduler, because
/// it is released by whichever hart next switches into this process").
/// See `Lock::assume_held`.
pub(crate) fn sched(guard: Guard<'_, RawSpinlock, ProcInfo>) {
    assert_ne!(guard.state, Procstate::Running, "sched: still running");
    assert!(guard.owning_lock().holding(), "sched: lock not held");

    let c = current_cpu();
    let p = myproc().expect("sched: no current process");
    // SAFETY: `p` is this hart's own running process; its context is not
    // touched by anyone else while it is suspended.
    let pctx = unsafe { &mut (*p).data_mut().context as *mut Context };
    let cctx = unsafe { &mut (*c).scheduler_context as *mut Context };
    core::mem::forget(guard);
    // SAFETY: both contexts belong to this hart; `pctx` is only resumed
    // by a later `swtch` back into it from this same scheduler loop.
    unsafe { swtch(pctx, cctx) };
}

/// Voluntarily gives up the CPU, staying `Runnable`.
pub fn yield_(p: &Proc) {
    let mut guard = p.info.lock();
    guard.state = Procstate::Runnable;
    sched(guard);
}

/// The per-hart scheduler loop. Entered once at boot on each hart and
/// never returns.
pub fn scheduler() -> ! {
    let c = current_cpu();
    loop {
        // SAFETY: enabling interrupts here, with no lock held, is safe;
        // it lets a timer IRQ arrive while we are picking a victim.
        unsafe { crate::arch::intr_on() };

        let mut ran = false;
        for p in Procs::iter() {
            let mut guard = p.info.lock();
            if guard.state == Procstate::Runnable {
                guard.state = Procstate::Running;
                // SAFETY: `c` is this hart's own `Cpu`.
                unsafe { (*c).proc = p as *const Proc as *mut Proc };

                // SAFETY: `p` is not running anywhere else (we just set
                // `Running` while holding its lock) and will not resume
                // until this `swtch` hands control to it.
                let pctx = unsafe { &mut p.data_mut().context as *mut Context };
                core::mem::forget(guard);
                // SAFETY: see `sched`; `p`'s context was last suspended
                // inside a call to `sched`, which forgot its own guard
                // the same way, so the lock is held, not double-acquired.
                unsafe { swtch(&mut (*c).scheduler_context, pctx) };

                // `p` yielded, slept, or exited: the lock is held again,
                // handed back across the `swtch` that returned control
                // here, exactly as it was handed off above.
                // SAFETY: matches the forgotten guard above.
                let guard = unsafe { p.info.assume_held() };
                drop(guard);
                // SAFETY: `c` is this hart's own `Cpu`.
                unsafe { (*c).proc = core::ptr::null_mut() };
                ran = true;
            }
        }
        if !ran {
            crate::poweroff::wait_for_interrupt();
        }
    }
}

/// Wakes sleepers on `chan`. `onalert == false` wakes both alertable
/// (`Sleeping`) and non-alertable (`Deepsleeping`) waiters (an ordinary
/// producer wakeup); `onalert == true` wakes only alertable ones, used by
/// `kill` so a non-alertable waiter is never cut short mid-operation.
pub(crate) fn wakeup_channel(chan: usize, onalert: bool) {
    for p in Procs::iter() {
        let mut guard = p.info.lock();
        if guard.waitchannel != chan {
            continue;
        }
        let wake = match guard.state {
            Procstate::Sleeping => true,
            Procstate::Deepsleeping => !onalert,
            _ => false,
        };
        if wake {
            guard.state = Procstate::Runnable;
            guard.waitchannel = 0;
        }
    }
}

/// Marks `pid` killed and, if it is alertably asleep, wakes it early.
/// Returns `false` if no live process has this pid.
pub fn kill(pid: Pid) -> bool {
    let target = match Procs::find_by_pid(pid) {
        Some(p) => p,
        None => return false,
    };
    target.kill();
    let guard = target.info.lock();
    if guard.state == Procstate::Sleeping {
        let chan = guard.waitchannel;
        drop(guard);
        wakeup_channel(chan, true);
    }
    true
}

/// Creates a child of `parent`, sharing its address space copy-on-write
/// and duplicating its open files and working directory. Returns the
/// child's pid, or `None` if the process table or memory is exhausted.
///
/// `fs`/`ftable` are needed only to bump the refcounts on the duplicated
/// `RcInode`/`RcFile` handles (neither type implements `Clone`, by
/// design: release is always explicit, through `FileSystem::put`/
/// `FTable::close`).
pub fn fork(parent: &Proc, fs: &FileSystem, ftable: &FTable) -> Option<Pid> {
    let child = Procs::alloc(Some(parent.pid()))?;

    // SAFETY: `parent` is the caller's own process; `child` was just
    // allocated and is not yet visible to the scheduler (still `Unused`
    // in every other hart's view until we flip it below).
    let (parent_data, child_data) = unsafe { (parent.data_mut(), child.data_mut()) };

    let memory = match &parent_data.memory {
        Some(m) => match m.fork() {
            Some(m) => m,
            None => {
                let mut guard = child.info.lock();
                guard.state = Procstate::Unused;
                return None;
            }
        },
        None => {
            let mut guard = child.info.lock();
            guard.state = Procstate::Unused;
            return None;
        }
    };
    child_data.memory = Some(memory);
    child_data.name = parent_data.name;
    child_data.cwd = parent_data.cwd.as_ref().map(|ip| ip.dup(fs.itable()));
    for (slot, file) in child_data.open_files.iter_mut().zip(parent_data.open_files.iter()) {
        *slot = file.as_ref().map(|f| f.dup(ftable));
    }

    let pid = child.pid();
    let mut guard = child.info.lock();
    guard.state = Procstate::Runnable;
    drop(guard);
    Some(pid)
}

/// Reparents every child of `pid` onto `ROOT_PID`. Called by `exit`.
fn reparent_children(pid: Pid) {
    for p in Procs::iter() {
        let mut guard = p.info.lock();
        if guard.parent == Some(pid as usize) {
            guard.parent = Some(ROOT_PID as usize);
            if guard.state == Procstate::Zombie {
                drop(guard);
                wakeup_channel(ROOT_PID as usize, false);
            }
        }
    }
}

/// Terminates the calling process with `exitcode`, reparenting its
/// children and waking its parent's `wait`. Never returns; the process
/// becomes a `Zombie` until its parent reaps it.
///
/// `ROOT_PID` exiting is the fatal-shutdown policy: there is no one left
/// to reparent onto, so the kernel halts instead.
///
/// Every open file and the working-directory inode must be released
/// explicitly here (neither `RcFile` nor `RcInode` has a `Drop` impl):
/// just letting `ProcData` go out of scope would leak their file-table
/// and inode-cache slots forever.
pub fn exit(
    p: &Proc,
    exitcode: i32,
    fs: &FileSystem,
    dev: &dyn BlockDevice,
    ftable: &FTable,
    pipes: &PipePool,
) -> ! {
    let pid = p.pid();
    if pid == ROOT_PID {
        crate::poweroff::halt();
    }

    // SAFETY: `p` is the caller's own process.
    let data = unsafe { p.data_mut() };
    for file in data.open_files.iter_mut() {
        if let Some(file) = file.take() {
            ftable.close(fs, dev, pipes, file);
        }
    }
    if let Some(cwd) = data.cwd.take() {
        fs.begin_tx(dev, |ctx| fs.put(ctx, dev, cwd));
    }
    data.memory = None;

    reparent_children(pid);

    let mut guard = p.info.lock();
    let parent = guard.parent;
    guard.exitcode = exitcode;
    guard.state = Procstate::Zombie;
    drop(guard);

    if let Some(parent) = parent {
        wakeup_channel(parent, false);
    }

    let guard = p.info.lock();
    sched(guard);
    unreachable!("exit: scheduled a Zombie process");
}

/// Blocks until some child of `p` exits, reaps it, and returns its pid
/// and exit code. Returns `None` if `p` has no children at all.
pub fn wait(p: &Proc) -> Option<(Pid, i32)> {
    let pid = p.pid();
    loop {
        let mut have_children = false;
        for child in Procs::iter() {
            let mut guard = child.info.lock();
            if guard.parent != Some(pid as usize) {
                continue;
            }
            have_children = true;
            if guard.state == Procstate::Zombie {
                let child_pid = guard.pid;
                let code = guard.exitcode;
                guard.state = Procstate::Unused;
                guard.parent = None;
                guard.pid = 0;
                drop(guard);
                Procs::free_pid(child_pid);
                return Some((child_pid, code));
            }
        }
        if !have_children {
            return None;
        }
        if p.killed() {
            return None;
        }
        super::park(pid as usize, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every test here avoids `exit`/`yield_`/`scheduler`/blocking `wait`:
    /// none of those are reachable without a real context switch, which
    /// has no meaning in a host test process. Table slots are handed
    /// back to `Unused` by hand at the end of each test instead.
    fn free(p: &Proc) {
        p.info.lock().state = Procstate::Unused;
    }

    #[test]
    fn alloc_gives_distinct_pids_and_records_parent() {
        let p1 = Procs::alloc(None).unwrap();
        let p2 = Procs::alloc(Some(p1.pid())).unwrap();
        assert_ne!(p1.pid(), p2.pid());
        assert_eq!(p2.info.lock().parent, Some(p1.pid() as usize));
        free(p2);
        free(p1);
    }

    #[test]
    fn kill_requires_a_live_non_unused_pid() {
        let p = Procs::alloc(None).unwrap();
        let pid = p.pid();

        // Freshly allocated, never marked runnable: invisible to kill.
        assert!(!kill(pid));

        p.info.lock().state = Procstate::Runnable;
        assert!(kill(pid));
        assert!(p.killed());
        assert!(!kill(pid.wrapping_add(1_000_000)));

        free(p);
    }

    #[test]
    fn reparent_children_moves_orphans_onto_root_pid() {
        let parent = Procs::alloc(None).unwrap();
        let parent_pid = parent.pid();
        let child = Procs::alloc(Some(parent_pid)).unwrap();
        child.info.lock().state = Procstate::Zombie;

        reparent_children(parent_pid);

        assert_eq!(child.info.lock().parent, Some(ROOT_PID as usize));

        free(&child);
        free(parent);
    }

    #[test]
    fn wait_with_no_children_returns_none_immediately() {
        let p = Procs::alloc(None).unwrap();
        assert_eq!(wait(p), None);
        free(p);
    }

    #[test]
    fn wait_reaps_a_zombie_child_and_frees_its_slot() {
        let parent = Procs::alloc(None).unwrap();
        let parent_pid = parent.pid();
        let child = Procs::alloc(Some(parent_pid)).unwrap();
        let child_pid = child.pid();
        {
            let mut guard = child.info.lock();
            guard.state = Procstate::Zombie;
            guard.exitcode = 42;
        }

        let reaped = wait(parent);
        assert_eq!(reaped, Some((child_pid, 42)));
        assert_eq!(child.info.lock().state, Procstate::Unused);
        assert_eq!(child.info.lock().parent, None);

        free(parent);
    }
}
