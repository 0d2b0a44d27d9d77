//! The kernel aggregate: every per-subsystem singleton `spec.md` §9 calls
//! out as "unavoidable kernel state" gathered into one value constructed
//! at boot, with the `BlockDevice` and the filesystem's `SuperBlock`
//! (read by [`FileSystem::mount`]) injected explicitly rather than
//! reached for through a second set of global statics. Grounded on the
//! teacher's `kernel.rs` `Kernel`/`KernelBuilder` split, collapsed to a
//! single struct here: this crate's `Bcache`/`ITable`/`Procs`/page
//! allocator are already reference-counted or `Once`-backed singletons
//! in their own modules (see `bio.rs`, `fs/inode.rs`, `proc/procs.rs`,
//! `kalloc.rs`), so there is no two-phase `MaybeUninit` dance left to do
//! here the way the teacher's in-place kernel memory map required.

use spin::Once;

use crate::addr::PhysAddr;
use crate::console::Console;
use crate::exec;
use crate::file::{DevSw, FTable};
use crate::fs::FileSystem;
use crate::hal::{BlockDevice, Plic, Uart};
use crate::param::MAXPATH;
use crate::pipe::PipePool;
use crate::printer::{self, Printer};
use crate::proc::{Pid, Proc, Procs, Procstate};
use crate::trap::TrapContext;

pub struct Kernel {
    dev: &'static dyn BlockDevice,
    plic: &'static dyn Plic,
    console: &'static Console,
    devsw: DevSw,
    file_system: FileSystem,
    ftable: FTable,
    pipes: PipePool,
}

static KERNEL: Once<Kernel> = Once::new();

/// Owns the one `Console` this kernel wires up, in its own `Once` rather
/// than as a plain field of `Kernel`: `devsw` needs a `&'static Console`
/// to register *before* the `Kernel` value (and whatever address it ends
/// up at inside `KERNEL`) exists, and a `Once` hands back a reference to
/// its own stable storage immediately, with no risk of pointing at a
/// stack temporary that later moves.
static CONSOLE: Once<Console> = Once::new();

/// Brings up every subsystem and installs the global `Kernel`. Must run
/// exactly once, before any trap can be dispatched.
///
/// # Safety
///
/// `[heap_start, heap_end)` must be unused, mapped, writable physical
/// memory belonging to no one else; `dev`/`uart`/`plic` must be the only
/// handles through which anything else touches that hardware.
pub unsafe fn init(
    heap_start: PhysAddr,
    heap_end: PhysAddr,
    dev: &'static dyn BlockDevice,
    uart: &'static dyn Uart,
    plic: &'static dyn Plic,
) -> &'static Kernel {
    // SAFETY: caller guarantees the range is ours alone.
    unsafe { crate::kalloc::init(heap_start, heap_end) };

    printer::install(Printer::new(uart));
    crate::println!();
    crate::println!("kernel booting");

    let console = CONSOLE.call_once(|| Console::new(uart));
    let mut devsw = DevSw::new();
    devsw.register(crate::param::CONSOLE, console);

    let file_system = FileSystem::mount(dev);
    let ftable = FTable::new();
    let pipes = PipePool::new();

    KERNEL.call_once(|| Kernel {
        dev,
        plic,
        console,
        devsw,
        file_system,
        ftable,
        pipes,
    })
}

/// # Panics
///
/// If called before `init`.
pub fn get() -> &'static Kernel {
    KERNEL.get().expect("kernel::get: not initialized")
}

impl Kernel {
    pub fn dev(&self) -> &'static dyn BlockDevice {
        self.dev
    }

    pub fn file_system(&self) -> &FileSystem {
        &self.file_system
    }

    pub fn ftable(&self) -> &FTable {
        &self.ftable
    }

    pub fn pipes(&self) -> &PipePool {
        &self.pipes
    }

    pub fn console(&self) -> &'static Console {
        self.console
    }

    /// Resources [`crate::trap::handle_trap`] needs, borrowed for the
    /// duration of one trap.
    pub fn trap_context(&self) -> TrapContext<'_> {
        TrapContext {
            fs: &self.file_system,
            dev: self.dev,
            ftable: &self.ftable,
            devsw: &self.devsw,
            pipes: &self.pipes,
            plic: self.plic,
            console: self.console,
        }
    }

    /// Loads `init_path` as the first process, grounded on the teacher's
    /// `user_proc_init`. Unlike the teacher's hand-assembled `INITCODE`
    /// blob (needed because xv6 has no filesystem to read from until
    /// this process runs `mkfs`-prepared disk contents), this crate's
    /// `exec` can read the root filesystem directly, since `mount`
    /// already replayed the log during `init` above.
    ///
    /// Does not arrange for the hart to actually jump into the loaded
    /// image: writing `loaded.entry`/`loaded.sp` into a brand new kernel
    /// stack as though returning from a trap is architecture-specific
    /// bring-up glue outside this crate's scope. Every other process is
    /// unaffected, since `execve` after that point runs through the
    /// ordinary trap path and writes back through an already-live
    /// `TrapFrame`.
    pub fn spawn_root(&self, init_path: &str) -> Result<Pid, ()> {
        if init_path.len() >= MAXPATH {
            return Err(());
        }
        let proc: &'static Proc = Procs::alloc(None).ok_or(())?;
        // SAFETY: `proc` was just allocated and is not yet visible to
        // the scheduler (still reachable only through this function).
        let data = unsafe { proc.data_mut() };
        data.cwd = Some(self.file_system.root_inode());

        let inode = self
            .file_system
            .begin_tx(self.dev, |ctx| crate::fs::resolve(&self.file_system, ctx, self.dev, data.cwd.as_ref().unwrap(), init_path));
        let inode = match inode {
            Ok(inode) => inode,
            Err(()) => {
                let mut guard = proc.info.lock();
                guard.state = Procstate::Unused;
                return Err(());
            }
        };

        let loaded = exec::exec(&self.file_system, self.dev, &inode, &[init_path.as_bytes()]);
        self.file_system
            .begin_tx(self.dev, |ctx| self.file_system.put(ctx, self.dev, inode));
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(()) => {
                let mut guard = proc.info.lock();
                guard.state = Procstate::Unused;
                return Err(());
            }
        };
        data.memory = Some(loaded.memory);

        let pid = proc.pid();
        let mut guard = proc.info.lock();
        guard.state = Procstate::Runnable;
        drop(guard);
        Ok(pid)
    }
}
