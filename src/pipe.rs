//! Pipes: an in-kernel ring buffer connecting a reader end and a writer
//! end, grounded on xv6/rv6's `pipe.c`. Both ends share one buffer,
//! protected by a single sleepable lock -- readers block on "empty and
//! still open for writing", writers block on "full and still open for
//! reading", and closing either end wakes whoever is on the other side
//! so they can observe the closed state instead of sleeping forever.

use crate::lock::Sleepablelock;
use crate::param::{NPIPE, PIPESIZE};

struct PipeBuf {
    in_use: bool,
    data: [u8; PIPESIZE],
    /// Monotonically increasing counters, indexed mod `PIPESIZE`, so
    /// "empty" and "full" are distinguishable without a separate flag.
    nread: usize,
    nwrite: usize,
    read_open: bool,
    write_open: bool,
    read_refs: u32,
    write_refs: u32,
}

impl Default for PipeBuf {
    fn default() -> Self {
        Self {
            in_use: false,
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            read_open: false,
            write_open: false,
            read_refs: 0,
            write_refs: 0,
        }
    }
}

/// A handle to one end of a pipe. Cheap to copy; the pipe itself is only
/// torn down once both the read and write refcounts drop to zero, via
/// explicit `PipePool::close` calls (no `Drop`, matching `RcInode`'s
/// explicit-release discipline -- closing a pipe end only ever touches
/// in-memory state, so there is no transaction hazard here, but keeping
/// the same explicit-close shape avoids a special case in `file.rs`).
#[derive(Clone, Copy)]
pub struct PipeEnd {
    idx: usize,
    is_read: bool,
}

pub struct PipePool {
    slots: [Sleepablelock<PipeBuf>; NPIPE],
}

impl PipePool {
    pub fn new() -> Self {
        Self {
            slots: array_macro::array![_ => Sleepablelock::new("pipe", PipeBuf::default()); NPIPE],
        }
    }

    /// Allocates a fresh pipe, returning its read end and write end, each
    /// with one open reference.
    pub fn alloc(&self) -> Option<(PipeEnd, PipeEnd)> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut buf = slot.lock();
            if !buf.in_use {
                *buf = PipeBuf {
                    in_use: true,
                    read_open: true,
                    write_open: true,
                    read_refs: 1,
                    write_refs: 1,
                    ..PipeBuf::default()
                };
                return Some((PipeEnd { idx, is_read: true }, PipeEnd { idx, is_read: false }));
            }
        }
        None
    }

    /// Bumps `end`'s refcount, for `dup2`/`fork` sharing the descriptor.
    pub fn dup(&self, end: PipeEnd) -> PipeEnd {
        let mut buf = self.slots[end.idx].lock();
        if end.is_read {
            buf.read_refs += 1;
        } else {
            buf.write_refs += 1;
        }
        end
    }

    /// Releases one reference to `end`. Once the last reference on a
    /// side closes, the other side's blocked readers/writers are woken
    /// so they observe the closed state instead of sleeping forever;
    /// once both sides are gone the slot is freed for `alloc`.
    pub fn close(&self, end: PipeEnd) {
        let mut buf = self.slots[end.idx].lock();
        if end.is_read {
            buf.read_refs -= 1;
            if buf.read_refs == 0 {
                buf.read_open = false;
                buf.wakeup();
            }
        } else {
            buf.write_refs -= 1;
            if buf.write_refs == 0 {
                buf.write_open = false;
                buf.wakeup();
            }
        }
        if buf.read_refs == 0 && buf.write_refs == 0 {
            buf.in_use = false;
        }
    }

    /// Reads up to `dst.len()` bytes, blocking while the pipe is empty
    /// and still has a writer. Returns `0` once the last writer has
    /// closed and the buffer has drained (end of file), and `Err` if
    /// the calling process is killed while waiting.
    pub fn read(&self, end: PipeEnd, dst: &mut [u8]) -> Result<usize, ()> {
        debug_assert!(end.is_read, "pipe: read on a write end");
        let mut buf = self.slots[end.idx].lock();
        while buf.nread == buf.nwrite && buf.write_open {
            if crate::proc::current_killed() {
                return Err(());
            }
            buf.sleep();
        }
        let mut n = 0;
        while n < dst.len() && buf.nread < buf.nwrite {
            dst[n] = buf.data[buf.nread % PIPESIZE];
            buf.nread += 1;
            n += 1;
        }
        buf.wakeup();
        Ok(n)
    }

    /// Writes `src`, blocking while the ring is full and a reader
    /// remains. Returns `Err` if the last reader has closed (broken
    /// pipe) or the calling process is killed while waiting.
    pub fn write(&self, end: PipeEnd, src: &[u8]) -> Result<usize, ()> {
        debug_assert!(!end.is_read, "pipe: write on a read end");
        let mut buf = self.slots[end.idx].lock();
        let mut n = 0;
        while n < src.len() {
            if !buf.read_open {
                return Err(());
            }
            if buf.nwrite == buf.nread + PIPESIZE {
                buf.wakeup();
                if crate::proc::current_killed() {
                    return Err(());
                }
                buf.sleep();
                continue;
            }
            buf.data[buf.nwrite % PIPESIZE] = src[n];
            buf.nwrite += 1;
            n += 1;
        }
        buf.wakeup();
        Ok(n)
    }
}

impl Default for PipePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_preserved() {
        let pool = PipePool::new();
        let (r, w) = pool.alloc().unwrap();
        assert_eq!(pool.write(w, b"abc").unwrap(), 3);
        assert_eq!(pool.write(w, b"def").unwrap(), 3);
        let mut buf = [0u8; 6];
        assert_eq!(pool.read(r, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
        pool.close(r);
        pool.close(w);
    }

    #[test]
    fn read_returns_eof_after_writer_closes_and_drains() {
        let pool = PipePool::new();
        let (r, w) = pool.alloc().unwrap();
        pool.write(w, b"x").unwrap();
        let mut one = [0u8; 1];
        assert_eq!(pool.read(r, &mut one).unwrap(), 1);
        pool.close(w);
        let mut buf = [0u8; 4];
        assert_eq!(pool.read(r, &mut buf).unwrap(), 0);
        pool.close(r);
    }

    #[test]
    fn write_after_reader_closed_is_broken_pipe() {
        let pool = PipePool::new();
        let (r, w) = pool.alloc().unwrap();
        pool.close(r);
        assert!(pool.write(w, b"x").is_err());
        pool.close(w);
    }

    #[test]
    fn dup_keeps_pipe_alive_until_every_handle_closes() {
        let pool = PipePool::new();
        let (r, w) = pool.alloc().unwrap();
        let w2 = pool.dup(w);
        pool.close(w);
        // `w2` still open: a reader blocked on empty-and-write_open must
        // not see end-of-file yet. We only assert the non-blocking half:
        // a write through the surviving handle still succeeds.
        assert!(pool.write(w2, b"y").is_ok());
        pool.close(w2);
        pool.close(r);
    }
}
