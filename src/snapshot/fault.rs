//! Write fault injection
//!
//! Each target consults its injector on the writer immediately before a
//! block reaches the file, and before every forced sync. Production targets
//! use [`NoFaults`]; tests use [`SimulatedFaults`] to fill the disk, fail
//! syncs or hold writes back.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// What is about to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Header,
    Chunk { partition_id: u32 },
}

/// Hooks run on the blocking pool before file writes and syncs
pub trait FaultInjector: Send + Sync + fmt::Debug {
    /// Return an error to fail the write; may block to delay it
    fn before_write(&self, kind: WriteKind) -> io::Result<()>;

    /// Return an error to fail a periodic or final sync
    fn before_sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn before_write(&self, _kind: WriteKind) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Gate {
    header: bool,
    chunks: bool,
}

impl Gate {
    fn holds(&self, kind: WriteKind) -> bool {
        match kind {
            WriteKind::Header => self.header,
            WriteKind::Chunk { .. } => self.chunks,
        }
    }
}

/// Switchable disk-full, failed-sync and blocked-write simulation
///
/// Header and chunk writes are gated and failed separately, so a target
/// can still be created while chunk writes are being held or failed.
#[derive(Debug, Default)]
pub struct SimulatedFaults {
    fail_header_writes: AtomicBool,
    fail_chunk_writes: AtomicBool,
    fail_syncs: AtomicBool,
    gate: Mutex<Gate>,
    unblocked: Condvar,
}

impl SimulatedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disk_full_on_header(&self, full: bool) {
        self.fail_header_writes.store(full, Ordering::SeqCst);
    }

    pub fn set_disk_full_on_chunk(&self, full: bool) {
        self.fail_chunk_writes.store(full, Ordering::SeqCst);
    }

    pub fn set_sync_failure(&self, failing: bool) {
        self.fail_syncs.store(failing, Ordering::SeqCst);
    }

    /// Hold every chunk write until [`unblock_writes`](Self::unblock_writes)
    pub fn block_writes(&self) {
        self.gate.lock().chunks = true;
    }

    /// Hold the header write until [`unblock_writes`](Self::unblock_writes)
    pub fn block_header_writes(&self) {
        self.gate.lock().header = true;
    }

    /// Release every held write
    pub fn unblock_writes(&self) {
        *self.gate.lock() = Gate::default();
        self.unblocked.notify_all();
    }
}

fn disk_full() -> io::Error {
    io::Error::other("Disk full")
}

impl FaultInjector for SimulatedFaults {
    fn before_write(&self, kind: WriteKind) -> io::Result<()> {
        let mut gate = self.gate.lock();
        while gate.holds(kind) {
            self.unblocked.wait(&mut gate);
        }
        drop(gate);

        let full = match kind {
            WriteKind::Header => &self.fail_header_writes,
            WriteKind::Chunk { .. } => &self.fail_chunk_writes,
        };
        if full.load(Ordering::SeqCst) {
            return Err(disk_full());
        }
        Ok(())
    }

    fn before_sync(&self) -> io::Result<()> {
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(io::Error::other("Sync failed"));
        }
        Ok(())
    }
}
