//! I/O dispatcher (C7): per-request lookup, forward, and completion handling,
//! including the non-sleeping error path that turns a backing-device failure
//! into a remap.

use crate::allocator::BitmapAllocator;
use crate::error_worker::{ErrorEvent, ErrorWorker};
use crate::errors::{RemapError, Result};
use crate::remap_index::{RemapEntry, RemapIndex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingDevice {
    Main,
    Spare,
}

/// Abstraction over "submit this I/O", implemented by the target lifecycle
/// (C8) over the real main/spare `BlockDevice`s and by tests over a mock that
/// can be told to fail specific sectors.
pub trait Backing: Send + Sync {
    fn submit(&self, device: BackingDevice, sector: u64, length_sectors: u32, is_write: bool) -> std::io::Result<()>;
}

/// A short-lived, non-sleeping spinlock. Used only to guard the
/// check-then-act sequence in the error path (§5: "allocation from C2 and
/// insertion into C3 both use non-sleeping locks"); it is never held across
/// an actual I/O submission.
struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let result = f();
        self.locked.store(false, Ordering::Release);
        result
    }
}

/// Per-request context, pooled rather than allocated fresh per request (§9's
/// "inline bio cloning" redesign note, expressed as ownership).
#[derive(Debug, Default, Clone)]
struct RequestContext {
    split: bool,
}

struct ContextPool {
    free: std::sync::Mutex<Vec<RequestContext>>,
}

impl ContextPool {
    fn new() -> Self {
        ContextPool {
            free: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> RequestContext {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    fn release(&self, mut ctx: RequestContext) {
        ctx.split = false;
        let mut free = self.free.lock().unwrap();
        if free.len() < 256 {
            free.push(ctx);
        }
    }
}

pub struct DispatchStats {
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
    pub total_remaps: AtomicU64,
    pub total_errors: AtomicU64,
}

impl Default for DispatchStats {
    fn default() -> Self {
        DispatchStats {
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
            total_remaps: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }
}

pub struct Dispatcher {
    remap_index: Arc<RemapIndex>,
    allocator: Arc<BitmapAllocator>,
    error_worker: Arc<ErrorWorker>,
    error_lock: Spinlock,
    context_pool: ContextPool,
    pub stats: DispatchStats,
    dirty: AtomicBool,
}

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
}

impl Dispatcher {
    pub fn new(remap_index: Arc<RemapIndex>, allocator: Arc<BitmapAllocator>, error_worker: Arc<ErrorWorker>) -> Self {
        Dispatcher {
            remap_index,
            allocator,
            error_worker,
            error_lock: Spinlock::new(),
            context_pool: ContextPool::new(),
            stats: DispatchStats::default(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Whether a metadata persist is owed since the last time it was cleared.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn dispatch(&self, backing: &dyn Backing, sector: u64, length_sectors: u32, is_write: bool) -> Result<()> {
        let ctx = self.context_pool.acquire();
        if is_write {
            self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        }

        let result = self.dispatch_inner(backing, sector, length_sectors, is_write);
        self.context_pool.release(ctx);
        result
    }

    fn dispatch_inner(&self, backing: &dyn Backing, sector: u64, length_sectors: u32, is_write: bool) -> Result<()> {
        match self.remap_index.lookup(sector) {
            Some(entry) => {
                let mapped_remaining = (entry.main_sector + entry.length_sectors as u64) - sector;
                if (length_sectors as u64) <= mapped_remaining {
                    let spare_offset = entry.spare_sector + (sector - entry.main_sector);
                    self.submit_to_spare(backing, spare_offset, length_sectors, is_write)
                } else {
                    // Split at the entry boundary: the mapped prefix goes to
                    // the spare, the rest is routed independently.
                    let first_len = mapped_remaining as u32;
                    let spare_offset = entry.spare_sector + (sector - entry.main_sector);
                    self.submit_to_spare(backing, spare_offset, first_len, is_write)?;
                    let rest_sector = sector + mapped_remaining;
                    let rest_len = length_sectors - first_len;
                    self.dispatch_inner(backing, rest_sector, rest_len, is_write)
                }
            }
            None => self.submit_to_main(backing, sector, length_sectors, is_write),
        }
    }

    fn submit_to_spare(&self, backing: &dyn Backing, spare_sector: u64, length_sectors: u32, is_write: bool) -> Result<()> {
        backing
            .submit(BackingDevice::Spare, spare_sector, length_sectors, is_write)
            .map_err(|source| RemapError::BackingIoError {
                sector: spare_sector,
                source,
            })
    }

    fn submit_to_main(&self, backing: &dyn Backing, sector: u64, length_sectors: u32, is_write: bool) -> Result<()> {
        match backing.submit(BackingDevice::Main, sector, length_sectors, is_write) {
            Ok(()) => Ok(()),
            Err(io_err) => {
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                self.handle_main_failure(backing, sector, length_sectors, is_write, io_err)
            }
        }
    }

    /// §4.6 completion failure handling: idempotent for concurrent errors on
    /// the same sector (P7), non-sleeping for the check-and-insert step.
    /// Remaps exactly the allocation unit containing `main_sector`; any
    /// portion of the request past that unit is resubmitted through
    /// `dispatch_inner`, which will either hit an adjacent remap or take
    /// another pass through this same handler for its own unit.
    fn handle_main_failure(
        &self,
        backing: &dyn Backing,
        main_sector: u64,
        length_sectors: u32,
        is_write: bool,
        original_err: std::io::Error,
    ) -> Result<()> {
        self.error_worker.post(ErrorEvent {
            sector: main_sector,
            error_code: original_err.raw_os_error().unwrap_or(libc::EIO) as u32,
            now_ns: now_ns(),
        });

        let unit_sectors = self.allocator.unit_sectors();
        let aligned_main = (main_sector / unit_sectors) * unit_sectors;
        let unit_end = aligned_main + unit_sectors;
        let in_unit_len = (unit_end - main_sector).min(length_sectors as u64) as u32;

        enum Plan {
            UseExisting(u64),
            Allocated(u64),
        }

        let plan = self.error_lock.with_lock(|| -> Result<Plan> {
            if let Some(existing) = self.remap_index.lookup(main_sector) {
                return Ok(Plan::UseExisting(existing.spare_sector + (main_sector - existing.main_sector)));
            }
            let start_unit = self.allocator.allocate(1)?;
            let spare_unit_sector = start_unit * unit_sectors;
            let entry = RemapEntry {
                main_sector: aligned_main,
                spare_sector: spare_unit_sector,
                length_sectors: unit_sectors as u32,
                created_ns: now_ns(),
                error_count: 1,
                flags: 0,
            };
            if !self.remap_index.insert(entry) {
                // Lost the race between our lookup and insert; someone else
                // beat us to it inside this same critical section window.
                // Give back the unit we just took and reuse theirs.
                self.allocator.release(start_unit, 1)?;
                let existing = self.remap_index.lookup(main_sector).expect("race winner must be visible");
                return Ok(Plan::UseExisting(existing.spare_sector + (main_sector - existing.main_sector)));
            }
            Ok(Plan::Allocated(spare_unit_sector + (main_sector - aligned_main)))
        })?;

        let spare_sector = match plan {
            Plan::UseExisting(s) => s,
            Plan::Allocated(s) => {
                self.stats.total_remaps.fetch_add(1, Ordering::Relaxed);
                self.mark_dirty();
                log::warn!(
                    "dispatcher: remapped main unit at sector {} to spare sector {}",
                    aligned_main,
                    s - (main_sector - aligned_main)
                );
                s
            }
        };

        self.submit_to_spare(backing, spare_sector, in_unit_len, is_write)?;

        if in_unit_len < length_sectors {
            let rest_sector = main_sector + in_unit_len as u64;
            let rest_len = length_sectors - in_unit_len;
            return self.dispatch_inner(backing, rest_sector, rest_len, is_write);
        }
        Ok(())
    }
}
