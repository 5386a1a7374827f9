//! Error-analysis worker (C6): a background task that receives deferred error
//! reports from the dispatcher and updates per-sector counters and hot-spot
//! tracking off the I/O hot path.
//!
//! Design rule: no sleeping synchronization primitive is ever acquired from
//! an I/O completion handler. The historical dm-remap v4.0.4 -> v4.0.5
//! deadlock was exactly this: analysis called inline from completion took a
//! mutex already held by the completion path. The fix is this worker: the
//! dispatcher posts a small message and returns; everything that needs a
//! sleepable lock happens here, on its own thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent {
    pub sector: u64,
    pub error_code: u32,
    pub now_ns: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HotSector {
    pub sector: u64,
    pub error_count: u32,
    pub last_seen_ns: u64,
}

struct HotspotTable {
    capacity: usize,
    entries: HashMap<u64, HotSector>,
    order: VecDeque<u64>,
}

impl HotspotTable {
    fn new(capacity: usize) -> Self {
        HotspotTable {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, sector: u64, now_ns: u64) {
        if let Some(existing) = self.entries.get_mut(&sector) {
            existing.error_count += 1;
            existing.last_seen_ns = now_ns;
            self.touch(sector);
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            sector,
            HotSector {
                sector,
                error_count: 1,
                last_seen_ns: now_ns,
            },
        );
        self.order.push_back(sector);
    }

    fn touch(&mut self, sector: u64) {
        if let Some(pos) = self.order.iter().position(|s| *s == sector) {
            self.order.remove(pos);
        }
        self.order.push_back(sector);
    }

    fn top(&self, n: usize) -> Vec<HotSector> {
        let mut v: Vec<HotSector> = self.entries.values().cloned().collect();
        v.sort_by(|a, b| b.error_count.cmp(&a.error_count));
        v.truncate(n);
        v
    }
}

pub struct ErrorWorker {
    sender: SyncSender<WorkerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    total_errors: std::sync::Arc<AtomicU64>,
    dropped_events: std::sync::Arc<AtomicU64>,
    hotspots: std::sync::Arc<Mutex<HotspotTable>>,
}

enum WorkerMessage {
    Error(ErrorEvent),
    Shutdown,
}

impl ErrorWorker {
    pub fn start(queue_depth: usize, hotspot_capacity: usize) -> Self {
        let (tx, rx): (SyncSender<WorkerMessage>, Receiver<WorkerMessage>) = sync_channel(queue_depth.max(1));
        let total_errors = std::sync::Arc::new(AtomicU64::new(0));
        let dropped_events = std::sync::Arc::new(AtomicU64::new(0));
        let hotspots = std::sync::Arc::new(Mutex::new(HotspotTable::new(hotspot_capacity.max(1))));

        let worker_total = total_errors.clone();
        let worker_hotspots = hotspots.clone();
        let handle = std::thread::spawn(move || {
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(WorkerMessage::Error(event)) => {
                        worker_total.fetch_add(1, Ordering::Relaxed);
                        worker_hotspots.lock().unwrap().record(event.sector, event.now_ns);
                        log::debug!(
                            "error-worker: sector={} code={} recorded",
                            event.sector,
                            event.error_code
                        );
                    }
                    Ok(WorkerMessage::Shutdown) => break,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        ErrorWorker {
            sender: tx,
            handle: Mutex::new(Some(handle)),
            running: AtomicBool::new(true),
            total_errors,
            dropped_events,
            hotspots,
        }
    }

    /// Post an error report from the I/O completion path. Non-blocking: if the
    /// queue is full the event is dropped and counted, rather than stalling
    /// the caller (the caller must never sleep here).
    pub fn post(&self, event: ErrorEvent) {
        if self.sender.try_send(WorkerMessage::Error(event)).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn top_hotspots(&self, n: usize) -> Vec<HotSector> {
        self.hotspots.lock().unwrap().top(n)
    }

    /// Cancel and flush pending work, then join the worker thread. Per C8
    /// destruct ordering: cancel before draining, drain before dropping the
    /// queue, never destroy the queue while work is outstanding.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ErrorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
