//! External interface (§6): a sysfs-style, read-only counter snapshot and its
//! Prometheus-style text rendering. This crate exposes the snapshot type and
//! renderer; it does not create or manage an actual sysfs mount.

use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub health_score: u8,
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_remaps: u64,
    pub total_errors: u64,
    pub active_mappings: u32,
}

impl Stats {
    /// `health_score` is a saturating function of error rate over total I/O,
    /// clamped to [0, 100]; 100 means no observed errors.
    pub fn compute_health_score(total_errors: u64, total_io: u64) -> u8 {
        if total_io == 0 {
            return 100;
        }
        let error_rate = total_errors as f64 / total_io as f64;
        let score = (1.0 - error_rate.min(1.0)) * 100.0;
        score.round().clamp(0.0, 100.0) as u8
    }

    pub fn all_stats(&self) -> String {
        let mut out = String::new();
        writeln!(out, "health_score {}", self.health_score).unwrap();
        writeln!(out, "total_reads {}", self.total_reads).unwrap();
        writeln!(out, "total_writes {}", self.total_writes).unwrap();
        writeln!(out, "total_remaps {}", self.total_remaps).unwrap();
        writeln!(out, "total_errors {}", self.total_errors).unwrap();
        write!(out, "active_mappings {}", self.active_mappings).unwrap();
        out
    }
}
