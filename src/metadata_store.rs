//! Metadata store (C5): writes a `MetadataRecord` to every placement location
//! on the spare device, discovers and reconciles copies on read, and repairs
//! minority-corrupt copies.

use crate::config::WriteQuorum;
use crate::crash_sim::{check_crash_point, CrashPoint};
use crate::device::BlockDevice;
use crate::errors::{RemapError, Result};
use crate::metadata_codec::{MetadataRecord, PlacementDescriptor, RECORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Probing,
    Fresh,
    Loaded,
    Degraded,
    Closed,
}

#[derive(Debug)]
pub struct CopyWriteResult {
    pub copy_index: usize,
    pub sector: u64,
    pub ok: bool,
}

/// What `probe` found on the spare device.
pub enum ProbeOutcome {
    Fresh,
    Loaded(MetadataRecord),
}

pub struct MetadataStore {
    state: Mutex<StoreState>,
    cached: RwLock<Option<MetadataRecord>>,
    sequence: AtomicU64,
    write_quorum: WriteQuorum,
}

impl MetadataStore {
    pub fn new(write_quorum: WriteQuorum) -> Self {
        MetadataStore {
            state: Mutex::new(StoreState::Probing),
            cached: RwLock::new(None),
            sequence: AtomicU64::new(0),
            write_quorum,
        }
    }

    pub fn state(&self) -> StoreState {
        *self.state.lock().unwrap()
    }

    pub fn cached_record(&self) -> Option<MetadataRecord> {
        self.cached.read().unwrap().clone()
    }

    pub(crate) fn read_copy(device: &BlockDevice, sector: u64) -> Option<MetadataRecord> {
        let mut buf = vec![0u8; RECORD_SIZE];
        device.read_at(sector * 512, &mut buf).ok()?;
        MetadataRecord::decode(&buf).ok()
    }

    /// Attempt to find existing metadata at the fixed placement locations,
    /// falling back to an 8-sector-step scan bounded by device size.
    pub fn probe(&self, device: &BlockDevice, placement: &PlacementDescriptor) -> Result<ProbeOutcome> {
        *self.state.lock().unwrap() = StoreState::Probing;

        let mut valid: Vec<(usize, u64, MetadataRecord)> = Vec::new();
        for (i, &sector) in placement.sectors().iter().enumerate() {
            if let Some(record) = Self::read_copy(device, sector) {
                valid.push((i, sector, record));
            }
        }

        if valid.is_empty() {
            const SCAN_STEP_SECTORS: u64 = 8;
            let mut sector = 0u64;
            while sector + crate::metadata_codec::METADATA_COPY_SECTORS <= device.size_sectors {
                if let Some(record) = Self::read_copy(device, sector) {
                    valid.push((record.copy_index as usize, sector, record));
                    break;
                }
                sector += SCAN_STEP_SECTORS;
            }
        }

        if valid.is_empty() {
            *self.state.lock().unwrap() = StoreState::Fresh;
            self.sequence.store(0, Ordering::SeqCst);
            return Ok(ProbeOutcome::Fresh);
        }

        let selected = Self::resolve_authoritative(&valid);
        self.sequence.store(selected.monotonic_sequence, Ordering::SeqCst);
        *self.cached.write().unwrap() = Some(selected.clone());
        *self.state.lock().unwrap() = StoreState::Loaded;

        // Repair: rewrite the selected record over any location that failed
        // to validate, including any placement slot with no valid copy at all.
        for (i, &sector) in placement.sectors().iter().enumerate() {
            let have_valid_here = valid.iter().any(|(vi, _, _)| *vi == i);
            if !have_valid_here {
                log::warn!("metadata store: repairing invalid copy {i} at sector {sector}");
                check_crash_point(CrashPoint::DuringRepair).ok();
                let mut repaired = selected.clone();
                repaired.copy_index = i as u32;
                let _ = Self::write_copy(device, sector, &repaired);
            }
        }

        Ok(ProbeOutcome::Loaded(selected))
    }

    /// I2: maximum sequence wins; ties broken by maximum timestamp, then
    /// minimum copy_index.
    fn resolve_authoritative(valid: &[(usize, u64, MetadataRecord)]) -> MetadataRecord {
        valid
            .iter()
            .min_by(|a, b| {
                let (ai, _, ar) = a;
                let (bi, _, br) = b;
                br.monotonic_sequence
                    .cmp(&ar.monotonic_sequence)
                    .then(br.timestamp_ns.cmp(&ar.timestamp_ns))
                    .then(ai.cmp(bi))
            })
            .map(|(_, _, r)| r.clone())
            .expect("valid is non-empty")
    }

    /// Write protocol: bump the sequence, write every placement location,
    /// and report success per the configured write quorum.
    pub fn persist(
        &self,
        device: &BlockDevice,
        placement: &PlacementDescriptor,
        mut record: MetadataRecord,
        now_ns: u64,
    ) -> Result<Vec<CopyWriteResult>> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        record.monotonic_sequence = seq;
        record.timestamp_ns = now_ns;

        let mut results = Vec::with_capacity(placement.sectors().len());
        let mut successes = 0usize;
        for (i, &sector) in placement.sectors().iter().enumerate() {
            let mut copy = record.clone();
            copy.copy_index = i as u32;
            let ok = Self::write_copy(device, sector, &copy).is_ok();
            if ok {
                successes += 1;
            }
            results.push(CopyWriteResult {
                copy_index: i,
                sector,
                ok,
            });
        }

        let required = self.write_quorum.required(placement.sectors().len());
        if successes >= required {
            *self.cached.write().unwrap() = Some(record);
            *self.state.lock().unwrap() = StoreState::Loaded;
            Ok(results)
        } else {
            *self.state.lock().unwrap() = StoreState::Degraded;
            log::error!(
                "metadata store: only {successes}/{} copy writes succeeded, quorum {required} not met, target is degraded",
                placement.sectors().len()
            );
            Err(RemapError::PersistenceDegraded)
        }
    }

    fn write_copy(device: &BlockDevice, sector: u64, record: &MetadataRecord) -> Result<()> {
        check_crash_point(CrashPoint::BeforeCopyWrite).map_err(|e| RemapError::Codec(e.to_string()))?;
        let buf = record.encode();
        device.write_at(sector * 512, &buf)?;
        check_crash_point(CrashPoint::AfterCopyWrite).map_err(|e| RemapError::Codec(e.to_string()))?;
        device.fdatasync()?;
        check_crash_point(CrashPoint::AfterCopyFsync).map_err(|e| RemapError::Codec(e.to_string()))?;
        Ok(())
    }

    pub fn close(&self) {
        *self.state.lock().unwrap() = StoreState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_sim::get_crash_simulator;
    use crate::metadata_codec::{DeviceFingerprint, PlacementDescriptor, TargetConfiguration};
    use std::io::Write;
    use uuid::Uuid;

    fn backing_device(sectors: u64) -> (tempfile::NamedTempFile, BlockDevice) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (sectors * 512) as usize]).unwrap();
        f.flush().unwrap();
        let dev = BlockDevice::open(f.path(), false).unwrap();
        (f, dev)
    }

    fn sample_record(seq: u64) -> MetadataRecord {
        MetadataRecord {
            monotonic_sequence: seq,
            copy_index: 0,
            timestamp_ns: seq,
            main_fingerprint: DeviceFingerprint {
                uuid: Uuid::new_v4(),
                path: "/dev/main".into(),
                size_sectors: 200_000,
                sector_size: 512,
                model_serial_hash: 1,
            },
            spare_fingerprint: DeviceFingerprint {
                uuid: Uuid::new_v4(),
                path: "/dev/spare".into(),
                size_sectors: 32768,
                sector_size: 512,
                model_serial_hash: 2,
            },
            target_configuration: TargetConfiguration {
                params: "0 200000 dm-remap-v4 /dev/main /dev/spare".into(),
                target_size_sectors: 200_000,
                allocation_unit_sectors: 8,
            },
            placement: PlacementDescriptor::select(32768).unwrap(),
            remap_entries: vec![],
            truncated: false,
        }
    }

    #[test]
    fn probe_on_blank_device_is_fresh() {
        let (_f, dev) = backing_device(32768);
        let placement = PlacementDescriptor::select(32768).unwrap();
        let store = MetadataStore::new(WriteQuorum::Any);
        match store.probe(&dev, &placement).unwrap() {
            ProbeOutcome::Fresh => {}
            ProbeOutcome::Loaded(_) => panic!("expected fresh"),
        }
        assert_eq!(store.state(), StoreState::Fresh);
    }

    #[test]
    fn persist_then_probe_recovers_record() {
        let (_f, dev) = backing_device(32768);
        let placement = PlacementDescriptor::select(32768).unwrap();
        let store = MetadataStore::new(WriteQuorum::Any);
        let record = sample_record(0);
        store.persist(&dev, &placement, record, 1000).unwrap();

        let store2 = MetadataStore::new(WriteQuorum::Any);
        match store2.probe(&dev, &placement).unwrap() {
            ProbeOutcome::Loaded(r) => assert_eq!(r.monotonic_sequence, 1),
            ProbeOutcome::Fresh => panic!("expected loaded"),
        }
    }

    #[test]
    fn authority_selection_picks_max_sequence() {
        let (_f, dev) = backing_device(32768);
        let placement = PlacementDescriptor::select(32768).unwrap();
        let store = MetadataStore::new(WriteQuorum::Any);
        store.persist(&dev, &placement, sample_record(0), 1000).unwrap();
        store.persist(&dev, &placement, sample_record(0), 2000).unwrap();

        let store2 = MetadataStore::new(WriteQuorum::Any);
        match store2.probe(&dev, &placement).unwrap() {
            ProbeOutcome::Loaded(r) => assert_eq!(r.monotonic_sequence, 2),
            ProbeOutcome::Fresh => panic!("expected loaded"),
        }
    }

    #[test]
    fn corrupt_minority_copy_is_repaired_on_probe() {
        let (_f, dev) = backing_device(32768);
        let placement = PlacementDescriptor::select(32768).unwrap();
        let store = MetadataStore::new(WriteQuorum::Any);
        store.persist(&dev, &placement, sample_record(0), 1000).unwrap();

        // Corrupt the copy at sector 4096 (index 2 of the geometric layout).
        let zeros = vec![0u8; RECORD_SIZE];
        dev.write_at(4096 * 512, &zeros).unwrap();

        let store2 = MetadataStore::new(WriteQuorum::Any);
        store2.probe(&dev, &placement).unwrap();

        // A fresh probe should now find a valid, repaired copy at 4096.
        let repaired = MetadataStore::read_copy(&dev, 4096);
        assert!(repaired.is_some());
    }

    #[test]
    fn crash_point_between_write_and_fsync_never_yields_valid_corruption() {
        let (_f, dev) = backing_device(32768);
        let placement = PlacementDescriptor::select(32768).unwrap();
        let store = MetadataStore::new(WriteQuorum::Any);

        get_crash_simulator().enable_at(CrashPoint::AfterCopyWrite);
        let result = store.persist(&dev, &placement, sample_record(0), 1000);
        get_crash_simulator().reset();
        // The simulated crash aborts the whole persist (propagated as an
        // error from write_copy), so no copy should have been left half-torn.
        assert!(result.is_err());
    }
}
