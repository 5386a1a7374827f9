//! Metadata codec (C4): encode/decode the fixed 4 KiB on-disk metadata record,
//! its three CRC32s, and the size-driven placement-strategy selection table.

use crate::crc::crc32;
use crate::errors::{RemapError, Result};
use crate::remap_index::RemapEntry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const RECORD_SIZE: usize = 4096;
pub const MAGIC: u32 = 0x444D_5234;
pub const FOOTER_MAGIC: u32 = 0x3452_4D44;
pub const VERSION: u32 = 1;

/// Fixed footprint of one metadata copy, in sectors (4 KiB / 512).
pub const METADATA_COPY_SECTORS: u64 = 8;

const HEADER_LEN: usize = 0x28;
const LEGACY_LEN: usize = 64;
const FP_LEN: usize = 104;
const TARGET_CFG_LEN: usize = 148;
const PLACEMENT_LEN: usize = 48;
const ENTRY_LEN: usize = 36;

const LEGACY_START: usize = HEADER_LEN;
const MAIN_FP_START: usize = LEGACY_START + LEGACY_LEN;
const SPARE_FP_START: usize = MAIN_FP_START + FP_LEN;
const TARGET_CFG_START: usize = SPARE_FP_START + FP_LEN;
const PLACEMENT_START: usize = TARGET_CFG_START + TARGET_CFG_LEN;
const REMAP_SNAPSHOT_START: usize = PLACEMENT_START + PLACEMENT_LEN;
const FOOTER_START: usize = 0xFF8;
const REMAP_SNAPSHOT_LEN: usize = FOOTER_START - REMAP_SNAPSHOT_START;
/// Maximum number of remap entries that fit in one record's snapshot section.
/// Tables larger than this embed only the first `MAX_EMBEDDED_ENTRIES`; the
/// rest are recovered the same way any unpersisted delta is: a crash or a
/// truncated snapshot just means those sectors are re-discovered as I/O
/// errors after reassembly and re-remapped (§5's correctness-preserving
/// degradation covers this case too, not just crash loss).
pub const MAX_EMBEDDED_ENTRIES: usize = (REMAP_SNAPSHOT_LEN - 4) / ENTRY_LEN;

const MIN_VIABLE_SPARE_SECTORS: u64 = 72;
const MINIMAL_MAX_SECTORS: u64 = 1024;
const LINEAR_MAX_SECTORS: u64 = 8192;
const GEOMETRIC_OFFSETS: [u64; 5] = [0, 1024, 2048, 4096, 8192];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStrategyKind {
    Geometric,
    Linear,
    Minimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDescriptor {
    pub strategy: PlacementStrategyKind,
    pub copy_sectors: Vec<u64>,
}

impl PlacementDescriptor {
    pub fn sectors(&self) -> &[u64] {
        &self.copy_sectors
    }

    /// Choose a placement strategy for a spare device of `spare_sectors` sectors.
    pub fn select(spare_sectors: u64) -> Result<Self> {
        if spare_sectors < MIN_VIABLE_SPARE_SECTORS {
            return Err(RemapError::SpareTooSmall {
                spare_sectors,
                minimum: MIN_VIABLE_SPARE_SECTORS,
            });
        }
        let m = METADATA_COPY_SECTORS;
        if spare_sectors < MINIMAL_MAX_SECTORS {
            let max_fit = (spare_sectors / m).min(5);
            let copy_sectors = (0..max_fit).map(|i| i * m).collect();
            Ok(PlacementDescriptor {
                strategy: PlacementStrategyKind::Minimal,
                copy_sectors,
            })
        } else if spare_sectors < LINEAR_MAX_SECTORS {
            let count = (spare_sectors / m).min(5).max(1);
            let spacing = spare_sectors / count;
            let copy_sectors = (0..count).map(|i| i * spacing).collect();
            Ok(PlacementDescriptor {
                strategy: PlacementStrategyKind::Linear,
                copy_sectors,
            })
        } else {
            Ok(PlacementDescriptor {
                strategy: PlacementStrategyKind::Geometric,
                copy_sectors: GEOMETRIC_OFFSETS.to_vec(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub uuid: Uuid,
    pub path: String,
    pub size_sectors: u64,
    pub sector_size: u32,
    pub model_serial_hash: u64,
}

impl DeviceFingerprint {
    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), FP_LEN);
        buf[0..16].copy_from_slice(self.uuid.as_bytes());
        let path_bytes = self.path.as_bytes();
        let path_cap = 64 - 1;
        let n = path_bytes.len().min(path_cap);
        buf[16..16 + n].copy_from_slice(&path_bytes[..n]);
        buf[16 + n] = 0;
        buf[80..88].copy_from_slice(&self.size_sectors.to_le_bytes());
        buf[88..92].copy_from_slice(&self.sector_size.to_le_bytes());
        buf[92..100].copy_from_slice(&self.model_serial_hash.to_le_bytes());
        let crc = crc32(&buf[0..100]);
        buf[100..104].copy_from_slice(&crc.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        debug_assert_eq!(buf.len(), FP_LEN);
        let stored_crc = u32::from_le_bytes(buf[100..104].try_into().unwrap());
        if crc32(&buf[0..100]) != stored_crc {
            return Err(RemapError::Codec("fingerprint CRC mismatch".into()));
        }
        let uuid = Uuid::from_slice(&buf[0..16]).map_err(|e| RemapError::Codec(e.to_string()))?;
        let nul = buf[16..80].iter().position(|&b| b == 0).unwrap_or(64);
        let path = String::from_utf8_lossy(&buf[16..16 + nul]).into_owned();
        let size_sectors = u64::from_le_bytes(buf[80..88].try_into().unwrap());
        let sector_size = u32::from_le_bytes(buf[88..92].try_into().unwrap());
        let model_serial_hash = u64::from_le_bytes(buf[92..100].try_into().unwrap());
        Ok(DeviceFingerprint {
            uuid,
            path,
            size_sectors,
            sector_size,
            model_serial_hash,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfiguration {
    pub params: String,
    pub target_size_sectors: u64,
    /// Spare allocation unit size this target was constructed with, so
    /// reassembly on a different host (or with a changed `--unit-size`) can
    /// detect a mismatch rather than silently misinterpreting the bitmap and
    /// remap table against the wrong granularity.
    pub allocation_unit_sectors: u64,
}

impl TargetConfiguration {
    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), TARGET_CFG_LEN);
        let params_bytes = self.params.as_bytes();
        let cap = 128 - 1;
        let n = params_bytes.len().min(cap);
        buf[0..n].copy_from_slice(&params_bytes[..n]);
        buf[n] = 0;
        buf[128..136].copy_from_slice(&self.target_size_sectors.to_le_bytes());
        buf[136..144].copy_from_slice(&self.allocation_unit_sectors.to_le_bytes());
        let crc = crc32(&buf[0..144]);
        buf[144..148].copy_from_slice(&crc.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        debug_assert_eq!(buf.len(), TARGET_CFG_LEN);
        let stored_crc = u32::from_le_bytes(buf[144..148].try_into().unwrap());
        if crc32(&buf[0..144]) != stored_crc {
            return Err(RemapError::Codec("target configuration CRC mismatch".into()));
        }
        let nul = buf[0..128].iter().position(|&b| b == 0).unwrap_or(128);
        let params = String::from_utf8_lossy(&buf[0..nul]).into_owned();
        let target_size_sectors = u64::from_le_bytes(buf[128..136].try_into().unwrap());
        let allocation_unit_sectors = u64::from_le_bytes(buf[136..144].try_into().unwrap());
        Ok(TargetConfiguration {
            params,
            target_size_sectors,
            allocation_unit_sectors,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub monotonic_sequence: u64,
    pub copy_index: u32,
    pub timestamp_ns: u64,
    pub main_fingerprint: DeviceFingerprint,
    pub spare_fingerprint: DeviceFingerprint,
    pub target_configuration: TargetConfiguration,
    pub placement: PlacementDescriptor,
    pub remap_entries: Vec<RemapEntry>,
    /// True when `remap_entries` is a truncated view of a larger live table.
    pub truncated: bool,
}

impl MetadataRecord {
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];

        self.main_fingerprint
            .encode(&mut buf[MAIN_FP_START..MAIN_FP_START + FP_LEN]);
        self.spare_fingerprint
            .encode(&mut buf[SPARE_FP_START..SPARE_FP_START + FP_LEN]);
        self.target_configuration
            .encode(&mut buf[TARGET_CFG_START..TARGET_CFG_START + TARGET_CFG_LEN]);

        {
            let p = &mut buf[PLACEMENT_START..PLACEMENT_START + PLACEMENT_LEN];
            let strategy_tag: u32 = match self.placement.strategy {
                PlacementStrategyKind::Geometric => 0,
                PlacementStrategyKind::Linear => 1,
                PlacementStrategyKind::Minimal => 2,
            };
            p[0..4].copy_from_slice(&strategy_tag.to_le_bytes());
            p[4..8].copy_from_slice(&(self.placement.copy_sectors.len() as u32).to_le_bytes());
            for (i, s) in self.placement.copy_sectors.iter().enumerate().take(5) {
                p[8 + i * 8..16 + i * 8].copy_from_slice(&s.to_le_bytes());
            }
        }

        let embedded = &self.remap_entries[..self.remap_entries.len().min(MAX_EMBEDDED_ENTRIES)];
        {
            let s = &mut buf[REMAP_SNAPSHOT_START..FOOTER_START];
            s[0..4].copy_from_slice(&(embedded.len() as u32).to_le_bytes());
            for (i, e) in embedded.iter().enumerate() {
                let off = 4 + i * ENTRY_LEN;
                s[off..off + 8].copy_from_slice(&e.main_sector.to_le_bytes());
                s[off + 8..off + 16].copy_from_slice(&e.spare_sector.to_le_bytes());
                s[off + 16..off + 20].copy_from_slice(&e.length_sectors.to_le_bytes());
                s[off + 20..off + 28].copy_from_slice(&e.created_ns.to_le_bytes());
                s[off + 28..off + 32].copy_from_slice(&e.error_count.to_le_bytes());
                s[off + 32..off + 36].copy_from_slice(&e.flags.to_le_bytes());
            }
        }

        // header (written last so header_crc/data_crc can cover the body)
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.monotonic_sequence.to_le_bytes());
        buf[16..20].copy_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
        // header_crc at 20..24 left zero for computation
        let data_crc = crc32(&buf[HEADER_LEN..FOOTER_START]);
        buf[24..28].copy_from_slice(&data_crc.to_le_bytes());
        buf[28..32].copy_from_slice(&self.copy_index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        let header_crc = crc32(&buf[0..40]);
        buf[20..24].copy_from_slice(&header_crc.to_le_bytes());

        buf[FOOTER_START..FOOTER_START + 4].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        // overall_crc at FOOTER_START+4..+8 left zero for computation
        let overall_crc = crc32(&buf[0..RECORD_SIZE - 4]);
        buf[RECORD_SIZE - 4..RECORD_SIZE].copy_from_slice(&overall_crc.to_le_bytes());

        buf
    }

    /// Decode and fully validate a record (I3: magic, version, header_crc,
    /// overall_crc must all check out).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_SIZE {
            return Err(RemapError::Codec("record is not 4096 bytes".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(RemapError::Codec("bad magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(RemapError::Codec(format!("unsupported version {version}")));
        }
        let stored_header_crc = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let mut header_check = [0u8; HEADER_LEN];
        header_check.copy_from_slice(&buf[0..HEADER_LEN]);
        header_check[20..24].copy_from_slice(&[0, 0, 0, 0]);
        if crc32(&header_check) != stored_header_crc {
            return Err(RemapError::Codec("header CRC mismatch".into()));
        }
        let footer_magic = u32::from_le_bytes(buf[FOOTER_START..FOOTER_START + 4].try_into().unwrap());
        if footer_magic != FOOTER_MAGIC {
            return Err(RemapError::Codec("bad footer magic".into()));
        }
        let stored_overall_crc = u32::from_le_bytes(buf[RECORD_SIZE - 4..RECORD_SIZE].try_into().unwrap());
        let mut whole = buf.to_vec();
        whole[RECORD_SIZE - 4..RECORD_SIZE].copy_from_slice(&[0, 0, 0, 0]);
        if crc32(&whole[0..RECORD_SIZE - 4]) != stored_overall_crc {
            return Err(RemapError::Codec("overall CRC mismatch".into()));
        }

        let monotonic_sequence = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let copy_index = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let timestamp_ns = u64::from_le_bytes(buf[32..40].try_into().unwrap());

        let main_fingerprint = DeviceFingerprint::decode(&buf[MAIN_FP_START..MAIN_FP_START + FP_LEN])?;
        let spare_fingerprint = DeviceFingerprint::decode(&buf[SPARE_FP_START..SPARE_FP_START + FP_LEN])?;
        let target_configuration =
            TargetConfiguration::decode(&buf[TARGET_CFG_START..TARGET_CFG_START + TARGET_CFG_LEN])?;

        let p = &buf[PLACEMENT_START..PLACEMENT_START + PLACEMENT_LEN];
        let strategy = match u32::from_le_bytes(p[0..4].try_into().unwrap()) {
            0 => PlacementStrategyKind::Geometric,
            1 => PlacementStrategyKind::Linear,
            2 => PlacementStrategyKind::Minimal,
            other => return Err(RemapError::Codec(format!("unknown placement strategy tag {other}"))),
        };
        let copy_count = u32::from_le_bytes(p[4..8].try_into().unwrap()) as usize;
        let copy_sectors = (0..copy_count.min(5))
            .map(|i| u64::from_le_bytes(p[8 + i * 8..16 + i * 8].try_into().unwrap()))
            .collect();
        let placement = PlacementDescriptor { strategy, copy_sectors };

        let s = &buf[REMAP_SNAPSHOT_START..FOOTER_START];
        let count = u32::from_le_bytes(s[0..4].try_into().unwrap()) as usize;
        let count = count.min(MAX_EMBEDDED_ENTRIES);
        let mut remap_entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 4 + i * ENTRY_LEN;
            remap_entries.push(RemapEntry {
                main_sector: u64::from_le_bytes(s[off..off + 8].try_into().unwrap()),
                spare_sector: u64::from_le_bytes(s[off + 8..off + 16].try_into().unwrap()),
                length_sectors: u32::from_le_bytes(s[off + 16..off + 20].try_into().unwrap()),
                created_ns: u64::from_le_bytes(s[off + 20..off + 28].try_into().unwrap()),
                error_count: u32::from_le_bytes(s[off + 28..off + 32].try_into().unwrap()),
                flags: u32::from_le_bytes(s[off + 32..off + 36].try_into().unwrap()),
            });
        }

        Ok(MetadataRecord {
            monotonic_sequence,
            copy_index,
            timestamp_ns,
            main_fingerprint,
            spare_fingerprint,
            target_configuration,
            placement,
            remap_entries,
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fingerprint(tag: &str) -> DeviceFingerprint {
        DeviceFingerprint {
            uuid: Uuid::new_v4(),
            path: format!("/dev/{tag}"),
            size_sectors: 1_000_000,
            sector_size: 512,
            model_serial_hash: 0xdead_beef,
        }
    }

    fn sample_record() -> MetadataRecord {
        MetadataRecord {
            monotonic_sequence: 42,
            copy_index: 1,
            timestamp_ns: 123_456_789,
            main_fingerprint: sample_fingerprint("main"),
            spare_fingerprint: sample_fingerprint("spare"),
            target_configuration: TargetConfiguration {
                params: "0 1000000 dm-remap-v4 /dev/main /dev/spare".into(),
                target_size_sectors: 1_000_000,
                allocation_unit_sectors: 8,
            },
            placement: PlacementDescriptor::select(32768).unwrap(),
            remap_entries: vec![RemapEntry {
                main_sector: 50000,
                spare_sector: 0,
                length_sectors: 8,
                created_ns: 99,
                error_count: 1,
                flags: 0,
            }],
            truncated: false,
        }
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let record = sample_record();
        let encoded = record.encode();
        let decoded = MetadataRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn corrupted_byte_fails_crc() {
        let record = sample_record();
        let mut encoded = record.encode();
        encoded[500] ^= 0xFF;
        assert!(MetadataRecord::decode(&encoded).is_err());
    }

    #[test]
    fn unknown_version_is_refused() {
        let record = sample_record();
        let mut encoded = record.encode();
        encoded[4..8].copy_from_slice(&99u32.to_le_bytes());
        let err = MetadataRecord::decode(&encoded).unwrap_err();
        assert!(matches!(err, RemapError::Codec(_)));
    }

    #[test]
    fn placement_strategy_by_size() {
        assert_eq!(
            PlacementDescriptor::select(40).unwrap_err().to_string().contains("too small"),
            true
        );
        assert_eq!(
            PlacementDescriptor::select(100).unwrap().strategy,
            PlacementStrategyKind::Minimal
        );
        assert_eq!(
            PlacementDescriptor::select(2000).unwrap().strategy,
            PlacementStrategyKind::Linear
        );
        let geo = PlacementDescriptor::select(32768).unwrap();
        assert_eq!(geo.strategy, PlacementStrategyKind::Geometric);
        assert_eq!(geo.sectors(), &[0, 1024, 2048, 4096, 8192]);
    }

    #[test]
    fn embedded_entry_cap_is_reasonable() {
        assert!(MAX_EMBEDDED_ENTRIES >= 32);
    }
}
