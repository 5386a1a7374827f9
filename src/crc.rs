//! CRC32 and fingerprint helpers used by the metadata codec and device identity checks.

use crc32fast::Hasher;

/// CRC32 (IEEE) of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Combine a device UUID, reported size, and an optional model/serial string into a
/// single fingerprint hash used to detect "wrong device attached" at reassembly.
pub fn device_fingerprint(uuid: &uuid::Uuid, size_sectors: u64, model_serial: &str) -> u64 {
    let mut buf = Vec::with_capacity(16 + 8 + model_serial.len());
    buf.extend_from_slice(uuid.as_bytes());
    buf.extend_from_slice(&size_sectors.to_le_bytes());
    buf.extend_from_slice(model_serial.as_bytes());
    let hash = blake3::hash(&buf);
    let bytes = hash.as_bytes();
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_is_stable() {
        let a = crc32(b"dm-remap");
        let b = crc32(b"dm-remap");
        assert_eq!(a, b);
        assert_ne!(a, crc32(b"dm-remap!"));
    }

    #[test]
    fn fingerprint_changes_with_size() {
        let id = uuid::Uuid::new_v4();
        let f1 = device_fingerprint(&id, 1000, "model-a");
        let f2 = device_fingerprint(&id, 2000, "model-a");
        assert_ne!(f1, f2);
    }
}
