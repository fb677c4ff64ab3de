//! In-band payload headers.
//!
//! Every payload stored in the data region starts with a fixed-width header
//! echoing the owning index entry's fingerprint and expiration. Reads
//! re-decode the header and cross-check it against the index entry; any
//! mismatch means the entry points at bytes that have since been lapped and
//! overwritten, and the lookup is treated as a miss. This is what lets the
//! data file go entirely unvalidated at open time.

/// Result of checking a payload header against its index entry.
pub(crate) enum PayloadStatus {
    /// The header matches the index entry; the payload bytes are intact.
    Valid,
    /// The header disagrees with the index entry: the payload was lapped by
    /// the write cursor and overwritten, or the entry is otherwise stale.
    Stale,
}

pub(crate) const PAYLOAD_HEADER_LEN: usize = 24;

/// Fixed-width header prefixed to every payload in the data region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PayloadHeader {
    pub fingerprint: u64,
    pub expiry: u64,
    pub key_size: u32,
    pub value_size: u32,
}

impl PayloadHeader {
    pub fn encode(&self) -> [u8; PAYLOAD_HEADER_LEN] {
        let mut buf = [0; PAYLOAD_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.fingerprint.to_le_bytes());
        buf[8..16].copy_from_slice(&self.expiry.to_le_bytes());
        buf[16..20].copy_from_slice(&self.key_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.value_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; PAYLOAD_HEADER_LEN]) -> Self {
        Self {
            fingerprint: u64::from_le_bytes(buf[0..8].try_into().expect("slice length is 8")),
            expiry: u64::from_le_bytes(buf[8..16].try_into().expect("slice length is 8")),
            key_size: u32::from_le_bytes(buf[16..20].try_into().expect("slice length is 4")),
            value_size: u32::from_le_bytes(buf[20..24].try_into().expect("slice length is 4")),
        }
    }

    /// Verifies that this header belongs to the index entry that pointed at
    /// it, including that the recorded sizes add up to the entry's length.
    pub fn verify(&self, fingerprint: u64, expiry: u64, payload_len: u64) -> PayloadStatus {
        let expected_len = total_payload_len(self.key_size as usize, self.value_size as usize);
        if self.fingerprint == fingerprint
            && self.expiry == expiry
            && expected_len == Some(payload_len)
        {
            PayloadStatus::Valid
        } else {
            PayloadStatus::Stale
        }
    }
}

/// Total bytes a payload occupies in the data region: header, key echo and
/// value. `None` when either size leaves the representable domain.
pub(crate) fn total_payload_len(key_size: usize, value_size: usize) -> Option<u64> {
    if u32::try_from(key_size).is_err() || u32::try_from(value_size).is_err() {
        return None;
    }
    Some(PAYLOAD_HEADER_LEN as u64 + key_size as u64 + value_size as u64)
}

#[cfg(test)]
mod tests {
    use super::{total_payload_len, PayloadHeader, PayloadStatus, PAYLOAD_HEADER_LEN};

    #[test]
    fn header_round_trip() {
        let header = PayloadHeader {
            fingerprint: 0xdead_beef_cafe_f00d,
            expiry: u64::MAX,
            key_size: 3,
            value_size: 6,
        };
        assert_eq!(header, PayloadHeader::decode(&header.encode()));
    }

    #[test]
    fn verify_rejects_foreign_entries() {
        let header = PayloadHeader {
            fingerprint: 7,
            expiry: 1000,
            key_size: 0,
            value_size: 8,
        };
        let len = PAYLOAD_HEADER_LEN as u64 + 8;

        assert!(matches!(header.verify(7, 1000, len), PayloadStatus::Valid));
        assert!(matches!(header.verify(8, 1000, len), PayloadStatus::Stale));
        assert!(matches!(header.verify(7, 999, len), PayloadStatus::Stale));
        assert!(matches!(
            header.verify(7, 1000, len + 1),
            PayloadStatus::Stale
        ));
    }

    #[test]
    fn oversized_dimensions_leave_the_domain() {
        assert!(total_payload_len(3, usize::MAX).is_none());
        assert!(total_payload_len(usize::MAX, 3).is_none());
        assert_eq!(
            total_payload_len(0, 0),
            Some(PAYLOAD_HEADER_LEN as u64)
        );
    }
}
