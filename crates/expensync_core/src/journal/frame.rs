//! Journal framing.
//!
//! Each committed batch is one frame:
//!
//! ```text
//! | magic "EXJL" (4) | version u16 (2) | length u32 (4) | header crc32 (4) | payload | crc32 (4) |
//! ```
//!
//! The payload is the JSON encoding of a [`Batch`]. The header CRC covers
//! magic, version and length, so a damaged length is caught before it is
//! used. The trailing CRC covers every byte before it. Integers are
//! little-endian.

use super::batch::Batch;
use crate::error::{StoreError, StoreResult};

/// Magic bytes opening every frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"EXJL";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4) + header crc (4)
const HEADER_SIZE: usize = 14;
const HEADER_CRC_AT: usize = 10;
const CRC_SIZE: usize = 4;

/// Encodes a batch into a frame.
///
/// # Errors
///
/// Fails if the batch cannot be serialized or exceeds 4 GiB.
pub fn encode_frame(batch: &Batch) -> StoreResult<Vec<u8>> {
    let payload = serde_json::to_vec(batch)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::invalid_operation("journal batch too large"))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    let header_crc = compute_crc32(&frame);
    frame.extend_from_slice(&header_crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Result of scanning journal bytes.
#[derive(Debug)]
pub struct Scan {
    /// Complete, valid batches in order.
    pub batches: Vec<Batch>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Bytes of an incomplete trailing frame.
    pub torn_bytes: u64,
}

/// Parses every frame in `bytes`.
///
/// A trailing frame whose header is cut short, or whose verified header
/// declares more bytes than remain, is a torn write and is reported through
/// [`Scan::torn_bytes`]. Everything else that fails to parse is corruption:
/// bad magic, an unknown version, a header or body CRC mismatch, an
/// undecodable payload or a non-increasing sequence.
///
/// # Errors
///
/// Returns [`StoreError::JournalCorruption`] as described above.
pub fn scan(bytes: &[u8]) -> StoreResult<Scan> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            return Err(StoreError::journal_corruption(offset, "bad frame magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            return Err(StoreError::journal_corruption(
                offset,
                format!("unsupported frame version {version}"),
            ));
        }
        let header_crc = u32::from_le_bytes([rest[10], rest[11], rest[12], rest[13]]);
        if header_crc != compute_crc32(&rest[..HEADER_CRC_AT]) {
            return Err(StoreError::journal_corruption(offset, "frame header checksum mismatch"));
        }
        // Only trusted once the header checksum holds.
        let len = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            break;
        }

        let body_end = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let actual = compute_crc32(&rest[..body_end]);
        if stored != actual {
            return Err(StoreError::journal_corruption(
                offset,
                format!("checksum mismatch: expected {stored:08x}, got {actual:08x}"),
            ));
        }

        let batch: Batch = serde_json::from_slice(&rest[HEADER_SIZE..body_end]).map_err(|e| {
            StoreError::journal_corruption(offset, format!("undecodable batch: {e}"))
        })?;
        if let Some(prev) = batches.last() {
            if batch.sequence <= prev.sequence {
                return Err(StoreError::journal_corruption(
                    offset,
                    format!(
                        "sequence {} does not follow {}",
                        batch.sequence, prev.sequence
                    ),
                ));
            }
        }

        batches.push(batch);
        pos += total;
    }

    Ok(Scan {
        batches,
        valid_len: pos as u64,
        torn_bytes: (bytes.len() - pos) as u64,
    })
}

/// CRC-32 (IEEE) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::batch::BatchOp;

    fn batch(sequence: u64) -> Batch {
        Batch {
            sequence,
            ops: vec![BatchOp::Clear {
                collection: "expenses".into(),
            }],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scan_reads_consecutive_frames() {
        let mut bytes = encode_frame(&batch(1)).unwrap();
        bytes.extend(encode_frame(&batch(2)).unwrap());

        let scan = scan(&bytes).unwrap();
        assert_eq!(scan.batches, vec![batch(1), batch(2)]);
        assert_eq!(scan.valid_len, bytes.len() as u64);
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn torn_tail_is_reported_not_fatal() {
        let first = encode_frame(&batch(1)).unwrap();
        let second = encode_frame(&batch(2)).unwrap();
        for cut in [1, HEADER_SIZE - 1, HEADER_SIZE + 3, second.len() - 1] {
            let mut bytes = first.clone();
            bytes.extend_from_slice(&second[..cut]);

            let scan = scan(&bytes).unwrap();
            assert_eq!(scan.batches.len(), 1, "cut at {cut}");
            assert_eq!(scan.valid_len, first.len() as u64);
            assert_eq!(scan.torn_bytes, cut as u64);
        }
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let mut bytes = encode_frame(&batch(1)).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0x40;
        assert!(matches!(
            scan(&bytes),
            Err(StoreError::JournalCorruption { offset: 0, .. })
        ));
    }

    #[test]
    fn damaged_length_in_earlier_frame_is_corruption() {
        let mut bytes = encode_frame(&batch(1)).unwrap();
        bytes.extend(encode_frame(&batch(2)).unwrap());
        bytes.extend(encode_frame(&batch(3)).unwrap());
        // Length now points far past the end of the journal.
        bytes[9] ^= 0x7F;

        assert!(matches!(
            scan(&bytes),
            Err(StoreError::JournalCorruption { offset: 0, .. })
        ));
    }

    #[test]
    fn non_increasing_sequence_is_corruption() {
        let mut bytes = encode_frame(&batch(2)).unwrap();
        let second_offset = bytes.len() as u64;
        bytes.extend(encode_frame(&batch(2)).unwrap());

        match scan(&bytes) {
            Err(StoreError::JournalCorruption { offset, .. }) => assert_eq!(offset, second_offset),
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
