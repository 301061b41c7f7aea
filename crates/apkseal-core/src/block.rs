//! Reader/writer for the signing-block container.
//!
//! The block sits between the last content byte and the central directory:
//!
//! ```text
//! u64 size_a                         total size, excluding this field
//! { u64 entry_len, u32 entry_id, (entry_len - 4) bytes value }*
//! u64 size_b                         must equal size_a
//! 16-byte magic
//! ```
//!
//! Entry ids the engine knows about are listed below; anything else is
//! opaque pass-through owned by some other signer's tooling.

use crate::error::{Result, SealError};

/// Trailer magic of the signing block.
pub const BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";

/// Entry id of the v2 scheme.
pub const V2_BLOCK_ID: u32 = 0x7109_871a;
/// Entry id of the v3 scheme.
pub const V3_BLOCK_ID: u32 = 0xf053_68c0;
/// Entry id of the v3.1 targeted-rotation scheme.
pub const V31_BLOCK_ID: u32 = 0x1b93_ad61;
/// Entry id of the source-stamp block.
pub const SOURCE_STAMP_BLOCK_ID: u32 = 0x6dff_800d;
/// Entry id of the zero-filled padding entry.
pub const PADDING_BLOCK_ID: u32 = 0x4272_6577;

/// Default boundary the byte after the block is aligned to when alignment
/// is requested.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// One id/value pair inside the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// 32-bit entry identifier.
    pub id: u32,
    /// Opaque value bytes.
    pub value: Vec<u8>,
}

impl BlockEntry {
    /// Convenience constructor.
    pub fn new(id: u32, value: Vec<u8>) -> Self {
        Self { id, value }
    }
}

/// A parsed signing block: ordered entries plus its position in the
/// containing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningBlock {
    /// Entries in on-disk order.
    pub entries: Vec<BlockEntry>,
    /// Offset of the block's first byte in the parsed buffer.
    pub offset: usize,
    /// Total on-disk size of the block, including both size fields and the
    /// magic.
    pub size: usize,
}

impl SigningBlock {
    /// Locate and parse the signing block inside `buf` by scanning backward
    /// from the end for the trailer magic.
    ///
    /// `buf` is typically everything up to the central directory. The block
    /// need not end exactly at `buf`'s end; the last magic occurrence wins,
    /// matching how verifiers find the block from the central-directory
    /// offset.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let magic_pos = rfind_magic(buf)
            .ok_or_else(|| SealError::Malformed("signing block magic not found".into()))?;
        if magic_pos < 8 + 8 {
            return Err(SealError::Malformed("signing block trailer truncated".into()));
        }
        let size_b = read_u64(buf, magic_pos - 8);
        let total = usize::try_from(size_b)
            .map_err(|_| SealError::Malformed("signing block size overflow".into()))?;
        // size fields exclude the leading size_a field itself.
        let block_end = magic_pos + BLOCK_MAGIC.len();
        let Some(offset) = total
            .checked_add(8)
            .and_then(|with_size_a| block_end.checked_sub(with_size_a))
        else {
            return Err(SealError::Malformed(
                "declared signing block size exceeds available bytes".into(),
            ));
        };
        let size_a = read_u64(buf, offset);
        if size_a != size_b {
            return Err(SealError::Malformed(format!(
                "signing block size fields disagree: {size_a} != {size_b}"
            )));
        }

        let mut entries = Vec::new();
        let mut pos = offset + 8;
        let entries_end = magic_pos - 8;
        while pos < entries_end {
            if entries_end - pos < 12 {
                return Err(SealError::Malformed("truncated signing block entry".into()));
            }
            let entry_len = read_u64(buf, pos);
            let entry_len = usize::try_from(entry_len)
                .map_err(|_| SealError::Malformed("entry length overflow".into()))?;
            if entry_len < 4 || entry_len > entries_end - pos - 8 {
                return Err(SealError::Malformed(format!(
                    "entry length {entry_len} does not fit remaining {} bytes",
                    entries_end - pos - 8
                )));
            }
            let id = read_u32(buf, pos + 8);
            let value = buf[pos + 12..pos + 8 + entry_len].to_vec();
            entries.push(BlockEntry { id, value });
            pos += 8 + entry_len;
        }
        if pos != entries_end {
            return Err(SealError::Malformed("entry walk overran the trailer".into()));
        }

        Ok(Self {
            entries,
            offset,
            size: total + 8,
        })
    }

    /// Value of the entry with `id`.
    pub fn find(&self, id: u32) -> Result<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.value.as_slice())
            .ok_or(SealError::SignatureNotFound(id))
    }
}

/// Serialize `entries` into a complete block.
///
/// When `align` is set, a zero-filled padding entry is inserted first so
/// the byte following the block lands on the boundary, given the block
/// starts at `block_offset` in the output package.
pub fn serialize(entries: &[BlockEntry], block_offset: usize, align: Option<usize>) -> Vec<u8> {
    let mut body = Vec::new();
    let payload: usize = entries.iter().map(|e| 8 + 4 + e.value.len()).sum();

    if let Some(alignment) = align {
        let alignment = if alignment == 0 { DEFAULT_ALIGNMENT } else { alignment };
        // Unpadded on-disk size: size_a + entries + padding? + size_b + magic.
        let unpadded = 8 + payload + 8 + BLOCK_MAGIC.len();
        let end = block_offset + unpadded;
        let slack = (alignment - end % alignment) % alignment;
        if slack != 0 {
            // The padding entry header is 12 bytes; grow into the next
            // boundary when the slack cannot hold it.
            let pad_total = if slack < 12 { slack + alignment } else { slack };
            let pad_value = vec![0u8; pad_total - 12];
            put_entry(&mut body, PADDING_BLOCK_ID, &pad_value);
        }
    }
    for entry in entries {
        put_entry(&mut body, entry.id, &entry.value);
    }

    let total = (body.len() + 8 + BLOCK_MAGIC.len()) as u64;
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(BLOCK_MAGIC);
    out
}

/// Entries carried over from a previously-signed package when the
/// "preserve other signers' signatures" policy is active.
///
/// Padding is always superseded by the fresh block's own padding, and the
/// source-stamp entry goes stale the moment entry digests change, so both
/// are dropped here and rebuilt. Every other foreign id passes through
/// byte-for-byte.
pub fn carryover_entries(existing: &[BlockEntry], regenerated_ids: &[u32]) -> Vec<BlockEntry> {
    existing
        .iter()
        .filter(|e| {
            e.id != PADDING_BLOCK_ID
                && e.id != SOURCE_STAMP_BLOCK_ID
                && !regenerated_ids.contains(&e.id)
        })
        .cloned()
        .collect()
}

fn put_entry(out: &mut Vec<u8>, id: u32, value: &[u8]) {
    out.extend_from_slice(&((4 + value.len()) as u64).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(value);
}

fn rfind_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < BLOCK_MAGIC.len() {
        return None;
    }
    (0..=buf.len() - BLOCK_MAGIC.len())
        .rev()
        .find(|&i| &buf[i..i + BLOCK_MAGIC.len()] == BLOCK_MAGIC)
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(buf[pos..pos + 8].try_into().expect("8-byte slice"))
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(buf[pos..pos + 4].try_into().expect("4-byte slice"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<BlockEntry> {
        vec![
            BlockEntry::new(V2_BLOCK_ID, vec![1, 2, 3, 4]),
            BlockEntry::new(V3_BLOCK_ID, vec![5; 100]),
            BlockEntry::new(0x7e57_c0de, vec![9; 7]),
        ]
    }

    #[test]
    fn round_trip_preserves_entries_and_order() {
        let entries = sample_entries();
        let bytes = serialize(&entries, 0, None);
        let block = SigningBlock::parse(&bytes).unwrap();
        assert_eq!(block.entries, entries);
        assert_eq!(block.offset, 0);
        assert_eq!(block.size, bytes.len());
    }

    #[test]
    fn parse_finds_block_with_leading_content() {
        let entries = sample_entries();
        let mut buf = vec![0xaa; 321];
        buf.extend_from_slice(&serialize(&entries, 321, None));
        let block = SigningBlock::parse(&buf).unwrap();
        assert_eq!(block.offset, 321);
        assert_eq!(block.entries, entries);
    }

    #[test]
    fn alignment_pads_block_end_to_boundary() {
        for offset in [0usize, 1, 100, 4095, 5000] {
            let bytes = serialize(&sample_entries(), offset, Some(DEFAULT_ALIGNMENT));
            assert_eq!((offset + bytes.len()) % DEFAULT_ALIGNMENT, 0, "offset={offset}");
            let block = SigningBlock::parse(&bytes).unwrap();
            assert_eq!(block.entries[0].id, PADDING_BLOCK_ID);
        }
    }

    #[test]
    fn find_missing_id_is_signature_not_found() {
        let bytes = serialize(&sample_entries(), 0, None);
        let block = SigningBlock::parse(&bytes).unwrap();
        assert!(block.find(V2_BLOCK_ID).is_ok());
        assert!(matches!(
            block.find(V31_BLOCK_ID),
            Err(SealError::SignatureNotFound(V31_BLOCK_ID))
        ));
    }

    #[test]
    fn mismatched_size_fields_are_malformed() {
        let mut bytes = serialize(&sample_entries(), 0, None);
        bytes[0] ^= 0x01; // corrupt size_a
        assert!(matches!(
            SigningBlock::parse(&bytes),
            Err(SealError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_entry_length_is_malformed() {
        let mut bytes = serialize(&sample_entries(), 0, None);
        // First entry length field sits right after size_a.
        bytes[8] = 0xff;
        assert!(matches!(
            SigningBlock::parse(&bytes),
            Err(SealError::Malformed(_))
        ));
    }

    #[test]
    fn huge_size_field_is_malformed() {
        // A trailer whose size field dwarfs the buffer must be rejected,
        // not arithmetic-overflow.
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(BLOCK_MAGIC);
        assert!(matches!(
            SigningBlock::parse(&bytes),
            Err(SealError::Malformed(_))
        ));
    }

    #[test]
    fn missing_magic_is_malformed() {
        assert!(matches!(
            SigningBlock::parse(&[0u8; 64]),
            Err(SealError::Malformed(_))
        ));
    }

    #[test]
    fn carryover_drops_padding_stamp_and_regenerated() {
        let existing = vec![
            BlockEntry::new(V2_BLOCK_ID, vec![1]),
            BlockEntry::new(PADDING_BLOCK_ID, vec![0; 50]),
            BlockEntry::new(SOURCE_STAMP_BLOCK_ID, vec![2]),
            BlockEntry::new(0x7e57_c0de, vec![3]),
        ];
        let kept = carryover_entries(&existing, &[V2_BLOCK_ID]);
        assert_eq!(kept, vec![BlockEntry::new(0x7e57_c0de, vec![3])]);
    }

    #[test]
    fn unknown_ids_pass_through_serialization() {
        let entries = vec![BlockEntry::new(0x1234_5678, vec![0xab; 33])];
        let bytes = serialize(&entries, 0, None);
        let block = SigningBlock::parse(&bytes).unwrap();
        assert_eq!(block.entries, entries);
    }
}
