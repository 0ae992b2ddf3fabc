//! Varint encoding for packed fixup-location lists
//!
//! A code object that must survive relocation carries the offsets of every
//! fixup the memory manager has to re-apply. Offsets are sorted, delta-coded
//! and written as varints, which keeps the common case (a handful of nearby
//! call sites) to one byte per location.
//!
//! Format:
//! - count (varint)
//! - first offset (varint)
//! - each following offset as the distance from its predecessor (varint)

/// Encode a varint (variable-length integer) into the buffer
///
/// Uses 7 bits per byte, with high bit as continuation flag.
/// This encoding has no upper limit on the value.
pub fn encode_varint(buf: &mut Vec<u8>, mut n: u64) {
    while n >= 0x80 {
        buf.push((n as u8) | 0x80);
        n >>= 7;
    }
    buf.push(n as u8);
}

/// Decode a varint from a byte slice, returning (value, bytes_consumed)
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return None; // Overflow
        }
    }
    None // Incomplete
}

/// Pack a set of byte offsets. Duplicates collapse; order of the input is irrelevant.
pub fn pack_offsets(offsets: &[usize]) -> Vec<u8> {
    let mut sorted = offsets.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut buf = Vec::with_capacity(sorted.len() + 1);
    encode_varint(&mut buf, sorted.len() as u64);
    let mut prev = 0usize;
    for off in sorted {
        encode_varint(&mut buf, (off - prev) as u64);
        prev = off;
    }
    buf
}

/// Unpack offsets written by [`pack_offsets`], ascending.
///
/// Returns `None` for truncated or corrupt input. An empty slice decodes as
/// the empty list.
pub fn unpack_offsets(bytes: &[u8]) -> Option<Vec<usize>> {
    if bytes.is_empty() {
        return Some(Vec::new());
    }
    let (count, mut pos) = decode_varint(bytes)?;
    let mut out = Vec::with_capacity(count as usize);
    let mut prev = 0usize;
    for _ in 0..count {
        let (delta, consumed) = decode_varint(&bytes[pos..])?;
        pos += consumed;
        prev = prev.checked_add(delta as usize)?;
        out.push(prev);
    }
    if pos != bytes.len() {
        return None;
    }
    Some(out)
}
