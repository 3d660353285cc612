//! ISO-BMFF box emission primitives.
//!
//! Boxes are appended to a byte vector: a four-byte size placeholder and
//! the fourcc go in first, the body closure runs, then the size is patched
//! to the distance between the box's first byte and the current cursor.
//! Full boxes additionally carry a version+flags word.

/// Append a 16-bit big-endian value.
pub fn push_u16(data: &mut Vec<u8>, n: u16) {
    data.extend_from_slice(&n.to_be_bytes());
}

/// Append a 32-bit big-endian value.
pub fn push_u32(data: &mut Vec<u8>, n: u32) {
    data.extend_from_slice(&n.to_be_bytes());
}

/// Append a 64-bit big-endian value.
pub fn push_u64(data: &mut Vec<u8>, n: u64) {
    data.extend_from_slice(&n.to_be_bytes());
}

/// Overwrite 4 bytes at `pos` with a 32-bit big-endian value.
pub fn patch_u32(data: &mut [u8], pos: usize, n: u32) {
    data[pos..pos + 4].copy_from_slice(&n.to_be_bytes());
}

/// Append a box: size placeholder, fourcc, body, then back-patch the size.
pub fn push_box(data: &mut Vec<u8>, fourcc: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = data.len();
    push_u32(data, 0);
    data.extend_from_slice(fourcc);
    body(data);
    let size = (data.len() - start) as u32;
    patch_u32(data, start, size);
}

/// Append a full box (version and flags packed into one 32-bit word).
pub fn push_full_box(
    data: &mut Vec<u8>,
    fourcc: &[u8; 4],
    version_flags: u32,
    body: impl FnOnce(&mut Vec<u8>),
) {
    push_box(data, fourcc, |data| {
        push_u32(data, version_flags);
        body(data);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_box_patches_size() {
        let mut data = Vec::new();
        push_box(&mut data, b"free", |d| d.extend_from_slice(&[1, 2, 3]));
        assert_eq!(data.len(), 11);
        assert_eq!(&data[0..4], &[0, 0, 0, 11]);
        assert_eq!(&data[4..8], b"free");
        assert_eq!(&data[8..], &[1, 2, 3]);
    }

    #[test]
    fn test_nested_boxes_size_covers_children() {
        let mut data = Vec::new();
        push_box(&mut data, b"moov", |d| {
            push_box(d, b"trak", |d| d.extend_from_slice(&[0; 4]));
            push_box(d, b"trak", |d| d.extend_from_slice(&[0; 2]));
        });
        // moov: 8 + (8 + 4) + (8 + 2) = 30
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 30);
        // first trak at offset 8
        assert_eq!(u32::from_be_bytes(data[8..12].try_into().unwrap()), 12);
        // second trak follows the first
        assert_eq!(u32::from_be_bytes(data[20..24].try_into().unwrap()), 10);
    }

    #[test]
    fn test_full_box_version_flags() {
        let mut data = Vec::new();
        push_full_box(&mut data, b"tfdt", 0x0100_0000, |d| push_u64(d, 42));
        assert_eq!(data.len(), 20);
        assert_eq!(&data[8..12], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&data[12..20], &42u64.to_be_bytes());
    }

    #[test]
    fn test_sibling_box_sizes_chain() {
        // The size of each box equals the distance to the start of the
        // next peer box.
        let mut data = Vec::new();
        push_box(&mut data, b"moof", |d| d.extend_from_slice(&[0; 16]));
        let first_size = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
        push_box(&mut data, b"mdat", |d| d.extend_from_slice(&[0; 8]));
        assert_eq!(&data[first_size + 4..first_size + 8], b"mdat");
    }
}
