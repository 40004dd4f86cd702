//! Locates the full-size JPEG preview inside a CR2. Canon stores it as the
//! strip data of IFD0, so the byte range follows from the TIFF header walk
//! alone: StripOffsets (0x0111) and StripByteCounts (0x0117) of the first
//! directory.

use std::ops::Range;

const TAG_STRIP_OFFSETS: u16 = 0x0111;
const TAG_STRIP_BYTE_COUNTS: u16 = 0x0117;

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, b: &[u8], off: usize) -> Option<u16> {
        let raw: [u8; 2] = b.get(off..off + 2)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    fn u32(self, b: &[u8], off: usize) -> Option<u32> {
        let raw: [u8; 4] = b.get(off..off + 4)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }
}

/// Returns the byte range of the embedded preview, or `None` when the file
/// is not a TIFF container or the strip tags are missing or out of bounds.
pub(crate) fn embedded_preview_range(data: &[u8]) -> Option<Range<usize>> {
    let endian = match data.get(0..4)? {
        [0x49, 0x49, 0x2a, 0x00] => Endian::Little,
        [0x4d, 0x4d, 0x00, 0x2a] => Endian::Big,
        _ => return None,
    };
    let ifd0 = endian.u32(data, 4)? as usize;
    let entry_count = endian.u16(data, ifd0)? as usize;

    let mut offset = None;
    let mut length = None;
    for i in 0..entry_count {
        let base = ifd0 + 2 + i * 12;
        let tag = endian.u16(data, base)?;
        if tag != TAG_STRIP_OFFSETS && tag != TAG_STRIP_BYTE_COUNTS {
            continue;
        }
        let ty = endian.u16(data, base + 2)?;
        let count = endian.u32(data, base + 4)?;
        // the preview is a single strip; multi-strip IFD0 means this is
        // not the layout we know
        if count != 1 {
            return None;
        }
        let value = match ty {
            3 => u32::from(endian.u16(data, base + 8)?),
            4 => endian.u32(data, base + 8)?,
            _ => return None,
        } as usize;
        if tag == TAG_STRIP_OFFSETS {
            offset = Some(value);
        } else {
            length = Some(value);
        }
    }

    let (offset, length) = (offset?, length?);
    let end = offset.checked_add(length)?;
    if length == 0 || end > data.len() {
        return None;
    }
    // the range must hold a JPEG stream
    if data.get(offset..offset + 2)? != [0xff, 0xd8] {
        return None;
    }
    Some(offset..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal little-endian CR2-shaped container: TIFF header, one IFD
    /// with the two strip tags, and a JPEG payload at the recorded offset.
    pub(crate) fn synthetic_cr2(jpeg: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x49, 0x49, 0x2a, 0x00]);
        out.extend_from_slice(&16u32.to_le_bytes()); // IFD0 offset
        out.extend_from_slice(&[b'C', b'R', 0x02, 0x00]);
        out.extend_from_slice(&[0, 0, 0, 0]); // pad to offset 16

        let ifd_len = 2 + 2 * 12 + 4;
        let payload_off = (16 + ifd_len) as u32;
        out.extend_from_slice(&2u16.to_le_bytes());
        for (tag, value) in [
            (TAG_STRIP_OFFSETS, payload_off),
            (TAG_STRIP_BYTE_COUNTS, jpeg.len() as u32),
        ] {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&4u16.to_le_bytes()); // LONG
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(jpeg);
        out
    }

    #[test]
    fn finds_the_preview_strip() {
        let jpeg = [0xff, 0xd8, 0xff, 0xd9];
        let cr2 = synthetic_cr2(&jpeg);
        let range = embedded_preview_range(&cr2).unwrap();
        assert_eq!(&cr2[range], &jpeg);
    }

    #[test]
    fn rejects_truncated_and_non_jpeg_payloads() {
        let jpeg = [0xff, 0xd8, 0xff, 0xd9];
        let mut truncated = synthetic_cr2(&jpeg);
        truncated.truncate(truncated.len() - 2);
        assert_eq!(embedded_preview_range(&truncated), None);

        let not_jpeg = synthetic_cr2(&[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(embedded_preview_range(&not_jpeg), None);

        assert_eq!(embedded_preview_range(b"plainly not a tiff"), None);
    }
}
