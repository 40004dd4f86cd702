//! Maker-note access for the vendor fields the browser consumes: Canon's
//! thumbnail valid area, lens model and AF point grid, and Sony's preview
//! image size. Both vendors store a plain TIFF IFD whose value offsets are
//! relative to the EXIF TIFF header, so parsing works on the full TIFF block
//! plus the note's offset within it.

use crate::geometry::{Rect, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn of_tiff(tiff: &[u8]) -> Option<Endian> {
        match tiff.get(0..2)? {
            b"II" => Some(Endian::Little),
            b"MM" => Some(Endian::Big),
            _ => None,
        }
    }

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

    fn i16(self, b: &[u8], off: usize) -> Option<i16> {
        self.u16(b, off).map(|v| v as i16)
    }
}

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_ASCII: u16 = 2;

fn type_size(ty: u16) -> usize {
    match ty {
        1 | 2 | 6 | 7 => 1,
        3 | 8 => 2,
        4 | 9 | 11 => 4,
        5 | 10 | 12 => 8,
        _ => 0,
    }
}

struct IfdEntry {
    tag: u16,
    ty: u16,
    count: u32,
    value_off: usize,
}

/// Walks one IFD, resolving each entry's value location. Inline values
/// (≤4 bytes) live in the entry itself, larger ones behind an offset
/// relative to the TIFF header.
fn read_ifd(tiff: &[u8], ifd_off: usize, endian: Endian) -> Vec<IfdEntry> {
    let mut entries = Vec::new();
    let Some(count) = endian.u16(tiff, ifd_off) else {
        return entries;
    };
    for i in 0..count as usize {
        let base = ifd_off + 2 + i * 12;
        let (Some(tag), Some(ty), Some(n)) = (
            endian.u16(tiff, base),
            endian.u16(tiff, base + 2),
            endian.u32(tiff, base + 4),
        ) else {
            break;
        };
        let byte_len = type_size(ty).saturating_mul(n as usize);
        let value_off = if byte_len <= 4 {
            base + 8
        } else {
            match endian.u32(tiff, base + 8) {
                Some(off) => off as usize,
                None => break,
            }
        };
        entries.push(IfdEntry {
            tag,
            ty,
            count: n,
            value_off,
        });
    }
    entries
}

fn shorts(tiff: &[u8], entry: &IfdEntry, endian: Endian) -> Option<Vec<u16>> {
    if entry.ty != TYPE_SHORT {
        return None;
    }
    (0..entry.count as usize)
        .map(|i| endian.u16(tiff, entry.value_off + i * 2))
        .collect()
}

fn longs(tiff: &[u8], entry: &IfdEntry, endian: Endian) -> Option<Vec<u32>> {
    if entry.ty != TYPE_LONG {
        return None;
    }
    (0..entry.count as usize)
        .map(|i| endian.u32(tiff, entry.value_off + i * 4))
        .collect()
}

fn ascii(tiff: &[u8], entry: &IfdEntry) -> Option<String> {
    if entry.ty != TYPE_ASCII {
        return None;
    }
    let raw = tiff.get(entry.value_off..entry.value_off + entry.count as usize)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let s = String::from_utf8_lossy(&raw[..end]).trim().to_string();
    (!s.is_empty()).then_some(s)
}

/// Status of one autofocus point in the AF overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfPointStatus {
    Disabled,
    Normal,
    Selected,
    HasFocus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AfPoint {
    pub rect: Rect,
    pub status: AfPointStatus,
}

/// AF point grid plus the reference frame its coordinates live in.
#[derive(Debug, Clone, PartialEq)]
pub struct AfOverlay {
    pub frame: Size,
    pub points: Vec<AfPoint>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonNotes {
    /// Exif.Canon.ThumbnailImageValidArea: the non-letterboxed part of the
    /// embedded thumbnail, stored as x1, x2, y1, y2.
    pub thumbnail_valid_area: Option<Rect>,
    pub lens_model: Option<String>,
    pub af_overlay: Option<AfOverlay>,
}

const CANON_TAG_THUMBNAIL_VALID_AREA: u16 = 0x0013;
const CANON_TAG_AF_INFO2: u16 = 0x0026;
const CANON_TAG_LENS_MODEL: u16 = 0x0095;

pub fn parse_canon(tiff: &[u8], note_offset: usize, endian: Endian) -> Option<CanonNotes> {
    let entries = read_ifd(tiff, note_offset, endian);
    if entries.is_empty() {
        return None;
    }

    let mut notes = CanonNotes::default();
    for entry in &entries {
        match entry.tag {
            CANON_TAG_THUMBNAIL_VALID_AREA => {
                if let Some(v) = shorts(tiff, entry, endian) {
                    if let [x1, x2, y1, y2] = v[..] {
                        if x2 > x1 && y2 > y1 {
                            notes.thumbnail_valid_area = Some(Rect::new(
                                u32::from(x1),
                                u32::from(y1),
                                u32::from(x2 - x1),
                                u32::from(y2 - y1),
                            ));
                        }
                    }
                }
            }
            CANON_TAG_LENS_MODEL => notes.lens_model = ascii(tiff, entry),
            CANON_TAG_AF_INFO2 => notes.af_overlay = parse_af_info2(tiff, entry, endian),
            _ => {}
        }
    }

    (notes != CanonNotes::default()).then_some(notes)
}

/// Canon AFInfo2 layout: size, area mode, point count N, valid count,
/// canvas width/height, image width/height, then N widths, N heights,
/// N x positions, N y positions and two ceil(N/16)-word bitmasks for
/// in-focus and selected points. Positions are center-origin with y up.
fn parse_af_info2(tiff: &[u8], entry: &IfdEntry, endian: Endian) -> Option<AfOverlay> {
    if entry.ty != TYPE_SHORT || entry.count < 8 {
        return None;
    }
    let word = |i: usize| endian.i16(tiff, entry.value_off + i * 2);
    let uword = |i: usize| endian.u16(tiff, entry.value_off + i * 2);

    let n = uword(2)? as usize;
    let valid = uword(3)? as usize;
    let canvas_w = uword(4)?;
    let canvas_h = uword(5)?;
    if n == 0 || canvas_w == 0 || canvas_h == 0 {
        return None;
    }
    let mask_words = n.div_ceil(16);
    if (entry.count as usize) < 8 + 4 * n + 2 * mask_words {
        return None;
    }

    let bit = |mask_base: usize, idx: usize| -> Option<bool> {
        let w = uword(mask_base + idx / 16)?;
        Some(w & (1 << (idx % 16)) != 0)
    };

    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let w = word(8 + i)?.unsigned_abs() as u32;
        let h = word(8 + n + i)?.unsigned_abs() as u32;
        let x = word(8 + 2 * n + i)?;
        let y = word(8 + 3 * n + i)?;

        // center-origin, y up -> top-left origin, y down
        let cx = i64::from(canvas_w) / 2 + i64::from(x);
        let cy = i64::from(canvas_h) / 2 - i64::from(y);
        let left = (cx - i64::from(w) / 2).clamp(0, i64::from(canvas_w)) as u32;
        let top = (cy - i64::from(h) / 2).clamp(0, i64::from(canvas_h)) as u32;

        let in_focus = bit(8 + 4 * n, i)?;
        let selected = bit(8 + 4 * n + mask_words, i)?;
        let status = if i >= valid {
            AfPointStatus::Disabled
        } else if in_focus {
            AfPointStatus::HasFocus
        } else if selected {
            AfPointStatus::Selected
        } else {
            AfPointStatus::Normal
        };

        points.push(AfPoint {
            rect: Rect::new(left, top, w, h),
            status,
        });
    }

    Some(AfOverlay {
        frame: Size::new(u32::from(canvas_w), u32::from(canvas_h)),
        points,
    })
}

const SONY_TAG_PREVIEW_IMAGE_SIZE: u16 = 0xb02c;

/// Exif.Sony1.PreviewImageSize: two longs, height then width, of the
/// embedded preview frame. Newer bodies put the IFD directly at the note
/// offset, older ones behind a 12-byte "SONY DSC" header.
pub fn parse_sony_preview_size(tiff: &[u8], note_offset: usize, endian: Endian) -> Option<Size> {
    let ifd_off = if tiff.get(note_offset..note_offset + 4) == Some(b"SONY") {
        note_offset + 12
    } else {
        note_offset
    };
    let entries = read_ifd(tiff, ifd_off, endian);
    for entry in &entries {
        if entry.tag == SONY_TAG_PREVIEW_IMAGE_SIZE {
            if let Some(v) = longs(tiff, entry, endian) {
                if let [height, width] = v[..] {
                    if width > 0 && height > 0 {
                        return Some(Size::new(width, height));
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a little-endian IFD with the given entries at offset 0 of a
    /// synthetic TIFF block. Values longer than 4 bytes are appended behind
    /// the entry table.
    fn build_ifd(entries: &[(u16, u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        let table_len = 2 + entries.len() * 12 + 4;
        let mut tail: Vec<u8> = Vec::new();
        for (tag, ty, value) in entries {
            let unit = match ty {
                2 => 1,
                3 => 2,
                4 => 4,
                _ => 1,
            };
            let count = (value.len() / unit) as u32;
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&ty.to_le_bytes());
            out.extend_from_slice(&count.to_le_bytes());
            if value.len() <= 4 {
                let mut inline = value.clone();
                inline.resize(4, 0);
                out.extend_from_slice(&inline);
            } else {
                let off = (table_len + tail.len()) as u32;
                out.extend_from_slice(&off.to_le_bytes());
                tail.extend_from_slice(value);
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes()); // next-IFD pointer
        out.extend_from_slice(&tail);
        out
    }

    fn le_shorts(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn canon_thumbnail_valid_area_is_decoded() {
        let tiff = build_ifd(&[(
            CANON_TAG_THUMBNAIL_VALID_AREA,
            TYPE_SHORT,
            le_shorts(&[0, 160, 10, 110]),
        )]);
        let notes = parse_canon(&tiff, 0, Endian::Little).unwrap();
        assert_eq!(notes.thumbnail_valid_area, Some(Rect::new(0, 10, 160, 100)));
    }

    #[test]
    fn canon_lens_model_is_trimmed() {
        let mut value = b"EF24-70mm f/2.8L II USM".to_vec();
        value.push(0);
        let tiff = build_ifd(&[(CANON_TAG_LENS_MODEL, TYPE_ASCII, value)]);
        let notes = parse_canon(&tiff, 0, Endian::Little).unwrap();
        assert_eq!(notes.lens_model.as_deref(), Some("EF24-70mm f/2.8L II USM"));
    }

    #[test]
    fn af_info2_maps_points_into_the_canvas() {
        // one AF point, 60x40, centered, in focus and selected
        let mut words = vec![0u16, 2, 1, 1, 640, 480, 640, 480];
        words.extend_from_slice(&[60, 40, 0, 0]); // widths, heights, x, y
        words.push(0b1); // in focus
        words.push(0b1); // selected
        let tiff = build_ifd(&[(CANON_TAG_AF_INFO2, TYPE_SHORT, le_shorts(&words))]);
        let notes = parse_canon(&tiff, 0, Endian::Little).unwrap();
        let overlay = notes.af_overlay.unwrap();
        assert_eq!(overlay.frame, Size::new(640, 480));
        assert_eq!(overlay.points.len(), 1);
        assert_eq!(overlay.points[0].rect, Rect::new(290, 220, 60, 40));
        assert_eq!(overlay.points[0].status, AfPointStatus::HasFocus);
    }

    #[test]
    fn sony_preview_size_reads_height_then_width() {
        let mut value = Vec::new();
        value.extend_from_slice(&1080u32.to_le_bytes());
        value.extend_from_slice(&1616u32.to_le_bytes());
        let tiff = build_ifd(&[(SONY_TAG_PREVIEW_IMAGE_SIZE, TYPE_LONG, value)]);
        assert_eq!(
            parse_sony_preview_size(&tiff, 0, Endian::Little),
            Some(Size::new(1616, 1080))
        );
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_canon(&[0xff; 8], 0, Endian::Little), None);
        assert_eq!(parse_sony_preview_size(b"", 0, Endian::Big), None);
    }
}
