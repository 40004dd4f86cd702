use std::io::Cursor;

use chrono::NaiveDateTime;
use image::DynamicImage;
use tracing::debug;

use crate::geometry::{Rect, Size};

mod makernote;

pub use makernote::{AfOverlay, AfPoint, AfPointStatus};
use makernote::{CanonNotes, Endian};

/// EXIF orientation values 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Rotate90FlipHorizontal,
    Rotate90,
    Rotate270FlipHorizontal,
    Rotate270,
}

impl Orientation {
    pub fn from_exif_value(value: u32) -> Orientation {
        match value {
            2 => Orientation::FlipHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::FlipVertical,
            5 => Orientation::Rotate90FlipHorizontal,
            6 => Orientation::Rotate90,
            7 => Orientation::Rotate270FlipHorizontal,
            8 => Orientation::Rotate270,
            _ => Orientation::Normal,
        }
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Orientation::Rotate90
                | Orientation::Rotate270
                | Orientation::Rotate90FlipHorizontal
                | Orientation::Rotate270FlipHorizontal
        )
    }

    fn to_image_orientation(self) -> image::metadata::Orientation {
        use image::metadata::Orientation as O;
        match self {
            Orientation::Normal => O::NoTransforms,
            Orientation::FlipHorizontal => O::FlipHorizontal,
            Orientation::Rotate180 => O::Rotate180,
            Orientation::FlipVertical => O::FlipVertical,
            Orientation::Rotate90FlipHorizontal => O::Rotate90FlipH,
            Orientation::Rotate90 => O::Rotate90,
            Orientation::Rotate270FlipHorizontal => O::Rotate270FlipH,
            Orientation::Rotate270 => O::Rotate270,
        }
    }

    /// Applies this orientation to a decoded thumbnail or surface copy.
    pub fn apply(self, mut img: DynamicImage) -> DynamicImage {
        img.apply_orientation(self.to_image_orientation());
        img
    }
}

/// A shutter speed kept as the original rational so "1/250 s" survives
/// pretty printing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureTime {
    pub num: u32,
    pub denom: u32,
}

impl ExposureTime {
    pub fn seconds(&self) -> f64 {
        if self.denom == 0 {
            return 0.0;
        }
        f64::from(self.num) / f64::from(self.denom)
    }

    pub fn display(&self) -> String {
        if self.denom > 1 && self.num < self.denom {
            format!("{}/{} s", self.num, self.denom)
        } else {
            format!("{} s", self.seconds())
        }
    }
}

/// Parsed EXIF block of one file: the camera fields the model sorts and
/// sections by, the embedded thumbnail (already cropped and oriented) and
/// the Canon AF point overlay.
pub struct ExifMetadata {
    exif: exif::Exif,
    canon: Option<CanonNotes>,
    sony_preview_size: Option<Size>,
    thumbnail_payload: Option<Vec<u8>>,
}

const MAX_THUMBNAIL_PAYLOAD: usize = 1_000_000;

impl ExifMetadata {
    /// Parses the EXIF block out of a file's encoded bytes. Returns `None`
    /// when the file carries no (readable) EXIF data; images remain fully
    /// usable without it.
    pub fn from_file_bytes(data: &[u8]) -> Option<Self> {
        let exif = exif::Reader::new()
            .read_from_container(&mut Cursor::new(data))
            .ok()?;

        let tiff_base = locate_tiff_base(data);
        let tiff = tiff_base.and_then(|base| data.get(base..));

        let mut canon = None;
        let mut sony_preview_size = None;
        if let (Some(tiff), Some(field)) =
            (tiff, exif.get_field(exif::Tag::MakerNote, exif::In::PRIMARY))
        {
            if let exif::Value::Undefined(ref bytes, offset) = field.value {
                let offset = offset as usize;
                if let Some(endian) = Endian::of_tiff(tiff) {
                    canon = makernote::parse_canon(tiff, offset, endian);
                    if canon.is_none() {
                        sony_preview_size =
                            makernote::parse_sony_preview_size(tiff, offset, endian);
                    }
                }
                let _ = bytes;
            }
        }

        let thumbnail_payload = tiff.and_then(|tiff| {
            let offset = exif
                .get_field(exif::Tag::JPEGInterchangeFormat, exif::In::THUMBNAIL)?
                .value
                .get_uint(0)? as usize;
            let length = exif
                .get_field(exif::Tag::JPEGInterchangeFormatLength, exif::In::THUMBNAIL)?
                .value
                .get_uint(0)? as usize;
            if length == 0 || length > MAX_THUMBNAIL_PAYLOAD {
                return None;
            }
            tiff.get(offset..offset + length).map(<[u8]>::to_vec)
        });

        Some(Self {
            exif,
            canon,
            sony_preview_size,
            thumbnail_payload,
        })
    }

    fn uint(&self, tag: exif::Tag) -> Option<u32> {
        self.exif
            .get_field(tag, exif::In::PRIMARY)
            .and_then(|f| f.value.get_uint(0))
    }

    fn rational(&self, tag: exif::Tag) -> Option<exif::Rational> {
        match self.exif.get_field(tag, exif::In::PRIMARY)?.value {
            exif::Value::Rational(ref v) => v.first().copied(),
            _ => None,
        }
    }

    fn string(&self, tag: exif::Tag) -> Option<String> {
        match self.exif.get_field(tag, exif::In::PRIMARY)?.value {
            exif::Value::Ascii(ref v) => {
                let s = String::from_utf8_lossy(v.first()?).trim().to_string();
                (!s.is_empty()).then_some(s)
            }
            _ => None,
        }
    }

    pub fn orientation(&self) -> Orientation {
        Orientation::from_exif_value(self.uint(exif::Tag::Orientation).unwrap_or(1))
    }

    /// Image dimensions as recorded by the camera, transposed for rotated
    /// orientations.
    pub fn pixel_size(&self) -> Option<Size> {
        let w = self.uint(exif::Tag::PixelXDimension)?;
        let h = self.uint(exif::Tag::PixelYDimension)?;
        let size = Size::new(w, h);
        if !size.is_valid() {
            return None;
        }
        Some(if self.orientation().swaps_dimensions() {
            size.transposed()
        } else {
            size
        })
    }

    pub fn date_recorded(&self) -> Option<NaiveDateTime> {
        let raw = self.string(exif::Tag::DateTimeOriginal)?;
        NaiveDateTime::parse_from_str(&raw, "%Y:%m:%d %H:%M:%S").ok()
    }

    pub fn aperture(&self) -> Option<f64> {
        let r = self.rational(exif::Tag::FNumber)?;
        (r.denom != 0).then(|| r.to_f64())
    }

    pub fn exposure_time(&self) -> Option<ExposureTime> {
        let r = self.rational(exif::Tag::ExposureTime)?;
        (r.denom != 0).then_some(ExposureTime {
            num: r.num,
            denom: r.denom,
        })
    }

    pub fn iso(&self) -> Option<i64> {
        self.uint(exif::Tag::PhotographicSensitivity)
            .map(i64::from)
    }

    pub fn focal_length(&self) -> Option<f64> {
        let r = self.rational(exif::Tag::FocalLength)?;
        (r.denom != 0).then(|| r.to_f64())
    }

    pub fn lens(&self) -> Option<String> {
        self.string(exif::Tag::LensModel)
            .or_else(|| self.canon.as_ref()?.lens_model.clone())
    }

    pub fn camera_model(&self) -> Option<String> {
        self.string(exif::Tag::Model)
    }

    pub fn af_overlay(&self) -> Option<&AfOverlay> {
        self.canon.as_ref()?.af_overlay.as_ref()
    }

    fn dots_per_meter(&self, tag: exif::Tag) -> Option<u32> {
        let unit = self.uint(exif::Tag::ResolutionUnit).unwrap_or(2);
        let res = self.rational(tag)?;
        if res.denom == 0 {
            return None;
        }
        let value = res.to_f64();
        // 2 = inches (the default), 3 = centimeters
        let dpm = match unit {
            3 => value * 100.0,
            _ => value * (100.0 / 2.54),
        };
        (dpm > 0.0).then(|| dpm.round() as u32)
    }

    pub fn dots_per_meter_x(&self) -> Option<u32> {
        self.dots_per_meter(exif::Tag::XResolution)
    }

    pub fn dots_per_meter_y(&self) -> Option<u32> {
        self.dots_per_meter(exif::Tag::YResolution)
    }

    /// The embedded thumbnail, cropped to its valid area and oriented.
    ///
    /// Canon bodies letterbox the thumbnail and record the usable rect;
    /// Sony bodies record only the preview frame size, from which the
    /// black-bar height is derived. Everything else is used as stored.
    pub fn thumbnail(&self) -> Option<DynamicImage> {
        let payload = self.thumbnail_payload.as_deref()?;
        let mut img = decode_thumbnail_payload(payload)?;

        if let Some(area) = self.canon.as_ref().and_then(|c| c.thumbnail_valid_area) {
            let bounds = Rect::new(0, 0, img.width(), img.height());
            let area = area.intersected(bounds);
            if !area.is_empty() {
                img = img.crop_imm(area.x, area.y, area.width, area.height);
            }
        } else if let Some(preview) = self.sony_preview_size {
            if let Some(area) = sony_valid_area(Size::new(img.width(), img.height()), preview) {
                img = img.crop_imm(area.x, area.y, area.width, area.height);
            }
        }

        Some(self.orientation().apply(img))
    }
}

/// The thumbnail only needs to be cropped vertically: derive the valid
/// height from the preview's aspect ratio and split the black bars evenly
/// between top and bottom.
fn sony_valid_area(thumb: Size, preview: Size) -> Option<Rect> {
    if !thumb.is_valid() || !preview.is_valid() {
        return None;
    }
    let scale = f64::from(preview.width) / f64::from(thumb.width);
    if scale <= 0.0 {
        return None;
    }
    let valid_height = (f64::from(preview.height) / scale).ceil() as u32;
    if valid_height == 0 || valid_height >= thumb.height {
        return None;
    }
    let offset_top = (thumb.height - valid_height) / 2;
    Some(Rect::new(0, offset_top, thumb.width, valid_height))
}

fn decode_thumbnail_payload(payload: &[u8]) -> Option<DynamicImage> {
    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(payload));
    let pixels = match decoder.decode() {
        Ok(p) => p,
        Err(e) => {
            debug!("embedded thumbnail decode failed: {e}");
            return None;
        }
    };
    let info = decoder.info()?;
    let w = u32::from(info.width);
    let h = u32::from(info.height);
    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            image::RgbImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8)
        }
        jpeg_decoder::PixelFormat::L8 => {
            image::GrayImage::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8)
        }
        other => {
            debug!("embedded thumbnail has unsupported pixel format {other:?}");
            None
        }
    }
}

/// Finds the EXIF TIFF header inside the encoded file: offset 0 for TIFF
/// containers (including CR2), behind the APP1 `Exif\0\0` preamble for
/// JPEG.
fn locate_tiff_base(data: &[u8]) -> Option<usize> {
    match data.get(0..4)? {
        [0x49, 0x49, 0x2a, 0x00] | [0x4d, 0x4d, 0x00, 0x2a] => return Some(0),
        _ => {}
    }
    if data.get(0..2) != Some(&[0xff, 0xd8]) {
        return None;
    }

    let mut pos = 2usize;
    while pos + 4 <= data.len() {
        if data[pos] != 0xff {
            return None;
        }
        let marker = data[pos + 1];
        // standalone markers have no length word
        if (0xd0..=0xd9).contains(&marker) {
            pos += 2;
            continue;
        }
        let len = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        if len < 2 {
            return None;
        }
        let payload = pos + 4;
        if marker == 0xe1 && data.get(payload..payload + 6) == Some(b"Exif\0\0") {
            return Some(payload + 6);
        }
        if marker == 0xda {
            // start of scan, no more headers
            return None;
        }
        pos += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_mapping_and_transpose() {
        assert_eq!(Orientation::from_exif_value(1), Orientation::Normal);
        assert_eq!(Orientation::from_exif_value(6), Orientation::Rotate90);
        assert_eq!(Orientation::from_exif_value(99), Orientation::Normal);
        assert!(Orientation::Rotate270.swaps_dimensions());
        assert!(!Orientation::Rotate180.swaps_dimensions());
    }

    #[test]
    fn exposure_display_uses_the_rational() {
        let e = ExposureTime { num: 1, denom: 250 };
        assert_eq!(e.display(), "1/250 s");
        assert!((e.seconds() - 0.004).abs() < 1e-9);
        let long = ExposureTime { num: 30, denom: 1 };
        assert_eq!(long.display(), "30 s");
    }

    #[test]
    fn sony_crop_splits_black_bars_evenly() {
        // thumbnail 160x120, preview 1616x1080 -> valid height 107, bars split 6/7
        let area = sony_valid_area(Size::new(160, 120), Size::new(1616, 1080)).unwrap();
        assert_eq!(area, Rect::new(0, 6, 160, 107));
        assert_eq!(
            sony_valid_area(Size::new(160, 107), Size::new(1616, 1080)),
            None
        );
    }

    #[test]
    fn tiff_base_of_containers() {
        assert_eq!(locate_tiff_base(&[0x49, 0x49, 0x2a, 0x00, 0, 0]), Some(0));
        assert_eq!(locate_tiff_base(&[0x4d, 0x4d, 0x00, 0x2a]), Some(0));

        let mut jpeg = vec![0xff, 0xd8];
        jpeg.extend_from_slice(&[0xff, 0xe0, 0x00, 0x04, 0x00, 0x00]); // APP0
        let exif_payload = b"Exif\0\0II*\0";
        jpeg.extend_from_slice(&[0xff, 0xe1]);
        jpeg.extend_from_slice(&((exif_payload.len() + 2) as u16).to_be_bytes());
        let base = jpeg.len() + 6;
        jpeg.extend_from_slice(exif_payload);
        assert_eq!(locate_tiff_base(&jpeg), Some(base));

        assert_eq!(locate_tiff_base(b"not an image"), None);
    }
}
