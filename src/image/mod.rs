use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use bitflags::bitflags;
use image::DynamicImage;

use crate::decoders::DecodingState;
use crate::events::{EventBus, ImageEvent};
use crate::exif::{AfOverlay, ExifMetadata, Orientation};
use crate::geometry::{PageScale, Rect, Size};

/// Stable handle of one Image. Registries, events and task maps refer to
/// images by id so nothing ever holds a back-pointer cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

impl ImageId {
    fn next() -> Self {
        ImageId(NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

bitflags! {
    /// View behavior toggles persisted by the embedding application.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ViewFlags: u32 {
        const COMBINE_RAW_JPEG = 1 << 0;
        const SHOW_AF_POINTS = 1 << 1;
        const RESPECT_EXIF_ORIENTATION = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    Unchecked,
    PartiallyChecked,
    Checked,
}

/// Snapshot of the on-disk stat the model sorts by.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    pub is_dir: bool,
}

impl FileStat {
    pub fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            size: meta.len(),
            modified: meta.modified().ok(),
            created: meta.created().ok(),
            is_dir: meta.is_dir(),
        }
    }
}

/// One contiguous BGRA8 pixel buffer produced by a decoder. The buffer is
/// written chunk-wise while a decode runs and read concurrently by viewers,
/// so the pixel store sits behind its own short-lived lock; geometry is
/// immutable for the lifetime of the surface.
pub struct Surface {
    size: Size,
    /// Origin of the mapped roi in full-resolution coordinates.
    offset: (u32, u32),
    page_scale: PageScale,
    pixels: Mutex<Vec<u8>>,
}

pub const SURFACE_BYTES_PER_PIXEL: usize = 4;

impl Surface {
    /// Allocates a zero-filled (fully transparent) surface. Fails instead
    /// of aborting when the buffer does not fit in memory.
    pub fn new(size: Size, offset: (u32, u32), page_scale: PageScale) -> Option<Arc<Surface>> {
        let len = (size.pixel_count() as usize).checked_mul(SURFACE_BYTES_PER_PIXEL)?;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).ok()?;
        pixels.resize(len, 0);
        Some(Arc::new(Surface {
            size,
            offset,
            page_scale,
            pixels: Mutex::new(pixels),
        }))
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn offset(&self) -> (u32, u32) {
        self.offset
    }

    pub fn page_scale(&self) -> PageScale {
        self.page_scale
    }

    /// Copies `rect.height` rows of `rect.width * 4` bytes from `src` (with
    /// the given stride) into the surface at `rect`. Out-of-bounds writes
    /// are clipped to the surface.
    pub fn write_rect(&self, rect: Rect, src: &[u8], src_stride: usize) {
        let bounds = Rect::from_size(self.size);
        let clipped = rect.intersected(bounds);
        if clipped.is_empty() {
            return;
        }
        let mut pixels = match self.pixels.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        let dst_stride = self.size.width as usize * SURFACE_BYTES_PER_PIXEL;
        let row_bytes = clipped.width as usize * SURFACE_BYTES_PER_PIXEL;
        for row in 0..clipped.height as usize {
            let src_off = (row + (clipped.y - rect.y) as usize) * src_stride
                + (clipped.x - rect.x) as usize * SURFACE_BYTES_PER_PIXEL;
            let dst_off = (clipped.y as usize + row) * dst_stride
                + clipped.x as usize * SURFACE_BYTES_PER_PIXEL;
            if src_off + row_bytes > src.len() || dst_off + row_bytes > pixels.len() {
                break;
            }
            pixels[dst_off..dst_off + row_bytes].copy_from_slice(&src[src_off..src_off + row_bytes]);
        }
    }

    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pixels = match self.pixels.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&pixels)
    }

    /// Copies the surface into an RGBA image (swapping the B and R
    /// channels), e.g. to derive a thumbnail.
    pub fn to_rgba_image(&self) -> Option<image::RgbaImage> {
        self.with_pixels(|bgra| {
            let mut rgba = bgra.to_vec();
            for px in rgba.chunks_exact_mut(SURFACE_BYTES_PER_PIXEL) {
                px.swap(0, 2);
            }
            image::RgbaImage::from_raw(self.size.width, self.size.height, rgba)
        })
    }
}

struct ImageInner {
    stat: FileStat,
    size: Option<Size>,
    default_orientation: Orientation,
    user_orientation: Orientation,
    /// Embedded ICC profile; `None` means sRGB.
    icc_profile: Option<Vec<u8>>,
    dots_per_meter: Option<(u32, u32)>,
    thumbnail: Option<Arc<DynamicImage>>,
    surface: Option<Arc<Surface>>,
    decoded_roi: Rect,
    state: DecodingState,
    error_message: Option<String>,
    check_state: CheckState,
    exif: Option<Arc<ExifMetadata>>,
    af_overlay: Option<AfOverlay>,
    has_decoder: bool,
    has_jpeg_sibling: bool,
    has_tiff_sibling: bool,
    has_raw_sibling: bool,
    file_type_icon: Option<String>,
}

/// Thread-safe holder of the once-decoded-rarely-changing information of
/// one on-disk file. Written by the decoder that owns it and by the
/// directory worker; read from any thread. Events are always published
/// with the internal lock released.
pub struct Image {
    id: ImageId,
    path: PathBuf,
    events: EventBus<ImageEvent>,
    inner: Mutex<ImageInner>,
}

const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", "nef", "arw", "rw2", "raf", "dng", "orf", "pef", "srw", "srf", "mrw",
];

pub fn is_raw_extension(ext: &str) -> bool {
    RAW_EXTENSIONS.iter().any(|r| ext.eq_ignore_ascii_case(r))
}

pub fn is_jpeg_extension(ext: &str) -> bool {
    ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg")
}

pub fn is_tiff_extension(ext: &str) -> bool {
    ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff")
}

impl Image {
    pub fn new(path: PathBuf, stat: FileStat) -> Arc<Image> {
        Arc::new(Image {
            id: ImageId::next(),
            path,
            events: EventBus::new(),
            inner: Mutex::new(ImageInner {
                stat,
                size: None,
                default_orientation: Orientation::Normal,
                user_orientation: Orientation::Normal,
                icc_profile: None,
                dots_per_meter: None,
                thumbnail: None,
                surface: None,
                decoded_roi: Rect::default(),
                state: DecodingState::Unknown,
                error_message: None,
                check_state: CheckState::Unchecked,
                exif: None,
                af_overlay: None,
                has_decoder: false,
                has_jpeg_sibling: false,
                has_tiff_sibling: false,
                has_raw_sibling: false,
                file_type_icon: None,
            }),
        })
    }

    pub fn from_path(path: &Path) -> std::io::Result<Arc<Image>> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self::new(path.to_path_buf(), FileStat::of(&meta)))
    }

    fn lock(&self) -> MutexGuard<'_, ImageInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    pub fn events(&self) -> &EventBus<ImageEvent> {
        &self.events
    }

    pub fn stat(&self) -> FileStat {
        self.lock().stat
    }

    pub fn refresh_stat(&self) -> bool {
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) => {
                self.lock().stat = FileStat::of(&meta);
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.lock().stat.is_dir
    }

    pub fn is_raw(&self) -> bool {
        is_raw_extension(&self.extension())
    }

    pub fn size(&self) -> Option<Size> {
        self.lock().size
    }

    pub fn full_resolution_rect(&self) -> Option<Rect> {
        self.lock().size.map(Rect::from_size)
    }

    /// Dimensions are set once the header is parsed and never change
    /// afterwards; late writers lose.
    pub fn set_size(&self, size: Size) {
        if !size.is_valid() {
            return;
        }
        let mut inner = self.lock();
        if inner.size.is_none() {
            inner.size = Some(size);
        }
    }

    pub fn default_orientation(&self) -> Orientation {
        self.lock().default_orientation
    }

    pub fn set_default_orientation(&self, orientation: Orientation) {
        self.lock().default_orientation = orientation;
    }

    pub fn user_orientation(&self) -> Orientation {
        self.lock().user_orientation
    }

    pub fn set_user_orientation(&self, orientation: Orientation) {
        self.lock().user_orientation = orientation;
    }

    pub fn icc_profile(&self) -> Option<Vec<u8>> {
        self.lock().icc_profile.clone()
    }

    pub fn set_icc_profile(&self, profile: Vec<u8>) {
        if profile.is_empty() {
            return;
        }
        self.lock().icc_profile = Some(profile);
    }

    pub fn dots_per_meter(&self) -> Option<(u32, u32)> {
        self.lock().dots_per_meter
    }

    pub fn set_dots_per_meter(&self, x: u32, y: u32) {
        if x > 0 && y > 0 {
            self.lock().dots_per_meter = Some((x, y));
        }
    }

    pub fn thumbnail(&self) -> Option<Arc<DynamicImage>> {
        self.lock().thumbnail.clone()
    }

    /// Thumbnail quality is monotonic: a thumbnail is only replaced by one
    /// at least as wide.
    pub fn set_thumbnail(&self, thumbnail: DynamicImage) {
        {
            let mut inner = self.lock();
            if let Some(existing) = &inner.thumbnail {
                if thumbnail.width() < existing.width() {
                    return;
                }
            }
            inner.thumbnail = Some(Arc::new(thumbnail));
        }
        self.events.publish(ImageEvent::ThumbnailChanged { image: self.id });
    }

    /// The thumbnail scaled to the given icon height with the default (and
    /// user) orientation applied; what a list view draws.
    pub fn thumbnail_transformed(&self, icon_height: u32) -> Option<DynamicImage> {
        let (thumb, default_orientation, user_orientation) = {
            let inner = self.lock();
            (
                inner.thumbnail.clone()?,
                inner.default_orientation,
                inner.user_orientation,
            )
        };
        // EXIF thumbnails come pre-oriented; only the user transform applies.
        let _ = default_orientation;
        let scaled = thumb.resize(
            icon_height.saturating_mul(4),
            icon_height,
            image::imageops::FilterType::Triangle,
        );
        Some(user_orientation.apply(scaled))
    }

    pub fn surface(&self) -> Option<Arc<Surface>> {
        self.lock().surface.clone()
    }

    pub fn set_surface(&self, surface: Arc<Surface>) {
        let mut inner = self.lock();
        inner.surface = Some(surface);
        inner.decoded_roi = Rect::default();
    }

    pub fn release_surface(&self) {
        let mut inner = self.lock();
        inner.surface = None;
        inner.decoded_roi = Rect::default();
    }

    pub fn decoded_roi(&self) -> Rect {
        self.lock().decoded_roi
    }

    /// Grows the decoded region by `rect` (full-resolution coordinates) and
    /// publishes the refinement.
    pub fn grow_decoded_roi(&self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            inner.decoded_roi = inner.decoded_roi.united(rect);
        }
        self.events
            .publish(ImageEvent::DecodedRegionGrew { image: self.id, rect });
    }

    pub fn decoding_state(&self) -> DecodingState {
        self.lock().state
    }

    /// Advances the state machine mirror. A decoder that already went
    /// Fatal ignores later Error/Cancelled downgrades.
    pub fn set_decoding_state(&self, new: DecodingState) {
        let old = {
            let mut inner = self.lock();
            let old = inner.state;
            if old == DecodingState::Fatal
                && matches!(new, DecodingState::Error | DecodingState::Cancelled)
            {
                return;
            }
            inner.state = new;
            old
        };
        if old != new {
            self.events.publish(ImageEvent::StateChanged {
                image: self.id,
                new,
                old,
            });
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn set_error_message(&self, message: Option<String>) {
        self.lock().error_message = message;
    }

    pub fn check_state(&self) -> CheckState {
        self.lock().check_state
    }

    pub fn set_check_state(&self, state: CheckState) {
        {
            let mut inner = self.lock();
            if inner.check_state == state {
                return;
            }
            inner.check_state = state;
        }
        self.events
            .publish(ImageEvent::CheckStateChanged { image: self.id });
    }

    pub fn exif(&self) -> Option<Arc<ExifMetadata>> {
        self.lock().exif.clone()
    }

    pub fn set_exif(&self, exif: Arc<ExifMetadata>) {
        let overlay = exif.af_overlay().cloned();
        let mut inner = self.lock();
        inner.af_overlay = overlay;
        inner.exif = Some(exif);
    }

    pub fn af_overlay(&self) -> Option<AfOverlay> {
        self.lock().af_overlay.clone()
    }

    pub fn has_decoder(&self) -> bool {
        self.lock().has_decoder
    }

    pub fn set_has_decoder(&self, value: bool) {
        self.lock().has_decoder = value;
    }

    pub fn has_jpeg_sibling(&self) -> bool {
        self.lock().has_jpeg_sibling
    }

    pub fn has_tiff_sibling(&self) -> bool {
        self.lock().has_tiff_sibling
    }

    pub fn has_raw_sibling(&self) -> bool {
        self.lock().has_raw_sibling
    }

    pub fn set_siblings(&self, jpeg: bool, tiff: bool, raw: bool) {
        let mut inner = self.lock();
        inner.has_jpeg_sibling = jpeg;
        inner.has_tiff_sibling = tiff;
        inner.has_raw_sibling = raw;
    }

    /// A RAW file with an equally named JPEG stays in the model but is
    /// disabled while the combine-RAW-and-JPEG view flag is active.
    pub fn hide_if_non_raw_available(&self, flags: ViewFlags) -> bool {
        flags.contains(ViewFlags::COMBINE_RAW_JPEG) && self.is_raw() && self.has_jpeg_sibling()
    }

    pub fn file_type_icon(&self) -> Option<String> {
        self.lock().file_type_icon.clone()
    }

    /// Fallback decoration for files no decoder accepts: the UI keys its
    /// icon lookup off the uppercased extension.
    pub fn lookup_icon_from_file_type(&self) {
        let icon = self.extension().to_ascii_uppercase();
        self.lock().file_type_icon = Some(if icon.is_empty() {
            "FILE".to_string()
        } else {
            icon
        });
    }

    /// Multi-line human summary shown as the row tooltip.
    pub fn format_info_string(&self) -> String {
        let (stat, size, dpm, state, exif) = {
            let inner = self.lock();
            (
                inner.stat,
                inner.size,
                inner.dots_per_meter,
                inner.state,
                inner.exif.clone(),
            )
        };

        let mut lines = vec![self.file_name()];
        lines.push(format_byte_size(stat.size));
        if let Some(size) = size {
            lines.push(format!("{} x {} px", size.width, size.height));
        }
        if let Some((x, y)) = dpm {
            let dpi_x = (f64::from(x) * 2.54 / 100.0).round();
            let dpi_y = (f64::from(y) * 2.54 / 100.0).round();
            lines.push(format!("{dpi_x} x {dpi_y} dpi"));
        }
        if let Some(modified) = stat.modified {
            let dt: chrono::DateTime<chrono::Local> = modified.into();
            lines.push(format!("Modified: {}", dt.format("%Y-%m-%d %H:%M")));
        }
        if let Some(exif) = exif {
            if let Some(dt) = exif.date_recorded() {
                lines.push(format!("Recorded: {}", dt.format("%Y-%m-%d %H:%M:%S")));
            }
            if let Some(f) = exif.aperture() {
                lines.push(format!("f/{f:.1}"));
            }
            if let Some(e) = exif.exposure_time() {
                lines.push(e.display());
            }
            if let Some(iso) = exif.iso() {
                lines.push(format!("ISO {iso}"));
            }
            if let Some(fl) = exif.focal_length() {
                lines.push(format!("{fl:.0} mm"));
            }
            if let Some(lens) = exif.lens() {
                lines.push(lens);
            }
            if let Some(model) = exif.camera_model() {
                lines.push(model);
            }
        }
        lines.push(if self.lock().icc_profile.is_some() {
            "Embedded ICC profile".to_string()
        } else {
            "sRGB".to_string()
        });
        let _ = state;
        lines.join("\n")
    }
}

fn format_byte_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> Arc<Image> {
        Image::new(PathBuf::from("/photos/IMG_0001.CR2"), FileStat::default())
    }

    #[test]
    fn dimensions_are_write_once() {
        let img = test_image();
        img.set_size(Size::new(4000, 3000));
        img.set_size(Size::new(1, 1));
        assert_eq!(img.size(), Some(Size::new(4000, 3000)));
    }

    #[test]
    fn thumbnail_quality_is_monotonic() {
        let img = test_image();
        let events = img.events().subscribe();
        img.set_thumbnail(DynamicImage::new_rgba8(160, 120));
        img.set_thumbnail(DynamicImage::new_rgba8(80, 60));
        assert_eq!(img.thumbnail().unwrap().width(), 160);
        img.set_thumbnail(DynamicImage::new_rgba8(320, 240));
        assert_eq!(img.thumbnail().unwrap().width(), 320);
        assert_eq!(events.try_iter().count(), 2);
    }

    #[test]
    fn fatal_masks_later_downgrades() {
        let img = test_image();
        img.set_decoding_state(DecodingState::Fatal);
        img.set_decoding_state(DecodingState::Error);
        assert_eq!(img.decoding_state(), DecodingState::Fatal);
        img.set_decoding_state(DecodingState::Ready);
        assert_eq!(img.decoding_state(), DecodingState::Ready);
    }

    #[test]
    fn raw_with_jpeg_sibling_hides_under_combine_flag() {
        let img = test_image();
        img.set_siblings(true, false, false);
        assert!(img.hide_if_non_raw_available(ViewFlags::COMBINE_RAW_JPEG));
        assert!(!img.hide_if_non_raw_available(ViewFlags::empty()));
        let jpg = Image::new(PathBuf::from("/photos/IMG_0001.JPG"), FileStat::default());
        jpg.set_siblings(false, false, true);
        assert!(!jpg.hide_if_non_raw_available(ViewFlags::COMBINE_RAW_JPEG));
    }

    #[test]
    fn surface_write_rect_clips_and_copies() {
        let surface = Surface::new(Size::new(4, 2), (0, 0), PageScale::IDENTITY).unwrap();
        let src = vec![0xAA; 2 * 2 * SURFACE_BYTES_PER_PIXEL];
        surface.write_rect(Rect::new(3, 0, 2, 2), &src, 2 * SURFACE_BYTES_PER_PIXEL);
        surface.with_pixels(|px| {
            // only column 3 of both rows written
            assert_eq!(&px[3 * 4..4 * 4], &[0xAA; 4]);
            assert_eq!(&px[0..4], &[0; 4]);
            assert_eq!(&px[(4 + 3) * 4..(4 + 4) * 4], &[0xAA; 4]);
        });
    }

    #[test]
    fn decoded_roi_grows_and_publishes() {
        let img = test_image();
        let events = img.events().subscribe();
        img.grow_decoded_roi(Rect::new(0, 0, 100, 10));
        img.grow_decoded_roi(Rect::new(0, 10, 100, 10));
        assert_eq!(img.decoded_roi(), Rect::new(0, 0, 100, 20));
        assert_eq!(events.try_iter().count(), 2);
    }
}
