use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::exif::ExifMetadata;
use crate::geometry::{Rect, Size};
use crate::image::{Image, Surface};
use crate::pool::{DecodePool, Priority, StateFuture};

mod cr2;
mod error;
mod jpeg;
mod jxl;
mod png;
mod tiff;

pub use error::{DecodeError, DecodeErrorCode, DecodeResult};

/// Tallest icon the embedding views draw; bounds derived thumbnails and the
/// TIFF thumbnail-page search.
pub const MAX_ICON_HEIGHT: u32 = 512;

/// Lifecycle of one decoder. `Unknown` through `FullImage` are ordered;
/// `Error`, `Fatal` and `Cancelled` are sinks reachable from anywhere and
/// left via `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodingState {
    #[default]
    Unknown,
    Ready,
    Metadata,
    PreviewImage,
    FullImage,
    Error,
    Fatal,
    Cancelled,
}

/// Interval refinement rectangles are coalesced to.
const REFINEMENT_COALESCE: Duration = Duration::from_millis(50);

/// Services a format backend uses while decoding: the image it fills,
/// cancellation polling, progress text and coalesced refinement
/// publication.
pub(crate) struct DecodeContext<'a> {
    image: &'a Arc<Image>,
    future: Option<&'a StateFuture>,
    cancel: &'a AtomicBool,
    progress_percent: u8,
    progress_text: String,
    pending_refinement: Rect,
    last_refinement: Instant,
}

impl<'a> DecodeContext<'a> {
    fn new(image: &'a Arc<Image>, future: Option<&'a StateFuture>, cancel: &'a AtomicBool) -> Self {
        Self {
            image,
            future,
            cancel,
            progress_percent: 0,
            progress_text: String::new(),
            pending_refinement: Rect::default(),
            last_refinement: Instant::now(),
        }
    }

    pub(crate) fn image(&self) -> &Arc<Image> {
        self.image
    }

    /// The cancellation point. Backends call this at least once per
    /// scanline strip, tile, progressive pass and large allocation.
    pub(crate) fn poll_cancel(&self) -> DecodeResult<()> {
        let cancelled = self.cancel.load(Ordering::SeqCst)
            || self.future.map(StateFuture::is_cancel_requested).unwrap_or(false);
        if cancelled {
            Err(DecodeError::cancelled())
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_message(&mut self, text: &str) {
        self.progress_text = text.to_string();
        if let Some(future) = self.future {
            future.set_progress(self.progress_percent, text);
        }
    }

    pub(crate) fn set_progress(&mut self, percent: u8) {
        self.progress_percent = percent.min(100);
        if let Some(future) = self.future {
            future.set_progress(self.progress_percent, &self.progress_text);
        }
    }

    /// Grows the image's decoded region by `rect` (full-resolution
    /// coordinates). Events are published at most every 50 ms; call
    /// `flush_refinement` when a pass or the loop completes.
    pub(crate) fn publish_refinement(&mut self, rect: Rect) {
        self.pending_refinement = self.pending_refinement.united(rect);
        if self.last_refinement.elapsed() >= REFINEMENT_COALESCE {
            self.flush_refinement();
        }
    }

    /// Hands the freshly allocated (still blank) surface to the image and
    /// enters PreviewImage so listeners can start observing refinements.
    pub(crate) fn begin_preview(&mut self, surface: &Arc<Surface>) {
        self.image.set_surface(surface.clone());
        self.image.set_decoding_state(DecodingState::PreviewImage);
    }

    pub(crate) fn flush_refinement(&mut self) {
        if self.pending_refinement.is_empty() {
            return;
        }
        let rect = std::mem::take(&mut self.pending_refinement);
        self.last_refinement = Instant::now();
        self.image.grow_decoded_roi(rect);
    }
}

/// What a backend's decoding loop hands back: the surface it filled and
/// whether it covered the full resolution (no scaling, no cropping, main
/// page).
pub(crate) struct DecodeOutput {
    pub surface: Arc<Surface>,
    pub full_coverage: bool,
}

/// One image format. Implementations keep their parse state between
/// `decode_header` and `decoding_loop` and must be reusable after `close`.
pub(crate) trait Codec: Send {
    fn decode_header(&mut self, ctx: &mut DecodeContext<'_>, data: &[u8]) -> DecodeResult<()>;

    fn decoding_loop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        data: &[u8],
        desired: Option<Size>,
        roi: Option<Rect>,
    ) -> DecodeResult<DecodeOutput>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingParams {
    target: DecodingState,
    desired: Option<Size>,
    roi: Option<Rect>,
}

struct DecoderIo {
    file: Option<File>,
    map: Option<Mmap>,
    /// Byte range of the embedded JPEG preview for RAW containers; the
    /// codec sees only this slice, EXIF still reads the whole file.
    preset_range: Option<Range<usize>>,
}

/// Format-agnostic decoder: owns the open file and its mapping, drives the
/// backend, and walks the state machine mirrored on its [`Image`].
pub struct Decoder {
    image: Arc<Image>,
    codec: Mutex<Box<dyn Codec>>,
    io: Mutex<DecoderIo>,
    pending: Mutex<PendingParams>,
    inflight: Mutex<Option<StateFuture>>,
    cancel: AtomicBool,
    decoding: AtomicBool,
    reached_metadata: AtomicBool,
    is_raw_container: bool,
}

impl Decoder {
    fn new(image: Arc<Image>, codec: Box<dyn Codec>, is_raw_container: bool) -> Arc<Decoder> {
        image.set_has_decoder(true);
        image.set_decoding_state(DecodingState::Ready);
        Arc::new(Decoder {
            image,
            codec: Mutex::new(codec),
            io: Mutex::new(DecoderIo {
                file: None,
                map: None,
                preset_range: None,
            }),
            pending: Mutex::new(PendingParams::default()),
            inflight: Mutex::new(None),
            cancel: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            reached_metadata: AtomicBool::new(false),
            is_raw_container,
        })
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    fn lock_io(&self) -> MutexGuard<'_, DecoderIo> {
        match self.io.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, Option<StateFuture>> {
        match self.inflight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn assert_not_decoding(&self, what: &str) -> DecodeResult<()> {
        if self.decoding.load(Ordering::SeqCst) {
            return Err(DecodeError::programming(format!(
                "{what} not allowed, decoding is still ongoing"
            )));
        }
        if let Some(fut) = self.lock_inflight().as_ref() {
            if !fut.is_finished() {
                return Err(DecodeError::programming(format!(
                    "{what} not allowed, a decode task is still in flight"
                )));
            }
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock_io().file.is_some()
    }

    /// Acquires the file handle and maps the encoded bytes. Going Fatal on
    /// IO failure, ProgrammingError when already open.
    pub fn open(&self) -> DecodeResult<()> {
        let mut io = self.lock_io();
        if io.file.is_some() {
            return Err(DecodeError::programming("file is already open"));
        }
        let result = (|| -> DecodeResult<()> {
            let file = File::open(self.image.path()).map_err(|e| {
                DecodeError::from_io_error(
                    format!("Unable to open file '{}'", self.image.path().display()),
                    e,
                )
            })?;
            let map = unsafe { Mmap::map(&file) }.map_err(|e| {
                DecodeError::from_io_error(
                    format!("Unable to map file '{}'", self.image.path().display()),
                    e,
                )
            })?;
            io.preset_range = if self.is_raw_container {
                cr2::embedded_preview_range(&map)
            } else {
                None
            };
            io.file = Some(file);
            io.map = Some(map);
            Ok(())
        })();
        if let Err(e) = &result {
            if e.code() != DecodeErrorCode::Programming {
                drop(io);
                self.image.set_error_message(Some(e.to_string()));
                self.image.set_decoding_state(DecodingState::Fatal);
            }
        }
        result
    }

    /// Releases mmap and file handle. Refused during a decode.
    pub fn close(&self) -> DecodeResult<()> {
        self.assert_not_decoding("close")?;
        {
            let mut codec = match self.codec.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            codec.close();
        }
        let mut io = self.lock_io();
        io.map = None;
        io.file = None;
        io.preset_range = None;
        Ok(())
    }

    /// From Fatal back to Ready; otherwise releases the decoded surface
    /// (metadata survives) and returns to Metadata, or Ready when metadata
    /// was never reached. Refused while a task is in flight.
    pub fn reset(&self) -> DecodeResult<()> {
        self.assert_not_decoding("reset")?;
        self.image.set_error_message(None);
        if self.image.decoding_state() == DecodingState::Fatal {
            self.image.set_decoding_state(DecodingState::Ready);
            return Ok(());
        }
        self.image.release_surface();
        if self.reached_metadata.load(Ordering::SeqCst) {
            self.image.set_decoding_state(DecodingState::Metadata);
        } else {
            self.image.set_decoding_state(DecodingState::Ready);
        }
        Ok(())
    }

    /// Synchronous decode with the caller's thread. The final state is
    /// also published on the image.
    pub fn decode(
        &self,
        target: DecodingState,
        desired: Option<Size>,
        roi: Option<Rect>,
    ) -> DecodingState {
        // a stale flag from an earlier cancelled task must not abort a
        // fresh synchronous decode
        self.cancel.store(false, Ordering::SeqCst);
        self.decode_with_future(None, PendingParams { target, desired, roi })
    }

    /// Schedules an asynchronous decode. Exactly one task is in flight per
    /// decoder: while the current future is unfinished, the same target
    /// returns the same future and a different target cancels the current
    /// task and waits for its termination before scheduling the new one.
    pub fn decode_async(
        self: &Arc<Self>,
        pool: &DecodePool,
        target: DecodingState,
        priority: Priority,
        desired: Option<Size>,
        roi: Option<Rect>,
    ) -> StateFuture {
        let mut inflight = self.lock_inflight();
        if let Some(current) = inflight.clone() {
            if !current.is_finished() {
                let same_target = {
                    let pending = match self.pending.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    pending.target == target
                };
                if same_target {
                    return current;
                }
                self.cancel_or_take_locked(pool, &current);
            }
        }

        self.cancel.store(false, Ordering::SeqCst);
        {
            let mut pending = match self.pending.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *pending = PendingParams { target, desired, roi };
        }
        let future = StateFuture::new();
        *inflight = Some(future.clone());
        pool.enqueue(self.clone(), future.clone(), priority);
        future
    }

    /// If the task is still queued, removes it and synthesizes completion;
    /// if it runs, sets the cancel flag. Returns once the future is
    /// terminal.
    pub fn cancel_or_take(&self, pool: &DecodePool, future: &StateFuture) {
        self.cancel_or_take_locked(pool, future);
    }

    fn cancel_or_take_locked(&self, pool: &DecodePool, future: &StateFuture) {
        if pool.try_take(future) {
            self.image.set_decoding_state(DecodingState::Cancelled);
        } else {
            future.cancel();
            self.cancel.store(true, Ordering::SeqCst);
        }
        future.wait();
    }

    /// Pool entry point: opens on demand, decodes with the captured
    /// parameters and closes right away so handles never linger while
    /// events drain.
    pub(crate) fn run(&self, future: &StateFuture) -> DecodingState {
        let params = {
            let pending = match self.pending.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *pending
        };
        if !self.is_open() {
            if let Err(e) = self.open() {
                debug!("open failed in decode task: {e}");
                return self.image.decoding_state();
            }
        }
        let state = self.decode_with_future(Some(future), params);
        if let Err(e) = self.close() {
            warn!("close after decode task failed: {e}");
        }
        state
    }

    fn decode_with_future(&self, future: Option<&StateFuture>, params: PendingParams) -> DecodingState {
        if self.decoding.swap(true, Ordering::SeqCst) {
            // decode is not re-entrant; report via the image
            self.image
                .set_error_message(Some("decode already running".to_string()));
            return self.image.decoding_state();
        }
        let result = self.decode_impl(future, params);
        self.decoding.store(false, Ordering::SeqCst);

        match result {
            Ok(state) => state,
            Err(e) if e.is_cancellation() => {
                self.image.set_decoding_state(DecodingState::Cancelled);
                DecodingState::Cancelled
            }
            Err(e) => {
                self.image.set_error_message(Some(e.to_string()));
                let state = match e.code() {
                    DecodeErrorCode::FatalIo | DecodeErrorCode::Header => DecodingState::Fatal,
                    _ => DecodingState::Error,
                };
                self.image.set_decoding_state(state);
                state
            }
        }
    }

    fn decode_impl(
        &self,
        future: Option<&StateFuture>,
        params: PendingParams,
    ) -> DecodeResult<DecodingState> {
        let io = self.lock_io();
        let map = io
            .map
            .as_ref()
            .ok_or_else(|| DecodeError::programming("decoder must be opened before decoding"))?;
        let whole_file: &[u8] = map;
        let encoded: &[u8] = match &io.preset_range {
            Some(range) => whole_file.get(range.clone()).unwrap_or(whole_file),
            None => whole_file,
        };

        let mut codec = match self.codec.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ctx = DecodeContext::new(&self.image, future, &self.cancel);

        ctx.poll_cancel()?;

        if self.image.decoding_state() != DecodingState::Metadata {
            self.init(&mut ctx, codec.as_mut(), encoded, whole_file)?;
        }
        if matches!(
            params.target,
            DecodingState::Unknown | DecodingState::Ready | DecodingState::Metadata
        ) {
            return Ok(DecodingState::Metadata);
        }

        // the backend already handed the surface over via begin_preview
        let output = codec.decoding_loop(&mut ctx, encoded, params.desired, params.roi)?;
        ctx.flush_refinement();

        // derive a thumbnail from the decoded pixels when the file offered
        // none and the decode was not region-limited
        if self.image.thumbnail().is_none() && params.roi.is_none() {
            if let Some(rgba) = output.surface.to_rgba_image() {
                let img = image::DynamicImage::ImageRgba8(rgba);
                let bound = params
                    .desired
                    .filter(|d| d.pixel_count() < MAX_ICON_HEIGHT as u64 * MAX_ICON_HEIGHT as u64)
                    .unwrap_or(Size::new(MAX_ICON_HEIGHT, MAX_ICON_HEIGHT));
                let thumb = img.resize(
                    bound.width,
                    bound.height,
                    image::imageops::FilterType::Triangle,
                );
                self.image.set_thumbnail(thumb);
            }
        }

        let final_state = if output.full_coverage {
            DecodingState::FullImage
        } else {
            DecodingState::PreviewImage
        };
        self.image.set_decoding_state(final_state);
        Ok(final_state)
    }

    fn init(
        &self,
        ctx: &mut DecodeContext<'_>,
        codec: &mut dyn Codec,
        encoded: &[u8],
        whole_file: &[u8],
    ) -> DecodeResult<()> {
        codec
            .decode_header(ctx, encoded)
            .map_err(|e| match e.code() {
                DecodeErrorCode::Cancelled | DecodeErrorCode::Header => e,
                _ => DecodeError::header(e.to_string()),
            })?;

        // EXIF intentionally reads the original file; a preset preview
        // range would not carry the camera's block.
        if let Some(exif) = ExifMetadata::from_file_bytes(whole_file) {
            self.image.set_default_orientation(exif.orientation());
            if let Some(thumb) = exif.thumbnail() {
                self.image.set_thumbnail(thumb);
            }
            if let (Some(x), Some(y)) = (exif.dots_per_meter_x(), exif.dots_per_meter_y()) {
                self.image.set_dots_per_meter(x, y);
            }
            self.image.set_exif(Arc::new(exif));
        }

        ctx.poll_cancel()?;
        self.reached_metadata.store(true, Ordering::SeqCst);
        self.image.set_decoding_state(DecodingState::Metadata);
        Ok(())
    }
}

const SNIFF_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SniffedFormat {
    Jpeg,
    Tiff,
    Png,
    Jxl,
}

fn sniff_format(prefix: &[u8]) -> Option<SniffedFormat> {
    if prefix.starts_with(&[0xff, 0xd8]) {
        return Some(SniffedFormat::Jpeg);
    }
    if prefix.starts_with(&[0x89, 0x50, 0x4e, 0x47]) {
        return Some(SniffedFormat::Png);
    }
    if prefix.starts_with(&[0x49, 0x49, 0x2a, 0x00]) || prefix.starts_with(&[0x4d, 0x4d, 0x00, 0x2a])
    {
        return Some(SniffedFormat::Tiff);
    }
    if prefix.starts_with(&[0xff, 0x0a])
        || prefix.starts_with(&[
            0x00, 0x00, 0x00, 0x0c, 0x4a, 0x58, 0x4c, 0x20, 0x0d, 0x0a, 0x87, 0x0a,
        ])
    {
        return Some(SniffedFormat::Jxl);
    }
    None
}

/// The Canon-specific bytes at offsets 8..12 of the TIFF header.
fn has_cr2_header(prefix: &[u8]) -> bool {
    let le = prefix.starts_with(&[0x49, 0x49, 0x2a, 0x00]);
    let be = prefix.starts_with(&[0x4d, 0x4d, 0x00, 0x2a]);
    if !le && !be {
        return false;
    }
    let sig = match prefix.get(8..12) {
        Some(s) => s,
        None => return false,
    };
    if le {
        sig == [b'C', b'R', 0x02, 0x00]
    } else {
        sig == [b'R', b'C', 0x00, 0x02]
    }
}

fn read_prefix(path: &Path) -> Option<[u8; SNIFF_LEN]> {
    let mut file = File::open(path).ok()?;
    let mut buf = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    (filled == buf.len()).then_some(buf)
}

/// Builds the decoder for an image, dispatching by extension first and by
/// content sniffing second. Files no backend accepts get `None`; they stay
/// in the model with a file-type icon.
pub fn create_decoder(image: &Arc<Image>) -> Option<Arc<Decoder>> {
    if image.is_dir() {
        return None;
    }
    let ext = image.extension();

    if crate::image::is_raw_extension(&ext) {
        // Of the RAW family only CR2 carries its preview where we can find
        // it (IFD0 strips); confirm the Canon signature before committing.
        let prefix = read_prefix(image.path())?;
        if has_cr2_header(&prefix) {
            return Some(Decoder::new(image.clone(), Box::new(jpeg::JpegCodec::new()), true));
        }
        return None;
    }

    let codec: Option<Box<dyn Codec>> = match ext.as_str() {
        "jpg" | "jpeg" => Some(Box::new(jpeg::JpegCodec::new())),
        "tif" | "tiff" => Some(Box::new(tiff::TiffCodec::new())),
        "png" => Some(Box::new(png::PngCodec::new())),
        "jxl" => Some(Box::new(jxl::JxlCodec::new())),
        _ => {
            let prefix = read_prefix(image.path())?;
            match sniff_format(&prefix)? {
                SniffedFormat::Jpeg => Some(Box::new(jpeg::JpegCodec::new())),
                SniffedFormat::Tiff => Some(Box::new(tiff::TiffCodec::new())),
                SniffedFormat::Png => Some(Box::new(png::PngCodec::new())),
                SniffedFormat::Jxl => Some(Box::new(jxl::JxlCodec::new())),
            }
        }
    };
    codec.map(|codec| Decoder::new(image.clone(), codec, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffing_recognizes_magic_bytes() {
        assert_eq!(sniff_format(&[0xff, 0xd8, 0xff, 0xe0]), Some(SniffedFormat::Jpeg));
        assert_eq!(
            sniff_format(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a]),
            Some(SniffedFormat::Png)
        );
        assert_eq!(
            sniff_format(&[0x49, 0x49, 0x2a, 0x00]),
            Some(SniffedFormat::Tiff)
        );
        assert_eq!(sniff_format(&[0xff, 0x0a]), Some(SniffedFormat::Jxl));
        assert_eq!(sniff_format(b"GIF89a"), None);
    }

    #[test]
    fn cr2_signature_is_endian_aware() {
        let mut le = vec![0x49, 0x49, 0x2a, 0x00, 0x10, 0, 0, 0];
        le.extend_from_slice(&[b'C', b'R', 0x02, 0x00]);
        assert!(has_cr2_header(&le));

        let mut plain_tiff = vec![0x49, 0x49, 0x2a, 0x00, 0x10, 0, 0, 0];
        plain_tiff.extend_from_slice(&[0, 0, 0, 0]);
        assert!(!has_cr2_header(&plain_tiff));

        assert!(!has_cr2_header(&[0xff, 0xd8]));
    }
}
