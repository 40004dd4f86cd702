//! TIFF backend on the `tiff` crate. Directories are enumerated up front:
//! the largest one is the main page, a small aspect-matching one doubles
//! as the embedded thumbnail. Decoding picks the page closest to the
//! requested scale and walks its chunks (tiles or strips) through the
//! region of interest, publishing refinement per chunk.
//!
//! Unlike libtiff's RGBA helpers the crate hands chunks back top-down in
//! the file's native sample layout, so the legacy bottom-up flip becomes a
//! normalize-to-BGRA step parameterized by color type.

use std::io::Cursor;

use tiff::decoder::{Decoder as TiffDecoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::ColorType;

use super::{Codec, DecodeContext, DecodeError, DecodeOutput, DecodeResult, MAX_ICON_HEIGHT};
use crate::geometry::{PageScale, Rect, Size};
use crate::image::{Surface, SURFACE_BYTES_PER_PIXEL};

const TAG_ICC_PROFILE: u16 = 34675;

#[derive(Debug, Clone, Copy)]
struct PageInfo {
    size: Size,
    bits_per_sample: u8,
    samples_per_pixel: u16,
}

impl PageInfo {
    fn pixel_count(&self) -> u64 {
        self.size.pixel_count()
    }

    fn aspect(&self) -> f64 {
        if self.size.height == 0 {
            return 0.0;
        }
        f64::from(self.size.width) / f64::from(self.size.height)
    }
}

pub(crate) struct TiffCodec {
    pages: Vec<PageInfo>,
    main_page: usize,
}

fn open_decoder(data: &[u8]) -> DecodeResult<TiffDecoder<Cursor<&[u8]>>> {
    TiffDecoder::new(Cursor::new(data))
        .map(|d| d.with_limits(Limits::unlimited()))
        .map_err(|e| DecodeError::header(format!("TIFF open failed: {e}")))
}

fn seek_page<'a>(data: &'a [u8], page: usize) -> DecodeResult<TiffDecoder<Cursor<&'a [u8]>>> {
    let mut decoder = open_decoder(data)?;
    decoder
        .seek_to_image(page)
        .map_err(|e| DecodeError::decode(format!("TIFF directory {page} unavailable: {e}")))?;
    Ok(decoder)
}

impl TiffCodec {
    pub(crate) fn new() -> Self {
        Self {
            pages: Vec::new(),
            main_page: 0,
        }
    }

    fn read_page_infos(
        &self,
        ctx: &mut DecodeContext<'_>,
        decoder: &mut TiffDecoder<Cursor<&[u8]>>,
    ) -> DecodeResult<Vec<PageInfo>> {
        let mut pages = Vec::new();
        loop {
            ctx.poll_cancel()?;
            let (width, height) = decoder
                .dimensions()
                .map_err(|e| DecodeError::header(format!("Error reading TIFF dimensions: {e}")))?;
            let bits_per_sample = decoder
                .find_tag(Tag::BitsPerSample)
                .ok()
                .flatten()
                .and_then(|v| v.into_u16().ok())
                .unwrap_or(1) as u8;
            let samples_per_pixel = decoder
                .find_tag(Tag::SamplesPerPixel)
                .ok()
                .flatten()
                .and_then(|v| v.into_u16().ok())
                .unwrap_or(1);
            pages.push(PageInfo {
                size: Size::new(width, height),
                bits_per_sample,
                samples_per_pixel,
            });
            if !decoder.more_images() {
                break;
            }
            decoder
                .next_image()
                .map_err(|e| DecodeError::header(format!("Error walking TIFF directories: {e}")))?;
        }
        Ok(pages)
    }

    /// Smallest page with the main page's aspect (within 0.1), big enough
    /// to be a usable icon (longer side >= 200 px) while preferring pages
    /// below twice the maximum icon height.
    fn find_thumbnail_page(&self) -> Option<usize> {
        let main = self.pages.get(self.main_page)?;
        let full_aspect = main.aspect();
        let mut best: Option<usize> = None;
        let mut best_pixels = main.pixel_count();
        for (i, page) in self.pages.iter().enumerate() {
            let pixels = page.pixel_count();
            let aspect_ok = (page.aspect() - full_aspect).abs() < 0.1;
            let below_icon_bound = page.size.width < MAX_ICON_HEIGHT * 2
                && page.size.height < MAX_ICON_HEIGHT * 2;
            let big_enough = page.size.width >= 200 || page.size.height >= 200;
            if pixels < best_pixels
                && aspect_ok
                && ((best.is_none() && below_icon_bound) || big_enough)
            {
                best = Some(i);
                best_pixels = pixels;
            }
        }
        best
    }

    /// Page whose horizontal downscale is the largest one not exceeding
    /// the target scale.
    fn find_suitable_page(&self, target_scale: f64) -> Option<usize> {
        let full_width = f64::from(self.pages.get(self.main_page)?.size.width);
        let mut best = None;
        let mut best_scale = 1.0f64;
        for (i, page) in self.pages.iter().enumerate() {
            if page.size.width == 0 {
                continue;
            }
            let scale = full_width / f64::from(page.size.width);
            if scale <= target_scale && scale >= best_scale {
                best = Some(i);
                best_scale = scale;
            }
        }
        best
    }

    /// Decodes `roi` (page coordinates) of one directory into `surface`.
    /// `quiet` suppresses refinement events for the embedded-thumbnail
    /// decode during header parsing.
    fn decode_page(
        &self,
        ctx: &mut DecodeContext<'_>,
        data: &[u8],
        page: usize,
        roi: Rect,
        surface: &Surface,
        page_scale: PageScale,
        quiet: bool,
    ) -> DecodeResult<()> {
        let mut decoder = seek_page(data, page)?;
        let info = self.pages[page];
        let color_type = decoder
            .colortype()
            .map_err(|e| DecodeError::decode(format!("Unsupported TIFF colortype: {e}")))?;

        let tiled = decoder.find_tag(Tag::TileWidth).ok().flatten().is_some();
        if !tiled && decoder.find_tag(Tag::RowsPerStrip).ok().flatten().is_none() {
            // fail early instead of trusting a default, a predetermined
            // breaking point for TIFF-framed raw files
            return Err(DecodeError::decode("Failed to read RowsPerStrip. Not a TIFF file?"));
        }
        if !quiet {
            ctx.set_message(&format!(
                "Decoding {} TIFF image at directory no. {page}",
                if tiled { "tiled" } else { "stripped" }
            ));
        }

        let (chunk_w, chunk_h) = decoder.chunk_dimensions();
        if chunk_w == 0 || chunk_h == 0 {
            return Err(DecodeError::decode("Failed to read TIFF chunk size"));
        }
        let across = info.size.width.div_ceil(chunk_w);
        let down = info.size.height.div_ceil(chunk_h);
        let total = u64::from(across) * u64::from(down);

        let mut done: u64 = 0;
        for cy in 0..down {
            for cx in 0..across {
                ctx.poll_cancel()?;
                let index = cy * across + cx;
                let chunk_rect = Rect::new(
                    cx * chunk_w,
                    cy * chunk_h,
                    chunk_w.min(info.size.width - cx * chunk_w),
                    chunk_h.min(info.size.height - cy * chunk_h),
                );
                let target = chunk_rect.intersected(roi);
                done += 1;
                if target.is_empty() {
                    continue;
                }

                let decoded = decoder.read_chunk(index).map_err(|e| {
                    DecodeError::decode(format!("Error while reading TIFF chunk {index}: {e}"))
                })?;
                let bgra = normalize_chunk(decoded, color_type, chunk_rect.size())?;
                let chunk_stride = chunk_rect.width as usize * SURFACE_BYTES_PER_PIXEL;

                let src_off = (target.y - chunk_rect.y) as usize * chunk_stride
                    + (target.x - chunk_rect.x) as usize * SURFACE_BYTES_PER_PIXEL;
                surface.write_rect(
                    Rect::new(
                        target.x - roi.x,
                        target.y - roi.y,
                        target.width,
                        target.height,
                    ),
                    &bgra[src_off..],
                    chunk_stride,
                );

                if !quiet {
                    ctx.publish_refinement(page_scale.page_to_full(target));
                    ctx.set_progress((done * 100 / total.max(1)) as u8);
                }
            }
        }
        Ok(())
    }

    fn read_dpi(&self, ctx: &mut DecodeContext<'_>, decoder: &mut TiffDecoder<Cursor<&[u8]>>) {
        let unit = decoder
            .find_tag(Tag::ResolutionUnit)
            .ok()
            .flatten()
            .and_then(|v| v.into_u16().ok())
            .unwrap_or(2);
        let res = |tag| {
            decoder
                .find_tag(tag)
                .ok()
                .flatten()
                .and_then(|v| v.into_u32_vec().ok())
                .and_then(|v| match v[..] {
                    [num, denom] if denom != 0 => Some(f64::from(num) / f64::from(denom)),
                    _ => None,
                })
        };
        if let (Some(x), Some(y)) = (res(Tag::XResolution), res(Tag::YResolution)) {
            let to_dpm = |v: f64| match unit {
                3 => (v * 100.0).round() as u32,
                _ => (v * (100.0 / 2.54)).round() as u32,
            };
            ctx.image().set_dots_per_meter(to_dpm(x), to_dpm(y));
        }
    }
}

impl Codec for TiffCodec {
    fn decode_header(&mut self, ctx: &mut DecodeContext<'_>, data: &[u8]) -> DecodeResult<()> {
        ctx.set_message("Parsing TIFF image directories");
        let mut decoder = open_decoder(data)?;
        self.pages = self.read_page_infos(ctx, &mut decoder)?;
        self.main_page = self
            .pages
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.pixel_count())
            .map(|(i, _)| i)
            .ok_or_else(|| DecodeError::header("This TIFF doesn't contain any directories!"))?;

        // the directory walk left the decoder at the last IFD
        let _ = decoder.seek_to_image(0);
        if let Ok(Some(value)) = decoder.find_tag(Tag::Unknown(TAG_ICC_PROFILE)) {
            if let Ok(profile) = value.into_u32_vec() {
                ctx.image()
                    .set_icc_profile(profile.into_iter().map(|b| b as u8).collect());
            }
        }
        ctx.image().set_size(self.pages[self.main_page].size);

        if let Some(thumb_page) = self.find_thumbnail_page() {
            ctx.set_message(&format!(
                "Decoding TIFF thumbnail found at directory no. {thumb_page}"
            ));
            match self.decode_thumbnail(ctx, data, thumb_page) {
                Ok(Some(thumb)) => ctx.image().set_thumbnail(thumb),
                Ok(None) => {}
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "thumbnail at TIFF directory {thumb_page} failed to decode: {e}"
                    );
                    ctx.set_message(&format!(
                        "An error occurred while decoding the embedded thumbnail: {e}"
                    ));
                }
            }
        }
        Ok(())
    }

    fn decoding_loop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        data: &[u8],
        desired: Option<Size>,
        roi: Option<Rect>,
    ) -> DecodeResult<DecodeOutput> {
        if self.pages.is_empty() {
            self.decode_header(ctx, data)?;
        }
        let full = self.pages[self.main_page].size;
        let full_rect = Rect::from_size(full);
        let target_rect = roi
            .map(|r| r.intersected(full_rect))
            .filter(|r| !r.is_empty())
            .unwrap_or(full_rect);
        let desired = desired.filter(Size::is_valid).unwrap_or(target_rect.size());

        // decode a little above the requested resolution, bounded by the roi
        let mut decode_res = target_rect.size().fitted_in(desired);
        decode_res = Size::new(
            ((f64::from(decode_res.width) * 1.5) as u32).min(target_rect.width),
            ((f64::from(decode_res.height) * 1.5) as u32).min(target_rect.height),
        );
        let target_scale = f64::from(target_rect.width) / f64::from(decode_res.width.max(1));

        let page = self
            .find_suitable_page(target_scale)
            .ok_or_else(|| DecodeError::decode("Unable to find a suitable TIFF directory to decode."))?;
        let page_scale = PageScale::for_page(self.pages[page].size, full);
        let mapped_roi = page_scale
            .full_to_page(target_rect)
            .intersected(Rect::from_size(self.pages[page].size));
        if mapped_roi.is_empty() {
            return Err(DecodeError::decode("Region of interest maps to nothing"));
        }

        ctx.set_message("Allocating image output buffer");
        let surface = Surface::new(
            mapped_roi.size(),
            (target_rect.x, target_rect.y),
            page_scale,
        )
        .ok_or_else(|| {
            DecodeError::decode(format!(
                "Unable to allocate the decoded image buffer for {}x{} px",
                mapped_roi.width, mapped_roi.height
            ))
        })?;
        ctx.begin_preview(&surface);

        {
            let mut decoder = seek_page(data, page)?;
            self.read_dpi(ctx, &mut decoder);
        }

        self.decode_page(ctx, data, page, mapped_roi, &surface, page_scale, false)?;

        ctx.set_message("TIFF decoding completed successfully");
        ctx.set_progress(100);

        let full_coverage = page == self.main_page && target_rect == full_rect;
        Ok(DecodeOutput {
            surface,
            full_coverage,
        })
    }

    fn close(&mut self) {
        self.pages.clear();
        self.main_page = 0;
    }
}

impl TiffCodec {
    fn decode_thumbnail(
        &self,
        ctx: &mut DecodeContext<'_>,
        data: &[u8],
        page: usize,
    ) -> DecodeResult<Option<image::DynamicImage>> {
        let size = self.pages[page].size;
        let full = self.pages[self.main_page].size;
        let surface = Surface::new(size, (0, 0), PageScale::for_page(size, full))
            .ok_or_else(|| DecodeError::decode("Unable to allocate the thumbnail buffer"))?;
        self.decode_page(
            ctx,
            data,
            page,
            Rect::from_size(size),
            &surface,
            PageScale::IDENTITY,
            true,
        )?;
        Ok(surface.to_rgba_image().map(image::DynamicImage::ImageRgba8))
    }
}

/// Converts one decoded chunk into tightly packed BGRA rows of
/// `chunk_size` (the chunk's data dimensions).
fn normalize_chunk(
    decoded: DecodingResult,
    color_type: ColorType,
    chunk_size: Size,
) -> DecodeResult<Vec<u8>> {
    let pixels = chunk_size.pixel_count() as usize;
    let samples8: Vec<u8> = match decoded {
        DecodingResult::U8(v) => v,
        DecodingResult::U16(v) => v.iter().map(|s| (s >> 8) as u8).collect(),
        _ => {
            return Err(DecodeError::decode(
                "Unsupported TIFF sample format (only 8 and 16 bit samples)",
            ))
        }
    };

    let channels = match color_type {
        ColorType::Gray(_) => 1,
        ColorType::RGB(_) => 3,
        ColorType::RGBA(_) => 4,
        other => {
            return Err(DecodeError::decode(format!(
                "Unsupported TIFF color type: {other:?}"
            )))
        }
    };
    if samples8.len() < pixels * channels {
        return Err(DecodeError::decode("TIFF chunk is shorter than its dimensions claim"));
    }

    let mut bgra = vec![0u8; pixels * SURFACE_BYTES_PER_PIXEL];
    for (i, px) in bgra.chunks_exact_mut(SURFACE_BYTES_PER_PIXEL).enumerate() {
        let s = &samples8[i * channels..(i + 1) * channels];
        let (r, g, b, a) = match channels {
            1 => (s[0], s[0], s[0], 0xff),
            3 => (s[0], s[1], s[2], 0xff),
            _ => (s[0], s[1], s[2], s[3]),
        };
        px[0] = b;
        px[1] = g;
        px[2] = r;
        px[3] = a;
    }
    Ok(bgra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_expands_gray_and_swaps_rgb() {
        let gray = normalize_chunk(
            DecodingResult::U8(vec![7, 9]),
            ColorType::Gray(8),
            Size::new(2, 1),
        )
        .unwrap();
        assert_eq!(gray, vec![7, 7, 7, 0xff, 9, 9, 9, 0xff]);

        let rgb = normalize_chunk(
            DecodingResult::U8(vec![1, 2, 3]),
            ColorType::RGB(8),
            Size::new(1, 1),
        )
        .unwrap();
        assert_eq!(rgb, vec![3, 2, 1, 0xff]);
    }

    #[test]
    fn normalize_narrows_sixteen_bit_samples() {
        let rgba = normalize_chunk(
            DecodingResult::U16(vec![0xff00, 0x8000, 0x0100, 0xffff]),
            ColorType::RGBA(16),
            Size::new(1, 1),
        )
        .unwrap();
        assert_eq!(rgba, vec![0x01, 0x80, 0xff, 0xff]);
    }

    #[test]
    fn short_chunks_are_rejected() {
        let err = normalize_chunk(
            DecodingResult::U8(vec![1, 2, 3]),
            ColorType::RGBA(8),
            Size::new(2, 2),
        )
        .unwrap_err();
        assert_eq!(err.code(), super::super::DecodeErrorCode::Decode);
    }
}
