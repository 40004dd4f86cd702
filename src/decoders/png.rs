//! PNG backend on the `png` crate: row-by-row with a cancellation poll per
//! row, iCCP attachment, and ADAM7 interlace passes treated as progressive
//! refinement. Output is normalized to 8-bit BGRA; PNG knows no scaled
//! decode, so the loop always materializes the full resolution.

use std::io::Cursor;

use png::{ColorType, Transformations};

use super::{Codec, DecodeContext, DecodeError, DecodeOutput, DecodeResult};
use crate::geometry::{PageScale, Rect, Size};
use crate::image::{Surface, SURFACE_BYTES_PER_PIXEL};

/// x start, y start, x step, y step per ADAM7 pass (1..=7).
const ADAM7: [(u32, u32, u32, u32); 7] = [
    (0, 0, 8, 8),
    (4, 0, 8, 8),
    (0, 4, 4, 8),
    (2, 0, 4, 4),
    (0, 2, 2, 4),
    (1, 0, 2, 2),
    (0, 1, 1, 2),
];

pub(crate) struct PngCodec {
    size: Option<Size>,
}

impl PngCodec {
    pub(crate) fn new() -> Self {
        Self { size: None }
    }
}

fn open_reader(data: &[u8]) -> DecodeResult<png::Reader<Cursor<&[u8]>>> {
    let mut decoder = png::Decoder::new(Cursor::new(data));
    decoder.set_transformations(Transformations::EXPAND | Transformations::STRIP_16);
    decoder
        .read_info()
        .map_err(|e| DecodeError::header(format!("Error while reading the PNG header: {e}")))
}

fn bgra_row(src: &[u8], color: ColorType, width: u32, out: &mut [u8]) -> DecodeResult<()> {
    let channels = match color {
        ColorType::Grayscale => 1,
        ColorType::GrayscaleAlpha => 2,
        ColorType::Rgb => 3,
        ColorType::Rgba => 4,
        ColorType::Indexed => {
            return Err(DecodeError::decode(
                "PNG palette was not expanded by the decoder",
            ))
        }
    };
    if src.len() < width as usize * channels {
        return Err(DecodeError::decode("PNG row is shorter than the header claims"));
    }
    for i in 0..width as usize {
        let s = &src[i * channels..(i + 1) * channels];
        let (r, g, b, a) = match color {
            ColorType::Grayscale => (s[0], s[0], s[0], 0xff),
            ColorType::GrayscaleAlpha => (s[0], s[0], s[0], s[1]),
            ColorType::Rgb => (s[0], s[1], s[2], 0xff),
            _ => (s[0], s[1], s[2], s[3]),
        };
        let px = &mut out[i * SURFACE_BYTES_PER_PIXEL..(i + 1) * SURFACE_BYTES_PER_PIXEL];
        px[0] = b;
        px[1] = g;
        px[2] = r;
        px[3] = a;
    }
    Ok(())
}

impl Codec for PngCodec {
    fn decode_header(&mut self, ctx: &mut DecodeContext<'_>, data: &[u8]) -> DecodeResult<()> {
        ctx.set_message("Reading PNG header");
        let reader = open_reader(data)?;
        let info = reader.info();
        let size = Size::new(info.width, info.height);
        if !size.is_valid() {
            return Err(DecodeError::header("PNG reports empty dimensions"));
        }
        self.size = Some(size);
        ctx.image().set_size(size);
        if let Some(icc) = &info.icc_profile {
            ctx.image().set_icc_profile(icc.clone().into_owned());
        }
        Ok(())
    }

    fn decoding_loop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        data: &[u8],
        _desired: Option<Size>,
        _roi: Option<Rect>,
    ) -> DecodeResult<DecodeOutput> {
        if self.size.is_none() {
            self.decode_header(ctx, data)?;
        }
        let mut reader = open_reader(data)?;
        let size = self.size.unwrap_or_default();
        let (color, _) = reader.output_color_type();
        let interlaced = reader.info().interlaced;

        ctx.set_message("Allocating image output buffer");
        let surface = Surface::new(size, (0, 0), PageScale::IDENTITY).ok_or_else(|| {
            DecodeError::decode(format!(
                "Unable to allocate the decoded image buffer for {}x{} px",
                size.width, size.height
            ))
        })?;
        ctx.begin_preview(&surface);

        ctx.set_message("Decoding PNG rows");
        let mut bgra = vec![0u8; size.width as usize * SURFACE_BYTES_PER_PIXEL];
        let mut rows_done: u64 = 0;
        let total_rows: u64 = if interlaced {
            // passes revisit rows, twice the height approximates the work
            u64::from(size.height) * 2
        } else {
            u64::from(size.height)
        };

        loop {
            ctx.poll_cancel()?;
            let row = match reader.next_interlaced_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DecodeError::decode(format!("Error while decoding PNG: {e}"))),
            };

            match row.interlace() {
                png::InterlaceInfo::Null => {
                    let y = rows_done as u32;
                    bgra_row(row.data(), color, size.width, &mut bgra)?;
                    surface.write_rect(
                        Rect::new(0, y, size.width, 1),
                        &bgra,
                        size.width as usize * SURFACE_BYTES_PER_PIXEL,
                    );
                    ctx.publish_refinement(Rect::new(0, y, size.width, 1));
                }
                png::InterlaceInfo::Adam7 { pass, line, width } => {
                    let (x0, y0, dx, dy) = ADAM7[(pass as usize).clamp(1, 7) - 1];
                    let y = y0 + line * dy;
                    if y >= size.height {
                        continue;
                    }
                    bgra_row(row.data(), color, width, &mut bgra)?;
                    // scatter the sparse pass row into its final columns
                    let mut scattered =
                        vec![0u8; size.width as usize * SURFACE_BYTES_PER_PIXEL];
                    surface.with_pixels(|px| {
                        let off = y as usize * size.width as usize * SURFACE_BYTES_PER_PIXEL;
                        scattered
                            .copy_from_slice(&px[off..off + scattered.len()]);
                    });
                    for i in 0..width {
                        let x = x0 + i * dx;
                        if x >= size.width {
                            break;
                        }
                        let src = &bgra[i as usize * SURFACE_BYTES_PER_PIXEL
                            ..(i as usize + 1) * SURFACE_BYTES_PER_PIXEL];
                        scattered[x as usize * SURFACE_BYTES_PER_PIXEL
                            ..(x as usize + 1) * SURFACE_BYTES_PER_PIXEL]
                            .copy_from_slice(src);
                    }
                    surface.write_rect(
                        Rect::new(0, y, size.width, 1),
                        &scattered,
                        size.width as usize * SURFACE_BYTES_PER_PIXEL,
                    );
                    ctx.publish_refinement(Rect::new(0, y, size.width, 1));
                }
            }
            rows_done += 1;
            ctx.set_progress((rows_done * 100 / total_rows.max(1)).min(100) as u8);
        }

        ctx.set_message("PNG decoding completed successfully");
        ctx.set_progress(100);
        Ok(DecodeOutput {
            surface,
            full_coverage: true,
        })
    }

    fn close(&mut self) {
        self.size = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_normalize_to_bgra() {
        let mut out = vec![0u8; 8];
        bgra_row(&[10, 20, 30, 40, 50, 60], ColorType::Rgb, 2, &mut out).unwrap();
        assert_eq!(out, vec![30, 20, 10, 0xff, 60, 50, 40, 0xff]);

        bgra_row(&[7, 128], ColorType::GrayscaleAlpha, 1, &mut out[..4]).unwrap();
        assert_eq!(&out[..4], &[7, 7, 7, 128]);
    }

    #[test]
    fn short_rows_are_rejected() {
        let mut out = vec![0u8; 8];
        assert!(bgra_row(&[1, 2, 3], ColorType::Rgba, 2, &mut out).is_err());
    }
}
