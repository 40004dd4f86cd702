//! JPEG backend on libjpeg (mozjpeg). Buffered-image mode so progressive
//! scans surface as refinement passes, BGRX output for uniform downstream
//! handling, DCT scaling approximating the requested resolution without
//! ever upscaling.
//!
//! libjpeg reports errors through a non-returning callback; the error
//! manager here converts them into unwinds that are caught at each FFI
//! boundary, so buffers are released through normal drops.

use std::ffi::{c_int, c_uint, c_ulong, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};

use mozjpeg_sys::{
    jpeg_calc_output_dimensions, jpeg_common_struct, jpeg_create_decompress,
    jpeg_decompress_struct, jpeg_destroy_decompress, jpeg_error_mgr, jpeg_finish_decompress,
    jpeg_finish_output, jpeg_input_complete, jpeg_mem_src, jpeg_read_header, jpeg_read_icc_profile,
    jpeg_read_scanlines, jpeg_save_markers, jpeg_start_decompress, jpeg_start_output,
    jpeg_std_error, J_COLOR_SPACE, J_DCT_METHOD,
};

use super::{Codec, DecodeContext, DecodeError, DecodeOutput, DecodeResult};
use crate::geometry::{PageScale, Rect, Size};
use crate::image::{Surface, SURFACE_BYTES_PER_PIXEL};

/// DoS guard: a valid progressive file has a handful of scans, corrupt
/// ones can claim thousands.
const MAX_PROGRESSIVE_SCANS: u32 = 1000;

/// APP0 marker code; the ICC profile lives in APP2.
const JPEG_APP0: c_int = 0xe0;

extern "C-unwind" fn unwind_error_exit(_cinfo: &mut jpeg_common_struct) {
    std::panic::resume_unwind(Box::new(()));
}

extern "C-unwind" fn silence_message(_cinfo: &mut jpeg_common_struct, _msg_level: c_int) {}

fn new_err() -> Box<jpeg_error_mgr> {
    // the FFI call expects zeroed memory to start from
    unsafe {
        let mut err: Box<jpeg_error_mgr> = Box::new(std::mem::zeroed());
        jpeg_std_error(&mut err);
        err.error_exit = Some(unwind_error_exit);
        err.emit_message = Some(silence_message);
        err
    }
}

fn guarded<T>(what: &str, f: impl FnOnce() -> T) -> DecodeResult<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| DecodeError::decode(what.to_string()))
}

struct JpegState {
    cinfo: Box<jpeg_decompress_struct>,
    err: Box<jpeg_error_mgr>,
    icc: Option<Vec<u8>>,
    /// False once the decompressor consumed its input; the next pass needs
    /// a fresh header parse.
    header_ready: bool,
}

impl JpegState {
    fn create() -> Self {
        let mut err = new_err();
        // zeroed memory per the create contract; the struct is boxed so
        // libjpeg's internal pointers stay valid across calls
        let mut cinfo: Box<jpeg_decompress_struct> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe {
            cinfo.common.err = std::ptr::addr_of_mut!(*err);
            jpeg_create_decompress(&mut *cinfo);
        }
        Self {
            cinfo,
            err,
            icc: None,
            header_ready: false,
        }
    }
}

impl Drop for JpegState {
    fn drop(&mut self) {
        unsafe {
            jpeg_destroy_decompress(&mut *self.cinfo);
        }
        let _ = &self.err;
    }
}

// the decompress struct carries raw pointers; all access goes through the
// decoder's codec lock, one thread at a time
unsafe impl Send for JpegState {}

pub(crate) struct JpegCodec {
    state: Option<JpegState>,
}

impl JpegCodec {
    pub(crate) fn new() -> Self {
        Self { state: None }
    }

    fn parse_header(&mut self, ctx: &mut DecodeContext<'_>, data: &[u8]) -> DecodeResult<()> {
        self.state = None;
        let mut state = JpegState::create();
        let cinfo: &mut jpeg_decompress_struct = &mut state.cinfo;

        ctx.set_message("Reading JPEG header");
        let ret = guarded("Error while decoding the JPEG header", || unsafe {
            // keep APP2 so the ICC chunks survive into the marker list
            jpeg_save_markers(&mut *cinfo, JPEG_APP0 as c_int + 2, 0xffff);
            jpeg_mem_src(&mut *cinfo, data.as_ptr(), data.len() as c_ulong);
            jpeg_read_header(&mut *cinfo, 1)
        })?;
        if ret != 1 {
            return Err(DecodeError::header(format!(
                "jpeg_read_header() failed with code {ret}"
            )));
        }

        state.icc = guarded("Error while reading the ICC profile", || unsafe {
            let mut ptr: *mut u8 = std::ptr::null_mut();
            let mut len: c_uint = 0;
            if jpeg_read_icc_profile(&mut *cinfo, &mut ptr, &mut len) != 0 && !ptr.is_null() {
                let profile = std::slice::from_raw_parts(ptr, len as usize).to_vec();
                libc::free(ptr.cast::<c_void>());
                Some(profile)
            } else {
                None
            }
        })?;

        // buffered-image mode makes each progressive scan observable
        cinfo.buffered_image = 1;
        cinfo.out_color_space = J_COLOR_SPACE::JCS_EXT_BGRX;
        state.header_ready = true;

        ctx.image()
            .set_size(Size::new(cinfo.image_width, cinfo.image_height));
        if let Some(icc) = &state.icc {
            ctx.image().set_icc_profile(icc.clone());
        }
        self.state = Some(state);
        Ok(())
    }
}

impl Codec for JpegCodec {
    fn decode_header(&mut self, ctx: &mut DecodeContext<'_>, data: &[u8]) -> DecodeResult<()> {
        self.parse_header(ctx, data)
    }

    fn decoding_loop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        data: &[u8],
        desired: Option<Size>,
        roi: Option<Rect>,
    ) -> DecodeResult<DecodeOutput> {
        if self.state.as_ref().map(|s| !s.header_ready).unwrap_or(true) {
            self.parse_header(ctx, data)?;
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| DecodeError::programming("decoding without a parsed header"))?;
        state.header_ready = false;
        let cinfo: &mut jpeg_decompress_struct = &mut state.cinfo;

        let full = Size::new(cinfo.image_width, cinfo.image_height);
        let full_rect = Rect::from_size(full);
        let roi_rect = roi
            .map(|r| r.intersected(full_rect))
            .filter(|r| !r.is_empty())
            .unwrap_or(full_rect);
        let desired = desired.filter(Size::is_valid).unwrap_or(roi_rect.size());

        cinfo.dct_method = J_DCT_METHOD::JDCT_ISLOW;
        cinfo.do_fancy_upsampling = 1;
        cinfo.do_block_smoothing = 0;
        cinfo.scale_num = desired.width;
        cinfo.scale_denom = roi_rect.width;
        if cinfo.scale_num >= cinfo.scale_denom {
            // never upscale while decoding
            cinfo.scale_num = 1;
            cinfo.scale_denom = 1;
        }

        guarded("Error while computing JPEG output dimensions", || unsafe {
            jpeg_calc_output_dimensions(&mut *cinfo);
        })?;
        let out_w = cinfo.output_width;
        let out_h = cinfo.output_height;
        if out_w == 0 || out_h == 0 {
            return Err(DecodeError::decode("JPEG output dimensions are empty"));
        }
        let scale = PageScale::for_page(Size::new(out_w, out_h), full);

        // the surface covers the roi at output scale
        let mapped = scale.full_to_page(roi_rect);
        let mapped = mapped.intersected(Rect::new(0, 0, out_w, out_h));
        if mapped.is_empty() {
            return Err(DecodeError::decode("Region of interest maps to nothing"));
        }
        ctx.set_message("Allocating image output buffer");
        let surface = Surface::new(mapped.size(), (roi_rect.x, roi_rect.y), scale).ok_or_else(
            || {
                DecodeError::decode(format!(
                    "Unable to allocate the decoded image buffer for {}x{} px",
                    mapped.width, mapped.height
                ))
            },
        )?;
        ctx.begin_preview(&surface);
        ctx.poll_cancel()?;

        ctx.set_message("Starting the JPEG decompressor");
        let started = guarded("Error while starting the JPEG decompressor", || unsafe {
            jpeg_start_decompress(&mut *cinfo)
        })?;
        if started == 0 {
            tracing::warn!("I/O suspension after jpeg_start_decompress()");
        }

        match cinfo.output_components {
            4 => {}
            n => {
                return Err(DecodeError::decode(format!(
                    "Unsupported number of pixel color components: {n}"
                )))
            }
        }

        ctx.set_message("Consuming and decoding the JPEG input");
        let rec_rows = (cinfo.rec_outbuf_height as usize).max(1);
        let row_stride = out_w as usize * SURFACE_BYTES_PER_PIXEL;
        let mut chunk = vec![0u8; row_stride * rec_rows];
        let mut row_ptrs: Vec<*mut u8> = (0..rec_rows)
            .map(|i| chunk[i * row_stride..].as_mut_ptr())
            .collect();

        let mut scans: u32 = 0;
        loop {
            let complete =
                guarded("Error while querying JPEG input state", || unsafe {
                    jpeg_input_complete(&mut *cinfo)
                })? != 0;
            if complete {
                break;
            }
            scans += 1;
            if scans > MAX_PROGRESSIVE_SCANS {
                return Err(DecodeError::decode("progressive decoding aborted"));
            }
            ctx.poll_cancel()?;

            let scan_number = cinfo.input_scan_number;
            guarded("Error while starting a JPEG output pass", || unsafe {
                jpeg_start_output(&mut *cinfo, scan_number);
            })?;

            while cinfo.output_scanline < out_h {
                let row0 = cinfo.output_scanline;
                let lines = guarded("Error while decoding JPEG scanlines", || unsafe {
                    jpeg_read_scanlines(&mut *cinfo, row_ptrs.as_mut_ptr(), rec_rows as u32)
                })?;
                if lines == 0 {
                    return Err(DecodeError::decode("JPEG decoder made no progress"));
                }
                ctx.poll_cancel()?;

                let rows = Rect::new(0, row0, out_w, lines);
                let target = rows.intersected(mapped);
                if !target.is_empty() {
                    let src_off = (target.y - row0) as usize * row_stride
                        + target.x as usize * SURFACE_BYTES_PER_PIXEL;
                    surface.write_rect(
                        Rect::new(
                            target.x - mapped.x,
                            target.y - mapped.y,
                            target.width,
                            target.height,
                        ),
                        &chunk[src_off..],
                        row_stride,
                    );
                    ctx.publish_refinement(scale.page_to_full(target));
                }
                let percent = ((row0 + lines) as u64 * 100 / u64::from(out_h)) as u8;
                ctx.set_progress(percent);
            }

            guarded("Error while finishing a JPEG output pass", || unsafe {
                jpeg_finish_output(&mut *cinfo);
            })?;
        }

        guarded("Error while finishing JPEG decompression", || unsafe {
            jpeg_finish_decompress(&mut *cinfo);
        })?;

        ctx.set_message("JPEG decoding completed successfully");
        ctx.set_progress(100);

        let full_coverage =
            out_w == full.width && out_h == full.height && roi_rect == full_rect;
        Ok(DecodeOutput {
            surface,
            full_coverage,
        })
    }

    fn close(&mut self) {
        self.state = None;
    }
}
