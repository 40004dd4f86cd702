//! End-to-end pipeline tests: decoders driven against synthesized files,
//! the scheduler's cancellation contract, and the model observed through
//! its event bus.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use image::ImageEncoder;

use crate::decoders::{self, DecodingState};
use crate::events::{ImageEvent, ModelEvent};
use crate::geometry::{Rect, Size};
use crate::image::{FileStat, Image, ViewFlags};
use crate::model::{ImageModel, Row};
use crate::pool::{DecodePool, Priority};
use crate::sorting::{SortField, SortOrder};

fn uniq_dir(label: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("proofsheet-e2e-{label}-{ts}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn gradient_rgb(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push((x % 256) as u8);
            data.push((y % 256) as u8);
            data.push(((x + y) % 256) as u8);
        }
    }
    data
}

fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 80);
    encoder
        .write_image(
            &gradient_rgb(width, height),
            width,
            height,
            image::ExtendedColorType::Rgb8,
        )
        .unwrap();
    buf.into_inner()
}

fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, width, height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer
            .write_image_data(&gradient_rgb(width, height))
            .unwrap();
    }
    buf
}

fn encode_tiff(width: u32, height: u32) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut encoder = tiff::encoder::TiffEncoder::new(&mut cursor).unwrap();
        encoder
            .write_image::<tiff::encoder::colortype::RGB8>(
                width,
                height,
                &gradient_rgb(width, height),
            )
            .unwrap();
    }
    cursor.into_inner()
}

/// CR2-shaped container: little-endian TIFF header with the Canon
/// signature, one IFD whose strip tags point at a real JPEG payload.
fn encode_cr2(jpeg: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x49, 0x49, 0x2a, 0x00]);
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&[b'C', b'R', 0x02, 0x00]);
    out.extend_from_slice(&[0, 0, 0, 0]);

    let ifd_len = 2 + 2 * 12 + 4;
    let payload_off = (16 + ifd_len) as u32;
    out.extend_from_slice(&2u16.to_le_bytes());
    for (tag, value) in [(0x0111u16, payload_off), (0x0117, jpeg.len() as u32)] {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(jpeg);
    out
}

/// Splits `profile` over `chunks` APP2 markers right behind SOI.
fn inject_icc_chunks(jpeg: &[u8], profile: &[u8], chunks: usize) -> Vec<u8> {
    assert!(jpeg.starts_with(&[0xff, 0xd8]));
    let mut out = vec![0xff, 0xd8];
    let per = profile.len().div_ceil(chunks);
    for (i, chunk) in profile.chunks(per).enumerate() {
        let payload_len = 12 + 2 + chunk.len();
        out.extend_from_slice(&[0xff, 0xe2]);
        out.extend_from_slice(&((payload_len + 2) as u16).to_be_bytes());
        out.extend_from_slice(b"ICC_PROFILE\0");
        out.push((i + 1) as u8);
        out.push(chunks as u8);
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(&jpeg[2..]);
    out
}

fn write_file(path: &Path, data: &[u8]) {
    std::fs::write(path, data).unwrap();
}

fn open_image(path: &Path) -> Arc<Image> {
    Image::from_path(path).unwrap()
}

#[test]
fn progressive_jpeg_decodes_scaled_preview() {
    let dir = uniq_dir("jpeg-preview");
    let path = dir.join("photo.jpg");
    write_file(&path, &encode_jpeg(400, 300));

    let image = open_image(&path);
    let events = image.events().subscribe();
    let decoder = decoders::create_decoder(&image).expect("jpeg decoder");

    decoder.open().unwrap();
    let state = decoder.decode(
        DecodingState::FullImage,
        Some(Size::new(200, 150)),
        None,
    );
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::PreviewImage);
    assert_eq!(image.size(), Some(Size::new(400, 300)));
    assert_eq!(image.decoded_roi(), Rect::new(0, 0, 400, 300));
    let surface = image.surface().unwrap();
    assert_eq!(surface.size(), Size::new(200, 150));

    let collected: Vec<ImageEvent> = events.try_iter().collect();
    let metadata_events = collected
        .iter()
        .filter(|e| {
            matches!(
                e,
                ImageEvent::StateChanged {
                    new: DecodingState::Metadata,
                    ..
                }
            )
        })
        .count();
    assert_eq!(metadata_events, 1);
    assert!(collected
        .iter()
        .any(|e| matches!(e, ImageEvent::DecodedRegionGrew { .. })));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unscaled_jpeg_reaches_full_image() {
    let dir = uniq_dir("jpeg-full");
    let path = dir.join("photo.jpg");
    write_file(&path, &encode_jpeg(64, 48));

    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();
    decoder.open().unwrap();
    let state = decoder.decode(DecodingState::FullImage, None, None);
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::FullImage);
    assert_eq!(image.decoded_roi(), Rect::new(0, 0, 64, 48));
    // a decode without an embedded thumbnail derives one from the surface
    assert!(image.thumbnail().is_some());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn icc_profile_survives_chunked_app2_markers() {
    let dir = uniq_dir("jpeg-icc");
    let profile: Vec<u8> = (0u8..90).collect();
    let path = dir.join("tagged.jpg");
    write_file(&path, &inject_icc_chunks(&encode_jpeg(32, 32), &profile, 3));

    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();
    decoder.open().unwrap();
    let state = decoder.decode(DecodingState::Metadata, None, None);
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::Metadata);
    assert_eq!(image.icc_profile(), Some(profile));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn tiff_decodes_and_reports_full_coverage() {
    let dir = uniq_dir("tiff-full");
    let path = dir.join("scan.tif");
    write_file(&path, &encode_tiff(120, 80));

    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();
    decoder.open().unwrap();
    let state = decoder.decode(DecodingState::FullImage, None, None);
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::FullImage);
    assert_eq!(image.size(), Some(Size::new(120, 80)));
    assert_eq!(image.decoded_roi(), Rect::new(0, 0, 120, 80));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn tiff_roi_decode_stays_preview() {
    let dir = uniq_dir("tiff-roi");
    let path = dir.join("scan.tif");
    write_file(&path, &encode_tiff(200, 100));

    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();
    decoder.open().unwrap();
    let roi = Rect::new(50, 25, 100, 50);
    let state = decoder.decode(DecodingState::FullImage, None, Some(roi));
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::PreviewImage);
    let surface = image.surface().unwrap();
    assert_eq!(surface.offset(), (50, 25));
    // the decoded region stays inside the full-resolution rectangle
    assert!(Rect::new(0, 0, 200, 100).contains(image.decoded_roi()));
    assert!(!image.decoded_roi().is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn png_decode_covers_every_row() {
    let dir = uniq_dir("png-full");
    let path = dir.join("shot.png");
    write_file(&path, &encode_png(33, 17));

    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();
    decoder.open().unwrap();
    let state = decoder.decode(DecodingState::FullImage, None, None);
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::FullImage);
    assert_eq!(image.decoded_roi(), Rect::new(0, 0, 33, 17));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cr2_preview_is_served_by_the_jpeg_backend() {
    let dir = uniq_dir("cr2");
    let path = dir.join("IMG_0042.CR2");
    write_file(&path, &encode_cr2(&encode_jpeg(80, 60)));

    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).expect("cr2 decoder");
    decoder.open().unwrap();
    let state = decoder.decode(DecodingState::FullImage, None, None);
    decoder.close().unwrap();

    assert_eq!(state, DecodingState::FullImage);
    assert_eq!(image.size(), Some(Size::new(80, 60)));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn raw_without_canon_signature_gets_no_decoder() {
    let dir = uniq_dir("raw-unknown");
    let path = dir.join("shot.nef");
    write_file(&path, &encode_tiff(16, 16));

    let image = open_image(&path);
    assert!(decoders::create_decoder(&image).is_none());
    assert!(!image.has_decoder());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn decode_async_same_target_shares_the_future() {
    let dir = uniq_dir("async-dedup");
    let pool = DecodePool::with_threads(2);

    // park enough work ahead so the probe task stays queued
    let mut blockers = Vec::new();
    for i in 0..4 {
        let path = dir.join(format!("blocker{i}.png"));
        write_file(&path, &encode_png(1200, 900));
        let image = open_image(&path);
        let decoder = decoders::create_decoder(&image).unwrap();
        blockers.push(decoder.decode_async(
            &pool,
            DecodingState::FullImage,
            Priority::Normal,
            None,
            None,
        ));
    }

    let path = dir.join("probe.png");
    write_file(&path, &encode_png(32, 32));
    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();

    let f1 = decoder.decode_async(
        &pool,
        DecodingState::FullImage,
        Priority::Background,
        None,
        None,
    );
    let f2 = decoder.decode_async(
        &pool,
        DecodingState::FullImage,
        Priority::Background,
        None,
        None,
    );
    assert_eq!(f1.id(), f2.id());

    let final_state = f1.wait();
    assert!(matches!(
        final_state,
        DecodingState::FullImage | DecodingState::Cancelled
    ));
    for b in blockers {
        b.wait();
    }
    pool.shutdown(Duration::from_secs(5));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn reset_is_refused_while_a_task_is_in_flight() {
    let dir = uniq_dir("reset-running");
    let pool = DecodePool::with_threads(2);

    let mut blockers = Vec::new();
    for i in 0..4 {
        let path = dir.join(format!("blocker{i}.png"));
        write_file(&path, &encode_png(1600, 1200));
        let image = open_image(&path);
        let decoder = decoders::create_decoder(&image).unwrap();
        blockers.push(decoder.decode_async(
            &pool,
            DecodingState::FullImage,
            Priority::Important,
            None,
            None,
        ));
    }

    let path = dir.join("probe.png");
    write_file(&path, &encode_png(48, 48));
    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();
    let fut = decoder.decode_async(
        &pool,
        DecodingState::FullImage,
        Priority::Background,
        None,
        None,
    );

    let err = decoder.reset().expect_err("reset while in flight");
    assert_eq!(err.code(), decoders::DecodeErrorCode::Programming);

    // the future still runs to completion
    let state = fut.wait();
    assert!(matches!(
        state,
        DecodingState::FullImage | DecodingState::Cancelled
    ));
    for b in blockers {
        b.wait();
    }
    pool.shutdown(Duration::from_secs(5));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cancel_or_take_leaves_a_terminal_future_and_reset_recovers() {
    let dir = uniq_dir("cancel");
    let pool = DecodePool::with_threads(2);

    let mut blockers = Vec::new();
    for i in 0..4 {
        let path = dir.join(format!("blocker{i}.png"));
        write_file(&path, &encode_png(1200, 900));
        let image = open_image(&path);
        let decoder = decoders::create_decoder(&image).unwrap();
        blockers.push(decoder.decode_async(
            &pool,
            DecodingState::FullImage,
            Priority::Important,
            None,
            None,
        ));
    }

    let path = dir.join("victim.tif");
    write_file(&path, &encode_tiff(300, 200));
    let image = open_image(&path);
    let decoder = decoders::create_decoder(&image).unwrap();

    // reach metadata first so reset has something to fall back to
    decoder.open().unwrap();
    assert_eq!(
        decoder.decode(DecodingState::Metadata, None, None),
        DecodingState::Metadata
    );
    decoder.close().unwrap();

    let fut = decoder.decode_async(
        &pool,
        DecodingState::FullImage,
        Priority::Background,
        None,
        None,
    );
    decoder.cancel_or_take(&pool, &fut);
    assert!(fut.is_finished());

    for b in blockers {
        b.wait();
    }
    // terminal; dimensions survive a reset back to Metadata
    decoder.reset().unwrap();
    assert_eq!(image.decoding_state(), DecodingState::Metadata);
    assert_eq!(image.size(), Some(Size::new(300, 200)));
    assert!(image.surface().is_none());

    pool.shutdown(Duration::from_secs(5));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn model_linear_index_is_a_bijection() {
    let model = ImageModel::new();
    let stat = FileStat::default();
    for name in ["a.jpg", "b.jpg", "c.png", "d.tif"] {
        let image = Image::new(PathBuf::from(format!("/photos/{name}")), stat);
        model.welcome_image(image, None, None);
    }

    let count = model.row_count();
    assert_eq!(count, 5); // one unkeyed section header + 4 images
    let mut seen = Vec::new();
    for i in 0..count {
        match model.row(i).expect("row resolves") {
            Row::Section(_) => assert_eq!(i, 0),
            Row::Image(entry) => {
                assert_eq!(model.index_of_image(entry.image.id()), Some(i));
                seen.push(entry.image.file_name());
            }
        }
    }
    assert_eq!(seen.len(), 4);
    assert!(model.row(count).is_none());
}

#[test]
fn identical_mtimes_sort_by_natural_name() {
    let model = ImageModel::new();
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let stat = FileStat {
        modified: Some(mtime),
        ..FileStat::default()
    };
    let mut names: Vec<String> = (0..1000).map(|i| format!("img{i}.jpg")).collect();
    // insert shuffled deterministically
    names.reverse();
    names.swap(0, 500);
    for name in &names {
        let image = Image::new(PathBuf::from(format!("/photos/{name}")), stat);
        model.welcome_image(image, None, None);
    }

    model.sort_images(SortField::DateModified, SortOrder::Ascending);

    let sorted: Vec<String> = (0..model.row_count())
        .filter_map(|i| model.image_at(i))
        .map(|img| img.file_name())
        .collect();
    let mut expected = names.clone();
    expected.sort_by(|a, b| crate::sorting::natural_cmp(a, b));
    assert_eq!(sorted, expected);

    // re-sorting with the same field and order is a fixpoint
    model.sort_images(SortField::DateModified, SortOrder::Ascending);
    let resorted: Vec<String> = (0..model.row_count())
        .filter_map(|i| model.image_at(i))
        .map(|img| img.file_name())
        .collect();
    assert_eq!(sorted, resorted);
}

#[test]
fn sectioning_by_file_type_groups_and_orders() {
    let model = ImageModel::new();
    model.sort_sections(SortField::FileType, SortOrder::Ascending);
    let stat = FileStat::default();
    for name in ["a.png", "b.jpg", "c.png", "d.jpg"] {
        model.welcome_image(
            Image::new(PathBuf::from(format!("/p/{name}")), stat),
            None,
            None,
        );
    }

    let mut layout = Vec::new();
    for i in 0..model.row_count() {
        match model.row(i).unwrap() {
            Row::Section(key) => layout.push(format!("[{}]", key.display_name())),
            Row::Image(e) => layout.push(e.image.file_name()),
        }
    }
    assert_eq!(
        layout,
        vec!["[JPG]", "b.jpg", "d.jpg", "[PNG]", "a.png", "c.png"]
    );
}

#[test]
fn checked_images_gate_directory_changes() {
    let model = ImageModel::new();
    let image = Image::new(PathBuf::from("/p/a.jpg"), FileStat::default());
    model.welcome_image(image.clone(), None, None);

    assert!(model.is_safe_to_change_dir());
    model.set_check_state(&image, crate::image::CheckState::Checked);
    assert!(!model.is_safe_to_change_dir());
    assert_eq!(model.checked_images(), vec![image.id()]);
    model.set_check_state(&image, crate::image::CheckState::Unchecked);
    assert!(model.is_safe_to_change_dir());
}

#[test]
fn directory_discovery_pairs_and_reconciles() {
    let dir = uniq_dir("discovery");
    write_file(&dir.join("a.cr2"), &encode_cr2(&encode_jpeg(40, 30)));
    write_file(&dir.join("a.jpg"), &encode_jpeg(40, 30));
    write_file(&dir.join("b.tif"), &encode_tiff(24, 24));

    let model = ImageModel::new();
    model.set_view_flags(ViewFlags::COMBINE_RAW_JPEG);
    let pool = Arc::new(DecodePool::with_threads(2));
    let worker = crate::dirworker::DirectoryWorker::new(model.clone(), pool.clone());

    let events = model.events().subscribe();
    let state = worker.change_dir(&dir).wait();
    assert_eq!(state, DecodingState::FullImage);

    // header + three files
    assert_eq!(model.row_count(), 4);
    let find = |name: &str| -> Arc<Image> {
        (0..model.row_count())
            .filter_map(|i| model.image_at(i))
            .find(|img| img.file_name() == name)
            .unwrap()
    };
    let cr2 = find("a.cr2");
    assert!(cr2.has_jpeg_sibling());
    assert!(cr2.hide_if_non_raw_available(model.view_flags()));
    let cr2_index = model.index_of_image(cr2.id()).unwrap();
    assert!(!model.row_data(cr2_index).unwrap().enabled);

    let inserts = events
        .try_iter()
        .filter(|e| matches!(e, ModelEvent::RowsInserted { .. }))
        .count();
    assert!(inserts >= 3);

    // deletion reconciles: the jpg row disappears, the raw pairs off
    std::fs::remove_file(dir.join("a.jpg")).unwrap();
    worker.request_reconcile();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while model.row_count() != 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(model.row_count(), 3);
    assert!(!cr2.has_jpeg_sibling());
    assert!(!cr2.hide_if_non_raw_available(model.view_flags()));
    let cr2_index = model.index_of_image(cr2.id()).unwrap();
    assert!(model.row_data(cr2_index).unwrap().enabled);

    drop(worker);
    pool.shutdown(Duration::from_secs(5));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn changing_directory_cancels_the_previous_discovery() {
    let dir_a = uniq_dir("switch-a");
    let dir_b = uniq_dir("switch-b");
    for i in 0..8 {
        write_file(&dir_a.join(format!("a{i}.png")), &encode_png(16, 16));
        write_file(&dir_b.join(format!("b{i}.png")), &encode_png(16, 16));
    }

    let model = ImageModel::new();
    let pool = Arc::new(DecodePool::with_threads(2));
    let worker = crate::dirworker::DirectoryWorker::new(model.clone(), pool.clone());

    let first = worker.change_dir(&dir_a);
    let second = worker.change_dir(&dir_b);
    let first_state = first.wait();
    assert!(matches!(
        first_state,
        DecodingState::Cancelled | DecodingState::FullImage
    ));
    assert_eq!(second.wait(), DecodingState::FullImage);
    assert_eq!(model.row_count(), 9);

    drop(worker);
    pool.shutdown(Duration::from_secs(5));
    let _ = std::fs::remove_dir_all(&dir_a);
    let _ = std::fs::remove_dir_all(&dir_b);
}

#[test]
fn missing_directory_resolves_to_error() {
    let model = ImageModel::new();
    let pool = Arc::new(DecodePool::with_threads(2));
    let worker = crate::dirworker::DirectoryWorker::new(model, pool.clone());

    let state = worker
        .change_dir(Path::new("/definitely/not/a/real/directory"))
        .wait();
    assert_eq!(state, DecodingState::Error);

    drop(worker);
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn pool_shutdown_drains_queued_tasks_as_cancelled() {
    let dir = uniq_dir("shutdown");
    let pool = DecodePool::with_threads(2);
    let mut futures = Vec::new();
    for i in 0..6 {
        let path = dir.join(format!("f{i}.png"));
        write_file(&path, &encode_png(600, 400));
        let image = open_image(&path);
        let decoder = decoders::create_decoder(&image).unwrap();
        futures.push(decoder.decode_async(
            &pool,
            DecodingState::FullImage,
            Priority::Background,
            None,
            None,
        ));
    }
    pool.shutdown(Duration::from_secs(5));
    for fut in futures {
        let state = fut.wait();
        assert!(matches!(
            state,
            DecodingState::Cancelled | DecodingState::FullImage | DecodingState::PreviewImage
        ));
    }
    let _ = std::fs::remove_dir_all(&dir);
}
