use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::decoders::Decoder;
use crate::image::Image;
use crate::sorting::{cmp_nulls_last, natural_cmp, SectionKey, SortField, SortOrder};

/// One model entry: the image plus the decoder serving it (when any
/// backend accepted the file).
#[derive(Clone)]
pub struct ModelEntry {
    pub image: Arc<Image>,
    pub decoder: Option<Arc<Decoder>>,
}

/// A group heading plus the ordered images grouped under it.
pub struct SectionItem {
    pub key: SectionKey,
    pub entries: Vec<ModelEntry>,
}

impl SectionItem {
    pub fn new(key: SectionKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows this section occupies in the flat index: its header plus its
    /// entries.
    pub fn row_span(&self) -> usize {
        1 + self.entries.len()
    }

    pub fn sort(&mut self, field: SortField, order: SortOrder) {
        // metadata-driven comparisons read the EXIF handle per element;
        // large sections profit from sorting partitions in parallel
        if self.entries.len() >= 2048 {
            use rayon::slice::ParallelSliceMut;
            self.entries
                .par_sort_by(|a, b| cmp_entries(a, b, field, order));
        } else {
            self.entries
                .sort_by(|a, b| cmp_entries(a, b, field, order));
        }
    }

    pub fn insert_position(&self, entry: &ModelEntry, field: SortField, order: SortOrder) -> usize {
        self.entries
            .partition_point(|e| cmp_entries(e, entry, field, order) != Ordering::Greater)
    }

    pub fn position_of(&self, path: &std::path::Path) -> Option<usize> {
        self.entries.iter().position(|e| e.image.path() == path)
    }
}

/// Section ordering: the unkeyed section always leads, everything else
/// follows the section field's order.
pub fn cmp_sections(a: &SectionKey, b: &SectionKey, order: SortOrder) -> Ordering {
    match (a, b) {
        (SectionKey::None, SectionKey::None) => Ordering::Equal,
        (SectionKey::None, _) => Ordering::Less,
        (_, SectionKey::None) => Ordering::Greater,
        _ => order.apply(a.cmp_key(b)),
    }
}

/// Direct-item comparison: directories precede files (always, name
/// ascending among themselves), then the sort field with nulls last, then
/// the natural filename order, with the raw path bytes as final tiebreak.
pub fn cmp_entries(a: &ModelEntry, b: &ModelEntry, field: SortField, order: SortOrder) -> Ordering {
    let (ia, ib) = (&a.image, &b.image);
    match (ia.is_dir(), ib.is_dir()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (true, true) => {
            return natural_cmp(&ia.file_name(), &ib.file_name())
                .then_with(|| ia.path().as_os_str().cmp(ib.path().as_os_str()))
        }
        (false, false) => {}
    }

    let field_ord = cmp_field(ia, ib, field, order);
    if field_ord != Ordering::Equal {
        return field_ord;
    }
    let name_ord = order.apply(natural_cmp(&ia.file_name(), &ib.file_name()));
    if name_ord != Ordering::Equal {
        return name_ord;
    }
    ia.path().as_os_str().cmp(ib.path().as_os_str())
}

fn cmp_field(a: &Arc<Image>, b: &Arc<Image>, field: SortField, order: SortOrder) -> Ordering {
    match field {
        SortField::None | SortField::FileName => Ordering::Equal,
        SortField::FileSize => order.apply(a.stat().size.cmp(&b.stat().size)),
        SortField::FileType => order.apply(
            a.extension()
                .to_ascii_uppercase()
                .cmp(&b.extension().to_ascii_uppercase()),
        ),
        SortField::DateModified => cmp_nulls_last(
            a.stat().modified.as_ref(),
            b.stat().modified.as_ref(),
            order,
            Ord::cmp,
        ),
        SortField::Resolution => cmp_nulls_last(
            a.size().map(|s| s.pixel_count()).as_ref(),
            b.size().map(|s| s.pixel_count()).as_ref(),
            order,
            Ord::cmp,
        ),
        SortField::DateRecorded => cmp_nulls_last(
            a.exif().and_then(|e| e.date_recorded()).as_ref(),
            b.exif().and_then(|e| e.date_recorded()).as_ref(),
            order,
            Ord::cmp,
        ),
        SortField::Aperture => cmp_nulls_last(
            a.exif().and_then(|e| e.aperture()).as_ref(),
            b.exif().and_then(|e| e.aperture()).as_ref(),
            order,
            f64::total_cmp,
        ),
        SortField::Exposure => cmp_nulls_last(
            a.exif().and_then(|e| e.exposure_time()).map(|e| e.seconds()).as_ref(),
            b.exif().and_then(|e| e.exposure_time()).map(|e| e.seconds()).as_ref(),
            order,
            f64::total_cmp,
        ),
        SortField::Iso => cmp_nulls_last(
            a.exif().and_then(|e| e.iso()).as_ref(),
            b.exif().and_then(|e| e.iso()).as_ref(),
            order,
            Ord::cmp,
        ),
        SortField::FocalLength => cmp_nulls_last(
            a.exif().and_then(|e| e.focal_length()).as_ref(),
            b.exif().and_then(|e| e.focal_length()).as_ref(),
            order,
            f64::total_cmp,
        ),
        SortField::Lens => cmp_nulls_last(
            a.exif().and_then(|e| e.lens()).as_ref(),
            b.exif().and_then(|e| e.lens()).as_ref(),
            order,
            Ord::cmp,
        ),
        SortField::CameraModel => cmp_nulls_last(
            a.exif().and_then(|e| e.camera_model()).as_ref(),
            b.exif().and_then(|e| e.camera_model()).as_ref(),
            order,
            Ord::cmp,
        ),
    }
}

/// The key an image is grouped under for the active section field.
pub fn section_key(image: &Arc<Image>, field: SortField) -> SectionKey {
    match field {
        SortField::FileName => {
            let name = image.file_name();
            match name.chars().next() {
                Some(c) if c.is_ascii_digit() => SectionKey::Text("#".to_string()),
                Some(c) => SectionKey::Text(c.to_uppercase().to_string()),
                None => SectionKey::None,
            }
        }
        SortField::FileType => {
            let ext = image.extension().to_ascii_uppercase();
            if ext.is_empty() {
                SectionKey::None
            } else {
                SectionKey::Text(ext)
            }
        }
        SortField::DateModified => image
            .stat()
            .modified
            .map(|t| SectionKey::Date(DateTime::<Local>::from(t).date_naive()))
            .unwrap_or(SectionKey::None),
        SortField::DateRecorded => image
            .exif()
            .and_then(|e| e.date_recorded())
            .map(|dt| SectionKey::Date(dt.date()))
            .unwrap_or(SectionKey::None),
        SortField::Aperture => image
            .exif()
            .and_then(|e| e.aperture())
            .map(SectionKey::Decimal)
            .unwrap_or(SectionKey::None),
        SortField::Exposure => image
            .exif()
            .and_then(|e| e.exposure_time())
            .map(|e| SectionKey::Decimal(e.seconds()))
            .unwrap_or(SectionKey::None),
        SortField::Iso => image
            .exif()
            .and_then(|e| e.iso())
            .map(SectionKey::Integer)
            .unwrap_or(SectionKey::None),
        SortField::FocalLength => image
            .exif()
            .and_then(|e| e.focal_length())
            .map(SectionKey::Decimal)
            .unwrap_or(SectionKey::None),
        SortField::Lens => image
            .exif()
            .and_then(|e| e.lens())
            .map(SectionKey::Text)
            .unwrap_or(SectionKey::None),
        SortField::CameraModel => image
            .exif()
            .and_then(|e| e.camera_model())
            .map(SectionKey::Text)
            .unwrap_or(SectionKey::None),
        SortField::None | SortField::FileSize | SortField::Resolution => SectionKey::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FileStat;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};

    fn entry(name: &str) -> ModelEntry {
        ModelEntry {
            image: Image::new(PathBuf::from(format!("/d/{name}")), FileStat::default()),
            decoder: None,
        }
    }

    fn entry_with_mtime(name: &str, secs: u64) -> ModelEntry {
        let stat = FileStat {
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
            ..FileStat::default()
        };
        ModelEntry {
            image: Image::new(PathBuf::from(format!("/d/{name}")), stat),
            decoder: None,
        }
    }

    #[test]
    fn name_sort_is_natural_and_case_insensitive() {
        let a = entry("file2.jpg");
        let b = entry("file10.jpg");
        assert_eq!(
            cmp_entries(&a, &b, SortField::FileName, SortOrder::Ascending),
            Ordering::Less
        );
        assert_eq!(
            cmp_entries(&a, &b, SortField::FileName, SortOrder::Descending),
            Ordering::Greater
        );
    }

    #[test]
    fn equal_mtime_falls_back_to_natural_name() {
        let mut entries = vec![
            entry_with_mtime("c10.jpg", 1000),
            entry_with_mtime("c2.jpg", 1000),
            entry_with_mtime("a1.jpg", 1000),
        ];
        entries.sort_by(|a, b| cmp_entries(a, b, SortField::DateModified, SortOrder::Ascending));
        let names: Vec<_> = entries.iter().map(|e| e.image.file_name()).collect();
        assert_eq!(names, vec!["a1.jpg", "c2.jpg", "c10.jpg"]);
    }

    #[test]
    fn missing_mtime_sorts_last_in_both_directions() {
        let present = entry_with_mtime("a.jpg", 1000);
        let missing = entry("b.jpg");
        for order in [SortOrder::Ascending, SortOrder::Descending] {
            assert_eq!(
                cmp_entries(&present, &missing, SortField::DateModified, order),
                Ordering::Less
            );
        }
    }

    #[test]
    fn filename_section_keys_bucket_digits() {
        let img = entry("2022-01.jpg").image;
        assert_eq!(
            section_key(&img, SortField::FileName),
            SectionKey::Text("#".to_string())
        );
        let img = entry("berlin.jpg").image;
        assert_eq!(
            section_key(&img, SortField::FileName),
            SectionKey::Text("B".to_string())
        );
    }

    #[test]
    fn unkeyed_section_always_leads() {
        for order in [SortOrder::Ascending, SortOrder::Descending] {
            assert_eq!(
                cmp_sections(&SectionKey::None, &SectionKey::Text("A".into()), order),
                Ordering::Less
            );
        }
    }
}
