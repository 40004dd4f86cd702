use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Field an image listing can be sectioned or ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    None,
    FileName,
    FileSize,
    FileType,
    DateModified,
    Resolution,
    DateRecorded,
    Aperture,
    Exposure,
    Iso,
    FocalLength,
    Lens,
    CameraModel,
}

impl SortField {
    /// Sorting or sectioning by this field needs EXIF loaded before the
    /// image can be placed, forcing a synchronous metadata decode during
    /// directory discovery.
    pub fn needs_metadata(self) -> bool {
        matches!(
            self,
            SortField::Resolution
                | SortField::DateRecorded
                | SortField::Aperture
                | SortField::Exposure
                | SortField::Iso
                | SortField::FocalLength
                | SortField::Lens
                | SortField::CameraModel
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }
}

/// Compares optional field values with present-before-missing semantics.
/// The direction applies only when both sides are present; a missing value
/// sorts last under either direction.
pub fn cmp_nulls_last<T, F>(a: Option<&T>, b: Option<&T>, order: SortOrder, cmp: F) -> Ordering
where
    F: FnOnce(&T, &T) -> Ordering,
{
    match (a, b) {
        (Some(la), Some(lb)) => order.apply(cmp(la, lb)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Case-insensitive natural filename ordering: runs of ASCII digits compare
/// by numeric value, everything else by lowercased character. Returns
/// `Equal` for names differing only in case; callers break that tie with a
/// byte comparison of the full path.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ia = a.chars().peekable();
    let mut ib = b.chars().peekable();

    loop {
        match (ia.peek().copied(), ib.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let ord = cmp_digit_runs(&mut ia, &mut ib);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                } else {
                    let ord = ca.to_lowercase().cmp(cb.to_lowercase());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    ia.next();
                    ib.next();
                }
            }
        }
    }
}

fn cmp_digit_runs(
    ia: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ib: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Ordering {
    let ra = take_digits(ia);
    let rb = take_digits(ib);
    let sa = ra.trim_start_matches('0');
    let sb = rb.trim_start_matches('0');
    // longer significant run wins, equal length compares digit by digit
    sa.len().cmp(&sb.len()).then_with(|| sa.cmp(sb))
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = it.peek() {
        if c.is_ascii_digit() {
            run.push(*c);
            it.next();
        } else {
            break;
        }
    }
    run
}

/// Key an image is grouped under when the listing is sectioned. The variant
/// follows the section field: dates for modified/recorded, text for
/// letters/types/lenses, numbers for aperture/iso/exposure buckets.
#[derive(Debug, Clone, PartialEq)]
pub enum SectionKey {
    None,
    Date(NaiveDate),
    Text(String),
    Integer(i64),
    Decimal(f64),
}

impl SectionKey {
    pub fn display_name(&self) -> String {
        match self {
            SectionKey::None => String::new(),
            SectionKey::Date(d) => d.format("%Y-%m-%d (%A)").to_string(),
            SectionKey::Text(s) => s.clone(),
            SectionKey::Integer(i) => i.to_string(),
            SectionKey::Decimal(f) => format!("{f}"),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SectionKey::None => 0,
            SectionKey::Date(_) => 1,
            SectionKey::Text(_) => 2,
            SectionKey::Integer(_) => 3,
            SectionKey::Decimal(_) => 4,
        }
    }

    /// Total order so sections can be binary searched. Keys of different
    /// kinds never mix under one sectioning field; the rank ordering only
    /// keeps the comparison total.
    pub fn cmp_key(&self, other: &SectionKey) -> Ordering {
        match (self, other) {
            (SectionKey::Date(a), SectionKey::Date(b)) => a.cmp(b),
            (SectionKey::Text(a), SectionKey::Text(b)) => a.cmp(b),
            (SectionKey::Integer(a), SectionKey::Integer(b)) => a.cmp(b),
            (SectionKey::Decimal(a), SectionKey::Decimal(b)) => a.total_cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_compare_orders_numbers_numerically() {
        assert_eq!(natural_cmp("file2", "file10"), Ordering::Less);
        assert_eq!(natural_cmp("file10", "file2"), Ordering::Greater);
        assert_eq!(natural_cmp("img001", "img1"), Ordering::Equal);
        assert_eq!(natural_cmp("a2b3", "a2b10"), Ordering::Less);
    }

    #[test]
    fn natural_compare_is_case_insensitive() {
        assert_eq!(natural_cmp("FILE", "file"), Ordering::Equal);
        assert_eq!(natural_cmp("Alpha", "beta"), Ordering::Less);
    }

    #[test]
    fn nulls_sort_last_regardless_of_direction() {
        let some = Some(&1.4f64);
        let none: Option<&f64> = None;
        for order in [SortOrder::Ascending, SortOrder::Descending] {
            assert_eq!(
                cmp_nulls_last(some, none, order, |a, b| a.total_cmp(b)),
                Ordering::Less
            );
            assert_eq!(
                cmp_nulls_last(none, some, order, |a, b| a.total_cmp(b)),
                Ordering::Greater
            );
        }
        assert_eq!(
            cmp_nulls_last(Some(&2.8f64), Some(&1.4), SortOrder::Descending, |a, b| a
                .total_cmp(b)),
            Ordering::Less
        );
    }

    #[test]
    fn section_keys_have_a_total_order() {
        let a = SectionKey::Date(NaiveDate::from_ymd_opt(2022, 1, 3).unwrap());
        let b = SectionKey::Date(NaiveDate::from_ymd_opt(2022, 2, 1).unwrap());
        assert_eq!(a.cmp_key(&b), Ordering::Less);
        assert_eq!(
            SectionKey::Text("B".into()).cmp_key(&SectionKey::Text("A".into())),
            Ordering::Greater
        );
        assert_eq!(a.cmp_key(&SectionKey::Text("A".into())), Ordering::Less);
    }
}
