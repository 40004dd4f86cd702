use serde::{Deserialize, Serialize};

/// Pixel dimensions. `(0, 0)` means "not known yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }

    /// Scales down to fit inside `bound` keeping the aspect ratio. Never
    /// upscales.
    pub fn fitted_in(&self, bound: Size) -> Self {
        if !self.is_valid() || !bound.is_valid() {
            return *self;
        }
        if self.width <= bound.width && self.height <= bound.height {
            return *self;
        }
        let wr = f64::from(bound.width) / f64::from(self.width);
        let hr = f64::from(bound.height) / f64::from(self.height);
        let r = wr.min(hr);
        Self::new(
            ((f64::from(self.width) * r).round() as u32).max(1),
            ((f64::from(self.height) * r).round() as u32).max(1),
        )
    }
}

/// Axis-aligned pixel rectangle in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn intersected(&self, other: Rect) -> Rect {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return Rect::default();
        }
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn contains(&self, other: Rect) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    /// Smallest rectangle covering both. An empty rect is the identity.
    pub fn united(&self, other: Rect) -> Rect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return *self;
        }
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }
}

/// Linear scale between a decoded page's coordinates and the image's full
/// resolution. Pages of multi-resolution files (TIFF pyramids, scaled JPEG
/// output) are smaller than the full image; mapping a page rect "up"
/// multiplies by the scale, mapping a full-res rect "down" divides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageScale {
    pub sx: f64,
    pub sy: f64,
}

impl PageScale {
    pub const IDENTITY: PageScale = PageScale { sx: 1.0, sy: 1.0 };

    /// Scale of a page with `page` dimensions inside a `full`-sized image.
    pub fn for_page(page: Size, full: Size) -> Self {
        if !page.is_valid() || !full.is_valid() {
            return Self::IDENTITY;
        }
        Self {
            sx: f64::from(full.width) / f64::from(page.width),
            sy: f64::from(full.height) / f64::from(page.height),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.sx == 1.0 && self.sy == 1.0
    }

    pub fn page_to_full(&self, r: Rect) -> Rect {
        Rect::new(
            (f64::from(r.x) * self.sx).floor() as u32,
            (f64::from(r.y) * self.sy).floor() as u32,
            (f64::from(r.width) * self.sx).ceil() as u32,
            (f64::from(r.height) * self.sy).ceil() as u32,
        )
    }

    pub fn full_to_page(&self, r: Rect) -> Rect {
        Rect::new(
            (f64::from(r.x) / self.sx).floor() as u32,
            (f64::from(r.y) / self.sy).floor() as u32,
            (f64::from(r.width) / self.sx).ceil() as u32,
            (f64::from(r.height) / self.sy).ceil() as u32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_never_upscales() {
        let s = Size::new(400, 300);
        assert_eq!(s.fitted_in(Size::new(800, 600)), s);
        assert_eq!(s.fitted_in(Size::new(200, 200)), Size::new(200, 150));
    }

    #[test]
    fn intersection_and_union() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 60, 100, 100);
        assert_eq!(a.intersected(b), Rect::new(50, 60, 50, 40));
        assert_eq!(a.united(b), Rect::new(0, 0, 150, 160));
        assert!(a.intersected(Rect::new(200, 200, 10, 10)).is_empty());
    }

    #[test]
    fn containment_treats_empty_as_inside() {
        let full = Rect::new(0, 0, 4000, 3000);
        assert!(full.contains(Rect::new(100, 100, 200, 200)));
        assert!(full.contains(Rect::default()));
        assert!(!full.contains(Rect::new(3900, 0, 200, 10)));
    }

    #[test]
    fn page_scale_round_trips_full_rect() {
        let scale = PageScale::for_page(Size::new(1000, 750), Size::new(4000, 3000));
        let full = Rect::new(0, 0, 4000, 3000);
        assert_eq!(scale.full_to_page(full), Rect::new(0, 0, 1000, 750));
        assert_eq!(scale.page_to_full(Rect::new(0, 0, 1000, 750)), full);
    }
}
