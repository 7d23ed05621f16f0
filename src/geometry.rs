//! Pixel-space geometry for seat regions and detection boxes.
//!
//! All coordinates are integer pixels in the source frame. Rectangles are
//! stored as top-left corner plus width/height, matching the seat catalog and
//! the record format.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<[i32; 2]> for Point {
    fn from(v: [i32; 2]) -> Self {
        Self { x: v[0], y: v[1] }
    }
}

impl From<Point> for [i32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned rectangle (top-left + size).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> i64 {
        if self.w <= 0 || self.h <= 0 {
            return 0;
        }
        self.w as i64 * self.h as i64
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.h)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2, self.y + self.h / 2)
    }

    /// Top-left, top-right, bottom-left, bottom-right.
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x, self.y),
            Point::new(self.right(), self.y),
            Point::new(self.x, self.bottom()),
            Point::new(self.right(), self.bottom()),
        ]
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        Rect::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
    }

    /// Intersection-over-union. Degenerate unions yield 0.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection(other).area();
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }

    /// Inclusive of the right and bottom edges.
    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.right() && p.y >= self.y && p.y <= self.bottom()
    }

    /// Clip to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let bounds = Rect::new(0, 0, width as i32, height as i32);
        self.intersection(&bounds)
    }
}

/// Closed polygon given by its ordered vertices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon(Vec<Point>);

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Polygons need at least three vertices to enclose anything.
    pub fn is_valid(&self) -> bool {
        self.0.len() >= 3
    }

    pub fn bounding_rect(&self) -> Rect {
        let Some(first) = self.0.first() else {
            return Rect::default();
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &self.0[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    /// Point-in-polygon test. Points on an edge or vertex count as inside.
    pub fn contains_point(&self, p: Point) -> bool {
        if !self.is_valid() {
            return false;
        }
        let n = self.0.len();
        for i in 0..n {
            if on_segment(self.0[i], self.0[(i + 1) % n], p) {
                return true;
            }
        }

        let (px, py) = (p.x as f64, p.y as f64);
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (self.0[i].x as f64, self.0[i].y as f64);
            let (xj, yj) = (self.0[j].x as f64, self.0[j].y as f64);
            if (yi > py) != (yj > py) {
                let x_cross = xi + (py - yi) * (xj - xi) / (yj - yi);
                if px < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    let cross = (b.x as i64 - a.x as i64) * (p.y as i64 - a.y as i64)
        - (b.y as i64 - a.y as i64) * (p.x as i64 - a.x as i64);
    if cross != 0 {
        return false;
    }
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Shape used for seat containment, chosen once when the catalog loads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeatRegion {
    Rect(Rect),
    Polygon(Polygon),
}

impl SeatRegion {
    pub fn bounding_rect(&self) -> Rect {
        match self {
            SeatRegion::Rect(rect) => *rect,
            SeatRegion::Polygon(poly) => poly.bounding_rect(),
        }
    }

    pub fn contains_point(&self, p: Point) -> bool {
        match self {
            SeatRegion::Rect(rect) => rect.contains_point(p),
            SeatRegion::Polygon(poly) => poly.contains_point(p),
        }
    }

    /// How much of `bbox` overlaps this region.
    ///
    /// Rectangles report IoU. Polygons report the fraction of the five probe
    /// points (center plus four corners) that fall inside the polygon.
    pub fn overlap_ratio(&self, bbox: &Rect) -> f32 {
        match self {
            SeatRegion::Rect(rect) => rect.iou(bbox),
            SeatRegion::Polygon(poly) => {
                let hits = std::iter::once(bbox.center())
                    .chain(bbox.corners())
                    .filter(|p| poly.contains_point(*p))
                    .count();
                hits as f32 / 5.0
            }
        }
    }

    /// Seat binding rule for a detection box.
    ///
    /// Polygons bind when the box center or any corner lies inside (corners
    /// catch boxes straddling a seat edge). Rectangles bind when IoU exceeds
    /// `iou_threshold`.
    pub fn binds(&self, bbox: &Rect, iou_threshold: f32) -> bool {
        match self {
            SeatRegion::Rect(rect) => rect.iou(bbox) > iou_threshold,
            SeatRegion::Polygon(poly) => {
                poly.contains_point(bbox.center())
                    || bbox.corners().iter().any(|c| poly.contains_point(*c))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::new(vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ])
    }

    #[test]
    fn iou_of_identical_rects_is_one() {
        let r = Rect::new(5, 5, 20, 10);
        assert!((r.iou(&r) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_rects_is_zero() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 5, 5);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(Rect::default().iou(&Rect::default()), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 10, 10);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn polygon_boundary_counts_as_inside() {
        let poly = square();
        assert!(poly.contains_point(Point::new(5, 5)));
        assert!(poly.contains_point(Point::new(0, 5)));
        assert!(poly.contains_point(Point::new(10, 10)));
        assert!(!poly.contains_point(Point::new(11, 5)));
        assert!(!poly.contains_point(Point::new(-1, -1)));
    }

    #[test]
    fn concave_polygon_excludes_notch() {
        // U shape opening upwards.
        let poly = Polygon::new(vec![
            Point::new(0, 0),
            Point::new(3, 0),
            Point::new(3, 6),
            Point::new(6, 6),
            Point::new(6, 0),
            Point::new(9, 0),
            Point::new(9, 9),
            Point::new(0, 9),
        ]);
        assert!(!poly.contains_point(Point::new(4, 2)));
        assert!(poly.contains_point(Point::new(1, 2)));
        assert!(poly.contains_point(Point::new(4, 8)));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let poly = Polygon::new(vec![Point::new(0, 0), Point::new(5, 5)]);
        assert!(!poly.is_valid());
        assert!(!poly.contains_point(Point::new(0, 0)));
    }

    #[test]
    fn polygon_binds_box_by_corner_when_center_outside() {
        let region = SeatRegion::Polygon(square());
        // Center at (15, 15) is outside, top-left corner (8, 8) is inside.
        let straddling = Rect::new(8, 8, 14, 14);
        assert!(region.binds(&straddling, 0.99));
        let outside = Rect::new(20, 20, 4, 4);
        assert!(!region.binds(&outside, 0.0));
    }

    #[test]
    fn rect_binding_uses_strict_iou_threshold() {
        let region = SeatRegion::Rect(Rect::new(0, 0, 10, 10));
        let b = Rect::new(5, 0, 10, 10);
        assert!(region.binds(&b, 0.3));
        assert!(!region.binds(&b, 0.5));
        assert!(region.overlap_ratio(&b) > 0.3);
    }

    #[test]
    fn polygon_serializes_as_nested_arrays() -> anyhow::Result<()> {
        let json = serde_json::to_string(&square())?;
        assert_eq!(json, "[[0,0],[10,0],[10,10],[0,10]]");
        let back: Polygon = serde_json::from_str(&json)?;
        assert_eq!(back.bounding_rect(), Rect::new(0, 0, 10, 10));
        Ok(())
    }
}
