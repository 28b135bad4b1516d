use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Below this cross product two segments are treated as parallel.
const PARALLEL_EPS: f64 = 1e-6;

/// Point in a 2D plane: (µs, µV) for waveforms, (pc1, pc2) for projections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn cross(self, other: Point) -> f32 {
        self.x * other.y - self.y * other.x
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Component-wise product.
impl Mul for Point {
    type Output = Point;
    fn mul(self, rhs: Point) -> Point {
        Point::new(self.x * rhs.x, self.y * rhs.y)
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl SubAssign for Point {
    fn sub_assign(&mut self, rhs: Point) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

/// Parametric intersection test between segment `p11-p12` and segment `p21-p22`.
///
/// With `p + t*r` on the first segment and `q + u*s` on the second, a hit
/// needs `0 <= t <= 1` and `0 < u <= 1`. The open bound at `u == 0` means a
/// trace touching the very start of a box edge does not count.
pub fn segments_intersect(p11: Point, p12: Point, p21: Point, p22: Point) -> bool {
    let r = p12 - p11;
    let s = p22 - p21;
    let qp = p21 - p11;
    let rs = f64::from(r.cross(s));
    if rs.abs() < PARALLEL_EPS {
        return false;
    }
    let t = f64::from(qp.cross(s)) / rs;
    let u = f64::from(qp.cross(r)) / rs;
    (0.0..=1.0).contains(&t) && u > 0.0 && u <= 1.0
}

/// Closed polygon in PC space. Vertices are stored in local coordinates and
/// shifted by `offset` whenever the polygon is tested.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<Point>,
    pub offset: Point,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            offset: Point::ORIGIN,
        }
    }

    pub fn with_offset(points: Vec<Point>, offset: Point) -> Self {
        Self { points, offset }
    }

    pub fn is_degenerate(&self) -> bool {
        self.points.len() < 3
    }

    /// Moves the whole polygon without touching its vertices.
    pub fn translate(&mut self, delta: Point) {
        self.offset += delta;
    }

    /// Vertices with the offset applied.
    pub fn absolute_points(&self) -> impl Iterator<Item = Point> + '_ {
        self.points.iter().map(move |p| *p + self.offset)
    }

    /// Even-odd crossing test. Fewer than three vertices contain nothing.
    pub fn contains(&self, p: Point) -> bool {
        if self.is_degenerate() {
            return false;
        }
        let mut inside = false;
        let mut old = self.points[self.points.len() - 1] + self.offset;
        for vertex in &self.points {
            let new = *vertex + self.offset;
            let (p1, p2) = if new.x > old.x { (old, new) } else { (new, old) };
            if (new.x < p.x) == (p.x <= old.x)
                && (p.y - p1.y) * (p2.x - p1.x) < (p2.y - p1.y) * (p.x - p1.x)
            {
                inside = !inside;
            }
            old = new;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(half: f32) -> Polygon {
        Polygon::new(vec![
            Point::new(-half, -half),
            Point::new(half, -half),
            Point::new(half, half),
            Point::new(-half, half),
        ])
    }

    #[test]
    fn crossing_segments_intersect() {
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(2.0, 2.0),
            Point::new(0.0, 2.0),
            Point::new(2.0, 0.0),
        ));
    }

    #[test]
    fn parallel_segments_never_intersect() {
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
        ));
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
            Point::new(1.0, 2.0),
        ));
    }

    #[test]
    fn u_bound_is_open_at_zero_and_closed_at_one() {
        // First segment passes exactly through the start of the second (u == 0).
        let start = segments_intersect(
            Point::new(-1.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 0.0),
            Point::new(0.0, -1.0),
        );
        assert!(!start);
        // ...and exactly through its end (u == 1).
        let end = segments_intersect(
            Point::new(-1.0, -1.0),
            Point::new(1.0, -1.0),
            Point::new(0.0, 0.0),
            Point::new(0.0, -1.0),
        );
        assert!(end);
    }

    #[test]
    fn t_bound_is_closed_at_both_ends() {
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(0.0, -1.0),
        ));
        assert!(segments_intersect(
            Point::new(-1.0, 0.0),
            Point::new(0.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(0.0, -1.0),
        ));
    }

    #[test]
    fn polygon_contains_inner_point_only() {
        let poly = square(1.0);
        assert!(poly.contains(Point::ORIGIN));
        assert!(poly.contains(Point::new(0.5, -0.5)));
        assert!(!poly.contains(Point::new(1.5, 0.0)));
        assert!(!poly.contains(Point::new(0.0, -3.0)));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let poly = Polygon::new(vec![Point::new(-1.0, -1.0), Point::new(1.0, 1.0)]);
        assert!(!poly.contains(Point::ORIGIN));
        assert!(!Polygon::default().contains(Point::ORIGIN));
    }

    #[test]
    fn offset_moves_the_region() {
        let mut poly = square(1.0);
        poly.translate(Point::new(10.0, 0.0));
        assert!(!poly.contains(Point::ORIGIN));
        assert!(poly.contains(Point::new(10.0, 0.5)));
        assert_eq!(poly.points[0], Point::new(-1.0, -1.0));
    }

    #[test]
    fn concave_polygon_uses_even_odd_rule() {
        // U shape opening upwards.
        let poly = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(3.0, 0.0),
            Point::new(3.0, 3.0),
            Point::new(2.0, 3.0),
            Point::new(2.0, 1.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 3.0),
            Point::new(0.0, 3.0),
        ]);
        assert!(poly.contains(Point::new(0.5, 2.0)));
        assert!(poly.contains(Point::new(2.5, 2.0)));
        assert!(!poly.contains(Point::new(1.5, 2.0)));
    }

    #[test]
    fn point_ops() {
        let a = Point::new(1.0, 2.0);
        let b = Point::new(3.0, -1.0);
        assert_eq!(a + b, Point::new(4.0, 1.0));
        assert_eq!(a - b, Point::new(-2.0, 3.0));
        assert_eq!(a * b, Point::new(3.0, -2.0));
        assert_eq!(a.cross(b), 1.0 * -1.0 - 2.0 * 3.0);
    }
}
