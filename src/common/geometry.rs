//! Geometry of the simulated area.
//!
//! Contains:
//! - 2D points in mobility-engine world coordinates (meters)
//! - Axis-aligned rectangles for the area boundary and the inner zone
//! - Zone classification (inner vs. outer)
//! - The parked coordinate used for retired endpoints

use serde::{Deserialize, Serialize};

/// Parking spot for endpoints whose vehicle left the simulation.
///
/// West of the reference map and outside any configured boundary that starts
/// at the origin, so a retired endpoint never classifies into a zone.
pub const PARKED_POSITION: Point = Point { x: -1000.0, y: 320.0 };

/// Simple 2D point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f64 {
        distance2(self, other).sqrt()
    }

    /// Heading from `self` towards `other` in degrees, clockwise from north (+y).
    ///
    /// Returns `None` for a degenerate (zero-length) displacement.
    pub fn heading_to(&self, other: &Point) -> Option<f64> {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        let deg = dx.atan2(dy).to_degrees();
        Some(if deg < 0.0 { deg + 360.0 } else { deg })
    }
}

/// Squared Euclidean distance in world units.
pub fn distance2(a: &Point, b: &Point) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

/// Rectangle given by two corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectPos {
    #[serde(rename = "min-position")]
    pub min: Point,
    #[serde(rename = "max-position")]
    pub max: Point,
}

impl RectPos {
    pub const fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Normalize corners to (left, right, bottom, top).
    fn bounds(&self) -> (f64, f64, f64, f64) {
        let left = self.min.x.min(self.max.x);
        let right = self.min.x.max(self.max.x);
        let bottom = self.min.y.min(self.max.y);
        let top = self.min.y.max(self.max.y);
        (left, right, bottom, top)
    }

    pub fn width(&self) -> f64 {
        let (left, right, _, _) = self.bounds();
        right - left
    }

    pub fn height(&self) -> f64 {
        let (_, _, bottom, top) = self.bounds();
        top - bottom
    }

    pub fn center(&self) -> Point {
        let (left, right, bottom, top) = self.bounds();
        Point::new((left + right) / 2.0, (bottom + top) / 2.0)
    }

    /// Sub-rectangle sharing this rectangle's center, scaled by `fraction` on both axes.
    pub fn centered_fraction(&self, fraction: f64) -> RectPos {
        let center = self.center();
        let half_w = self.width() * fraction / 2.0;
        let half_h = self.height() * fraction / 2.0;
        RectPos::new(Point::new(center.x - half_w, center.y - half_h), Point::new(center.x + half_w, center.y + half_h))
    }

    /// True when `other` lies completely inside this rectangle (edges included).
    pub fn contains_rect(&self, other: &RectPos) -> bool {
        let (left, right, bottom, top) = other.bounds();
        self.contains(&Point::new(left, bottom)) && self.contains(&Point::new(right, top))
    }

    /// Inclusive point-in-rectangle test.
    pub fn contains(&self, p: &Point) -> bool {
        point_in_rect(p, self)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }
}

/// Inclusive point-in-rectangle test.
pub fn point_in_rect(p: &Point, rect: &RectPos) -> bool {
    let (left, right, bottom, top) = rect.bounds();
    p.x >= left && p.x <= right && p.y >= bottom && p.y <= top
}

/// One of the two nested areas a vehicle can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Inner,
    Outer,
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Zone::Inner => write!(f, "inner"),
            Zone::Outer => write!(f, "outer"),
        }
    }
}

/// Binary partition of the simulated area.
///
/// Anything inside `inner` (edges included) is [`Zone::Inner`]; everything
/// else, including positions outside the declared boundary, is [`Zone::Outer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaPartition {
    boundary: RectPos,
    inner: RectPos,
}

impl AreaPartition {
    pub fn new(boundary: RectPos, inner: RectPos) -> Self {
        Self { boundary, inner }
    }

    /// Inner area built as a centered fraction of the boundary.
    pub fn centered(boundary: RectPos, fraction: f64) -> Self {
        Self::new(boundary, boundary.centered_fraction(fraction))
    }

    pub fn boundary(&self) -> &RectPos {
        &self.boundary
    }

    pub fn inner(&self) -> &RectPos {
        &self.inner
    }

    pub fn zone_of(&self, position: &Point) -> Zone {
        if self.inner.contains(position) { Zone::Inner } else { Zone::Outer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64, y: f64) -> Point {
        Point { x, y }
    }

    #[test]
    fn point_in_rect_is_inclusive_and_corner_order_independent() {
        let rect = RectPos::new(p(20.0, 20.0), p(10.0, 10.0));
        assert!(point_in_rect(&p(10.0, 10.0), &rect));
        assert!(point_in_rect(&p(15.0, 15.0), &rect));
        assert!(point_in_rect(&p(20.0, 20.0), &rect));
        assert!(!point_in_rect(&p(9.0, 10.0), &rect));
    }

    #[test]
    fn centered_fraction_shares_center() {
        let boundary = RectPos::new(p(0.0, 0.0), p(1629.91, 1948.73));
        let inner = boundary.centered_fraction(0.5);
        let (c1, c2) = (boundary.center(), inner.center());
        assert!((c1.x - c2.x).abs() < 1e-9 && (c1.y - c2.y).abs() < 1e-9);
        assert!((inner.width() - boundary.width() / 2.0).abs() < 1e-9);
        assert!(boundary.contains_rect(&inner));
    }

    #[test]
    fn zone_of_classifies_inner_outer_and_outside_boundary() {
        let partition = AreaPartition::centered(RectPos::new(p(0.0, 0.0), p(100.0, 100.0)), 0.5);
        assert_eq!(partition.zone_of(&p(50.0, 50.0)), Zone::Inner);
        assert_eq!(partition.zone_of(&p(25.0, 75.0)), Zone::Inner);
        assert_eq!(partition.zone_of(&p(10.0, 50.0)), Zone::Outer);
        assert_eq!(partition.zone_of(&PARKED_POSITION), Zone::Outer);
    }

    #[test]
    fn parked_position_is_outside_default_boundary() {
        let boundary = RectPos::new(p(0.0, 0.0), p(1629.91, 1948.73));
        assert!(!boundary.contains(&PARKED_POSITION));
    }

    #[test]
    fn heading_follows_compass_convention() {
        let origin = p(0.0, 0.0);
        assert_eq!(origin.heading_to(&origin), None);
        assert!((origin.heading_to(&p(0.0, 10.0)).unwrap() - 0.0).abs() < 1e-9);
        assert!((origin.heading_to(&p(10.0, 0.0)).unwrap() - 90.0).abs() < 1e-9);
        assert!((origin.heading_to(&p(-10.0, 0.0)).unwrap() - 270.0).abs() < 1e-9);
    }
}
