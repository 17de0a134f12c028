// Planar geometry for headings, ranges and course changes
//
// Coordinates follow image convention: x grows east, y grows south.
// Headings are degrees clockwise from north (negative y).

use serde::{Deserialize, Serialize};


/// A position in physical units (millimetres) with an orientation
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,

    /// Degrees clockwise from north, in [0, 360)
    #[serde(default)]
    pub heading: f64,
}

impl Point {
    /// Create a point with a north-facing heading
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, heading: 0.0 }
    }

    pub fn with_heading(x: f64, y: f64, heading: f64) -> Self {
        Self {
            x,
            y,
            heading: normalize_heading(heading),
        }
    }
}

/// Axis-aligned rectangle, always stored normalized (left <= right, top <= bottom)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    /// Smallest rectangle containing every point, or None for an empty set
    pub fn bounding<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Self> {
        points.into_iter().fold(None, |rect, p| {
            Some(match rect {
                None => Rect {
                    left: p.x,
                    top: p.y,
                    right: p.x,
                    bottom: p.y,
                },
                Some(r) => Rect {
                    left: r.left.min(p.x),
                    top: r.top.min(p.y),
                    right: r.right.max(p.x),
                    bottom: r.bottom.max(p.y),
                },
            })
        })
    }

    /// Inclusive containment test
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.left && p.x <= self.right && p.y >= self.top && p.y <= self.bottom
    }
}

/// Wrap any angle into [0, 360)
pub fn normalize_heading(degrees: f64) -> f64 {
    let h = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if h >= 360.0 {
        0.0
    } else {
        h
    }
}

/// Euclidean distance between two points
pub fn range(p0: &Point, p1: &Point) -> f64 {
    (p1.x - p0.x).hypot(p1.y - p0.y)
}

/// Heading and range from `origin` to `reference`.
///
/// The angle to the vertical comes from the arcsine of the horizontal offset
/// over the range, then the signs of both offsets pick the quadrant:
///
/// ```text
///   Q0 | Q1        Q1: heading = angle
///   ---+---        Q3: heading = 180 - angle
///   Q2 | Q3        Q2: heading = 180 + angle
///                  Q0: heading = 360 - angle
/// ```
///
/// Callers must not pass coincident points; the range is the divisor.
/// Use [`try_heading_and_range`] when that cannot be ruled out.
pub fn heading_and_range(origin: &Point, reference: &Point) -> (f64, f64) {
    let dx = reference.x - origin.x;
    let dy = reference.y - origin.y;
    let r = range(origin, reference);

    // clamp guards asin against ratios a rounding error above 1.0
    let angle = (dx.abs() / r).clamp(0.0, 1.0).asin().to_degrees();

    let heading = match (dx >= 0.0, dy <= 0.0) {
        (true, true) => angle,
        (true, false) => 180.0 - angle,
        (false, false) => 180.0 + angle,
        (false, true) => 360.0 - angle,
    };

    (normalize_heading(heading), r)
}

/// Like [`heading_and_range`] but returns None when the points coincide
pub fn try_heading_and_range(origin: &Point, reference: &Point) -> Option<(f64, f64)> {
    if range(origin, reference) <= f64::EPSILON {
        return None;
    }
    Some(heading_and_range(origin, reference))
}

/// Signed smallest turn from `from_heading` onto `to_heading`, in (-180, 180].
///
/// Positive turns are clockwise.
pub fn course_change(from_heading: f64, to_heading: f64) -> f64 {
    let turn = (to_heading - from_heading).rem_euclid(360.0);
    if turn > 180.0 {
        turn - 360.0
    } else {
        turn
    }
}

/// Grow a rectangle by `margin` on every side.
///
/// The corners may be given in either order.
pub fn expand_rect(min: &Point, max: &Point, margin: f64) -> Rect {
    Rect {
        left: min.x.min(max.x) - margin,
        top: min.y.min(max.y) - margin,
        right: min.x.max(max.x) + margin,
        bottom: min.y.max(max.y) + margin,
    }
}

/// Convert a pixel length to physical units given a pixels-per-unit scale
pub fn to_physical(pixels: f64, scale: f64) -> f64 {
    pixels / scale
}

/// Convert a physical length to pixels given a pixels-per-unit scale
pub fn to_pixels(physical: f64, scale: f64) -> f64 {
    physical * scale
}
