use super::{MarkerClassification, PixelPoint, RawFrame, RawMarker};
use crate::calibration::{perimeter, ScaleCalibrator};
use crate::geometry::{range, to_physical, try_heading_and_range, Point, Rect};
use std::collections::HashMap;
use tracing::debug;

/// A ball detection converted to physical units
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BallSighting {
    pub centre: Point,
    pub diameter_mm: f64,
}

/// Immutable per-tick snapshot of what the camera saw, in millimetres.
///
/// Built once per tick; nothing downstream mutates it.
#[derive(Clone, Debug, Default)]
pub struct Observation {
    bases: HashMap<u32, Point>,
    agents: HashMap<u32, Point>,
    calibration_perimeter_px: Option<f64>,
    ball: Option<BallSighting>,
    scale: f64,
}

impl Observation {
    /// Classify a raw frame and convert it to physical units.
    ///
    /// The calibration marker (if present) is applied to `calibrator` first so
    /// the rest of the frame is converted with the freshest scale.
    pub fn from_frame(
        frame: &RawFrame,
        classes: &MarkerClassification,
        calibrator: &ScaleCalibrator,
    ) -> Self {
        let calibration_perimeter_px = frame
            .markers
            .iter()
            .find(|m| m.id == classes.calibration)
            .map(|m| perimeter(&m.corners));

        let scale = calibrator.update(calibration_perimeter_px);

        let mut observation = Observation {
            calibration_perimeter_px,
            scale,
            ..Default::default()
        };

        for marker in &frame.markers {
            if marker.id == classes.calibration {
                continue;
            }

            let is_base = classes.bases.contains(&marker.id);
            let is_agent = classes.agents.contains(&marker.id);
            if !is_base && !is_agent {
                continue;
            }

            let Some(pose) = marker_pose(marker, scale) else {
                debug!(marker_id = marker.id, "Skipping degenerate marker outline");
                continue;
            };

            if is_base {
                observation.bases.insert(marker.id, pose);
            } else {
                observation.agents.insert(marker.id, pose);
            }
        }

        observation.ball = frame.ball.map(|ball| BallSighting {
            centre: to_point(ball.centre, scale),
            diameter_mm: to_physical(ball.diameter_px, scale),
        });

        observation
    }

    /// Base markers in view, keyed by marker id
    pub fn observed_bases(&self) -> &HashMap<u32, Point> {
        &self.bases
    }

    /// Agent markers in view with their headings, keyed by marker id
    pub fn observed_agents(&self) -> &HashMap<u32, Point> {
        &self.agents
    }

    /// Perimeter of the calibration marker in pixels, if it was seen
    pub fn observed_calibration_marker(&self) -> Option<f64> {
        self.calibration_perimeter_px
    }

    pub fn observed_ball(&self) -> Option<BallSighting> {
        self.ball
    }

    /// Pixels per mm this snapshot was converted with
    pub fn current_scale(&self) -> f64 {
        self.scale
    }
}

/// Decides whether a ball sighting is plausible
#[derive(Clone, Debug)]
pub struct BallFilter {
    pub diameter_mm: f64,
    /// Accepted relative error on the diameter
    pub tolerance: f64,
    /// Arena rectangle, once known
    pub bounds: Option<Rect>,
}

impl BallFilter {
    pub fn accept(&self, sighting: &BallSighting) -> Option<Point> {
        let error = (sighting.diameter_mm - self.diameter_mm).abs() / self.diameter_mm;
        if error > self.tolerance {
            debug!(
                diameter_mm = sighting.diameter_mm,
                expected_mm = self.diameter_mm,
                "Rejecting ball with implausible diameter"
            );
            return None;
        }

        if let Some(bounds) = &self.bounds {
            if !bounds.contains(&sighting.centre) {
                debug!(
                    x = sighting.centre.x,
                    y = sighting.centre.y,
                    "Rejecting ball outside arena bounds"
                );
                return None;
            }
        }

        Some(sighting.centre)
    }
}

fn to_point(p: PixelPoint, scale: f64) -> Point {
    Point::new(to_physical(p.x, scale), to_physical(p.y, scale))
}

/// Centre of the marker plus the heading its front edge faces
fn marker_pose(marker: &RawMarker, scale: f64) -> Option<Point> {
    let corners: Vec<Point> = marker.corners.iter().map(|c| to_point(*c, scale)).collect();

    let centre = Point::new(
        corners.iter().map(|c| c.x).sum::<f64>() / 4.0,
        corners.iter().map(|c| c.y).sum::<f64>() / 4.0,
    );
    let front = Point::new(
        (corners[0].x + corners[1].x) / 2.0,
        (corners[0].y + corners[1].y) / 2.0,
    );

    if range(&corners[0], &corners[2]) <= f64::EPSILON {
        return None;
    }

    let (heading, _) = try_heading_and_range(&centre, &front)?;
    Some(Point::with_heading(centre.x, centre.y, heading))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::RawBall;
    use std::collections::HashSet;

    fn classes() -> MarkerClassification {
        MarkerClassification {
            calibration: 49,
            bases: HashSet::from([40, 41]),
            agents: HashSet::from([0, 1]),
        }
    }

    /// Axis-aligned square marker facing north, centred at (cx, cy)
    fn square(id: u32, cx: f64, cy: f64, side: f64) -> RawMarker {
        let h = side / 2.0;
        RawMarker {
            id,
            corners: [
                PixelPoint { x: cx - h, y: cy - h },
                PixelPoint { x: cx + h, y: cy - h },
                PixelPoint { x: cx + h, y: cy + h },
                PixelPoint { x: cx - h, y: cy + h },
            ],
        }
    }

    /// Same square rotated so its front faces east
    fn square_facing_east(id: u32, cx: f64, cy: f64, side: f64) -> RawMarker {
        let h = side / 2.0;
        RawMarker {
            id,
            corners: [
                PixelPoint { x: cx + h, y: cy - h },
                PixelPoint { x: cx + h, y: cy + h },
                PixelPoint { x: cx - h, y: cy + h },
                PixelPoint { x: cx - h, y: cy - h },
            ],
        }
    }

    #[test]
    fn test_classifies_and_converts_markers() {
        let calibrator = ScaleCalibrator::new(50.0, 1.0);
        let frame = RawFrame {
            markers: vec![
                square(49, 500.0, 500.0, 100.0), // 2 px/mm
                square(40, 200.0, 100.0, 20.0),
                square_facing_east(0, 400.0, 300.0, 20.0),
                square(77, 10.0, 10.0, 20.0), // unknown id
            ],
            ball: None,
        };

        let obs = Observation::from_frame(&frame, &classes(), &calibrator);

        assert_eq!(obs.current_scale(), 2.0);
        assert_eq!(obs.observed_calibration_marker(), Some(400.0));
        assert_eq!(obs.observed_bases().len(), 1);
        assert_eq!(obs.observed_agents().len(), 1);

        let base = obs.observed_bases()[&40];
        assert_eq!((base.x, base.y), (100.0, 50.0));
        assert_eq!(base.heading, 0.0);

        let agent = obs.observed_agents()[&0];
        assert_eq!((agent.x, agent.y), (200.0, 150.0));
        assert!((agent.heading - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_uses_last_scale_when_calibration_marker_missing() {
        let calibrator = ScaleCalibrator::new(50.0, 1.0);
        let first = RawFrame {
            markers: vec![square(49, 500.0, 500.0, 200.0)], // 4 px/mm
            ball: None,
        };
        Observation::from_frame(&first, &classes(), &calibrator);

        let second = RawFrame {
            markers: vec![square(41, 400.0, 400.0, 20.0)],
            ball: None,
        };
        let obs = Observation::from_frame(&second, &classes(), &calibrator);

        assert_eq!(obs.observed_calibration_marker(), None);
        let base = obs.observed_bases()[&41];
        assert_eq!((base.x, base.y), (100.0, 100.0));
    }

    #[test]
    fn test_degenerate_marker_is_skipped() {
        let calibrator = ScaleCalibrator::new(50.0, 1.0);
        let frame = RawFrame {
            markers: vec![square(0, 100.0, 100.0, 0.0)],
            ball: None,
        };
        let obs = Observation::from_frame(&frame, &classes(), &calibrator);
        assert!(obs.observed_agents().is_empty());
    }

    #[test]
    fn test_ball_filter_checks_diameter_and_bounds() {
        let calibrator = ScaleCalibrator::new(50.0, 2.0);
        let frame = RawFrame {
            markers: vec![],
            ball: Some(RawBall {
                centre: PixelPoint { x: 200.0, y: 200.0 },
                diameter_px: 240.0,
            }),
        };
        let sighting = Observation::from_frame(&frame, &classes(), &calibrator)
            .observed_ball()
            .unwrap();
        assert_eq!(sighting.diameter_mm, 120.0);

        let mut filter = BallFilter {
            diameter_mm: 120.0,
            tolerance: 0.04,
            bounds: None,
        };
        assert_eq!(filter.accept(&sighting), Some(Point::new(100.0, 100.0)));

        filter.diameter_mm = 200.0;
        assert_eq!(filter.accept(&sighting), None);

        filter.diameter_mm = 120.0;
        filter.bounds = Some(Rect {
            left: 0.0,
            top: 0.0,
            right: 50.0,
            bottom: 50.0,
        });
        assert_eq!(filter.accept(&sighting), None);
    }
}
