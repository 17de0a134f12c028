// Marker subsystem boundary: raw detector frames and per-tick observations

mod observation;
mod replay;

pub use observation::{BallFilter, BallSighting, Observation};
pub use replay::{ReplaySource, ScriptedSource};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A point in image space (pixels, y grows downward)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

/// One detected fiducial marker.
///
/// Corners are in detector order: top-left, top-right, bottom-right,
/// bottom-left of the printed marker, so the first edge is the marker's "front".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMarker {
    pub id: u32,
    pub corners: [PixelPoint; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawBall {
    pub centre: PixelPoint,
    pub diameter_px: f64,
}

/// Everything the detector saw in one frame
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub markers: Vec<RawMarker>,
    #[serde(default)]
    pub ball: Option<RawBall>,
}

/// Which marker ids mean what in this arena
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarkerClassification {
    pub calibration: u32,
    pub bases: HashSet<u32>,
    pub agents: HashSet<u32>,
}

/// Producer of detector frames.
///
/// Each call advances one frame. `Ok(None)` means the source has no more
/// frames and the arena should stop.
pub trait MarkerSource: Send {
    fn refresh(&mut self) -> Result<Option<RawFrame>>;
}
