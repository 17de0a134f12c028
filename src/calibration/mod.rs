// Pixel-to-millimetre scale calibration

use crate::marker::PixelPoint;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Maintains the current pixels-per-millimetre scale.
///
/// The scale is recomputed every time the calibration marker is seen and
/// otherwise keeps its last value. It is never zero: it starts from the
/// configured default and non-positive observations are rejected.
pub struct ScaleCalibrator {
    /// Physical side length of the calibration marker (mm)
    marker_side_mm: f64,

    /// Current scale, stored as f64 bits
    scale_bits: AtomicU64,

    /// Number of observations applied since startup
    observations: AtomicU64,
}

impl ScaleCalibrator {
    /// Create a calibrator with a known marker size and a starting scale
    pub fn new(marker_side_mm: f64, initial_scale: f64) -> Self {
        let initial = if initial_scale > 0.0 { initial_scale } else { 1.0 };
        Self {
            marker_side_mm,
            scale_bits: AtomicU64::new(initial.to_bits()),
            observations: AtomicU64::new(0),
        }
    }

    /// Apply this frame's calibration observation (perimeter in pixels), if any.
    ///
    /// Returns the scale in effect after the update.
    pub fn update(&self, observed_perimeter_px: Option<f64>) -> f64 {
        let Some(perimeter) = observed_perimeter_px else {
            return self.current_scale();
        };

        if !(perimeter.is_finite() && perimeter > 0.0) || self.marker_side_mm <= 0.0 {
            warn!(perimeter = perimeter, "Ignoring unusable calibration observation");
            return self.current_scale();
        }

        let scale = perimeter / (4.0 * self.marker_side_mm);
        let previous = f64::from_bits(self.scale_bits.swap(scale.to_bits(), Ordering::SeqCst));
        self.observations.fetch_add(1, Ordering::Relaxed);

        if (previous - scale).abs() > f64::EPSILON {
            debug!(previous = previous, scale = scale, "Scale recalibrated");
        }

        scale
    }

    /// Pixels per millimetre
    pub fn current_scale(&self) -> f64 {
        f64::from_bits(self.scale_bits.load(Ordering::SeqCst))
    }

    pub fn observation_count(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }
}

/// Closed perimeter of a marker outline, in pixels
pub fn perimeter(corners: &[PixelPoint]) -> f64 {
    if corners.len() < 2 {
        return 0.0;
    }
    corners
        .iter()
        .zip(corners.iter().cycle().skip(1))
        .map(|(a, b)| (b.x - a.x).hypot(b.y - a.y))
        .sum()
}
