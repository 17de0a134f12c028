// Planar geometry: headings, ranges, course changes, scale conversion
pub mod geometry;

// Pixel-per-millimetre calibration
pub mod calibration;

// Marker frames, per-tick observations and frame sources
pub mod marker;

// Agent and base registry
pub mod registry;

// Outstanding-command tracking
pub mod busy;

// Broker transport and command channel
pub mod channel;

// Arena state machine and run loop
pub mod arena;

// Configuration loading
pub mod config;
