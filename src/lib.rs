//! Road-usage charging pipeline.
//!
//! Location fixes enter on `location.update` and flow through three
//! independent stages, each a separate process talking only over the bus:
//!
//! 1. map matcher: pairs consecutive fixes per vehicle and snaps them to roads
//! 2. pollution matcher: intersects matched paths with pollution zones
//! 3. toll calculator: prices zone hits and keeps a running total per vehicle

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod road_matcher;
pub mod stages;
pub mod toll;
pub mod windower;
pub mod zones;

pub use error::{MatchError, PipelineError};
