//! Utility modules for metricsd.

mod duration;

pub use duration::{DurationParseError, parse_duration};
