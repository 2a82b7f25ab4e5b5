pub mod gate;
pub mod thresholds;
pub mod service;
