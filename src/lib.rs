//! Multi-channel, multi-board SDR stream recording
//!
//! Boards are locked to a common reference and zeroed on a shared PPS edge, then
//! every channel streams into its own raw sample file with a plain-text metadata
//! document alongside.

pub mod args;
pub mod calibration;
pub mod clock;
pub mod device;
pub mod error;
pub mod metadata;
pub mod plan;
pub mod radio;
pub mod record;
pub mod sample;
pub mod sim;
pub mod sink;
pub mod stream;

pub use error::{Error, Result};
