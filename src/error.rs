//! Error type shared by every stage of a capture

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid option values, caught before any hardware is touched
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported channel count {0} (supported: 1-8)")]
    UnsupportedChannelCount(usize),

    #[error("{channels} channels need {needed} board(s), but the device args only name {boards}")]
    IncompatibleDevice {
        channels: usize,
        needed: usize,
        boards: usize,
    },

    /// GPS/reference lock was not reached inside the wait budget
    #[error("No GPS/reference lock on board {board} after {polls} poll(s)")]
    HardwareLock { board: usize, polls: u32 },

    #[error("No PPS edge seen on board {board} after {polls} poll(s)")]
    PpsEdgeTimeout { board: usize, polls: u32 },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
