//! Error types for the MIDI device manager.
//!
//! Most of these never leave the crate: the manager facade turns routine
//! failures (unknown device, oversized payload, stopped client) into logged
//! no-ops. They are surfaced by the `try_*` send variants and by `start()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("MIDI device not found: {0}")]
    DeviceNotFound(String),

    #[error("MIDI payload of {size} bytes exceeds the {max} byte limit")]
    OversizePayload { size: usize, max: usize },

    #[error("MIDI client is not running")]
    TransportUnavailable,

    #[error("Failed to create MIDI client: {0}")]
    ClientCreation(String),

    #[error("Failed to allocate MIDI port: {0}")]
    PortAllocation(String),

    #[error("MIDI transport error: {0}")]
    Transport(String),
}

#[cfg(feature = "midir")]
impl From<midir::InitError> for Error {
    fn from(e: midir::InitError) -> Self {
        Error::ClientCreation(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::ConnectError<midir::MidiOutput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiOutput>) -> Self {
        Error::PortAllocation(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::ConnectError<midir::MidiInput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiInput>) -> Self {
        Error::PortAllocation(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::SendError> for Error {
    fn from(e: midir::SendError) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
