//! The tape positioning and labelling engine: everything between "a volume
//! is mounted in the drive" and "the drive sits at the right file
//! boundary".

pub mod device;
pub mod label;
pub mod position;
pub mod write_labels;

use thiserror::Error;

/// Tape-domain errors, each carrying the physical-media semantics the
/// operators rely on to tell drive trouble from media trouble.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TapeError {
    /// The file on the tape is not the file the caller asked for.
    #[error("file sequence error: {0}")]
    FileSequence(String),

    /// A label failed content validation. Carries the reason and the raw
    /// label bytes read, both preserved for the caller's diagnostics.
    #[error("label error: {reason}")]
    Label { reason: String, raw: Vec<u8> },

    /// The drive misbehaved, including "succeeded, but took so long the
    /// result cannot be trusted".
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Blank tape encountered where data was expected.
    #[error("blank tape: {0}")]
    Blank(String),

    /// Parity or media read error.
    #[error("parity error: {0}")]
    Parity(String),

    /// Unrecoverable media error.
    #[error("unrecoverable media error: {0}")]
    Unrecoverable(String),

    /// The cartridge is incompatible with the drive.
    #[error("drive/media incompatibility: {0}")]
    Incompatible(String),

    /// The drive returned no sense data where some was required.
    #[error("no sense data: {0}")]
    NoSense(String),
}
