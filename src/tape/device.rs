//! The seam to the physical drive. The positioning engine only ever talks
//! to this trait; production code backs it with the drive's ioctl
//! interface, tests with a mock.

#[cfg(test)]
use mockall::automock;

use crate::tape::TapeError;

/// Result of reading one block at the current position.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceRead {
    /// A data record of the given bytes.
    Record(Vec<u8>),
    /// A tape mark (file boundary).
    TapeMark,
    /// Blank media: nothing was ever written here. Reading a tape mark
    /// directly followed by blank media is the classic end-of-data shape on
    /// drives that do not write a second mark.
    Blank,
}

#[cfg_attr(test, automock)]
pub trait TapeDevice {
    /// Reads one block, at most `max_len` bytes.
    fn read_block(&mut self, max_len: usize) -> Result<DeviceRead, TapeError>;

    /// Spaces forward over `count` tape marks, landing just past the last
    /// one.
    fn space_forward_marks(&mut self, count: u32) -> Result<(), TapeError>;

    /// Spaces backward over `count` tape marks, landing just before the
    /// last one spaced over.
    fn space_backward_marks(&mut self, count: u32) -> Result<(), TapeError>;

    /// Spaces backward over `count` data blocks.
    fn space_backward_blocks(&mut self, count: u32) -> Result<(), TapeError>;

    fn rewind(&mut self) -> Result<(), TapeError>;

    /// Whether the drive can locate a file boundary directly (SCSI LOCATE
    /// style). The landing point of such a bulk skip is not trusted and is
    /// always re-verified by reading labels around it.
    fn supports_fast_position(&self) -> bool;

    /// Moves directly to the block where the given file section starts.
    fn locate_file(&mut self, fseq: u32) -> Result<(), TapeError>;

    fn write_block(&mut self, data: &[u8]) -> Result<(), TapeError>;

    /// Writes one tape mark. `immediate` forces the drive to flush it (and
    /// everything buffered before it) to the medium before returning.
    fn write_tape_mark(&mut self, immediate: bool) -> Result<(), TapeError>;
}
