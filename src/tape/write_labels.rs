//! Writes header and trailer label groups and the end-of-tape marks.
//!
//! Whether a tape mark is forced out to the medium immediately or left in
//! the drive's buffer is a throughput/durability trade the site chooses
//! through [`TapeFlushMode`]: flushing after every file keeps each file
//! durable the moment it is closed, flushing every N files/bytes keeps the
//! drive streaming.

use tracing::debug;

use crate::tape::device::TapeDevice;
use crate::tape::label::{build_hdr1_family, build_vol1, LabelCode, LabelKind};
use crate::tape::position::DevLabelInfo;
use crate::tape::TapeError;

/// Tape-mark flush policy. A first-class configuration input, resolved per
/// session.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TapeFlushMode {
    /// Force every file's tape mark out to the medium immediately.
    NFlushesPerFile,
    /// Let tape marks sit in the drive buffer and force a flush only when
    /// the configured byte or file count is reached.
    OneFlushPerNFiles,
}

/// Running totals for the deferred-flush policy.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct FlushBookkeeping {
    pub bytes_since_flush: u64,
    pub files_since_flush: u64,
}

impl FlushBookkeeping {
    pub fn record_file(&mut self, bytes: u64) {
        self.bytes_since_flush += bytes;
        self.files_since_flush += 1;
    }

    pub fn reset(&mut self) {
        *self = FlushBookkeeping::default();
    }

    /// Whether the deferred policy must flush now.
    pub fn flush_due(&self, max_bytes: u64, max_files: u64) -> bool {
        self.bytes_since_flush >= max_bytes || self.files_since_flush >= max_files
    }
}

/// Parameters of one trailer write.
#[derive(Debug, Clone)]
pub struct TrailerParams {
    /// EOF1/EOF2 when the file ends here, EOV1/EOV2 when it continues on
    /// the next volume.
    pub volume_spans: bool,
    /// Bytes of file data written, for the flush bookkeeping.
    pub bytes_written: u64,
}

/// Writes the header label group for a new file at the current (append)
/// position: VOL1 first if the drive sits at beginning-of-tape, then
/// HDR1/HDR2[/UHL1] and the mark closing the group. Unlabelled tapes get
/// no labels, by definition.
pub fn wrthdrlbl(
    dev: &mut dyn TapeDevice,
    info: &mut DevLabelInfo,
    vid: &str,
    file_id: &str,
    fseq: u32,
    section: u32,
) -> Result<(), TapeError> {
    if !info.lblcode.is_labelled() {
        return Ok(());
    }

    if info.at_bot {
        let vol1 = build_vol1(vid);
        dev.write_block(&vol1)?;
        info.vol1 = Some(vol1);
        info.at_bot = false;
    }

    let hdr1 = build_hdr1_family(LabelKind::Hdr1, file_id, fseq, section);
    let hdr2 = build_hdr1_family(LabelKind::Hdr2, file_id, fseq, section);
    dev.write_block(&hdr1)?;
    dev.write_block(&hdr2)?;
    if info.lblcode == LabelCode::Aul {
        let uhl1 = build_hdr1_family(LabelKind::Uhl1, file_id, fseq, section);
        dev.write_block(&uhl1)?;
        info.uhl1 = Some(uhl1);
    }
    // header-group marks are never flush points; the data that justifies a
    // flush has not been written yet
    dev.write_tape_mark(false)?;

    info.hdr1 = Some(hdr1);
    info.hdr2 = Some(hdr2);
    info.cfseq = fseq;
    debug!(fseq, "wrote header label group");
    Ok(())
}

/// Writes the trailer label group after a file's data: the mark closing the
/// data, EOF1/EOF2 (or EOV1/EOV2 when the file spans volumes), and the mark
/// closing the group. The closing mark is the flush point the configured
/// policy decides about.
#[allow(clippy::too_many_arguments)]
pub fn wrttrllbl(
    dev: &mut dyn TapeDevice,
    info: &mut DevLabelInfo,
    file_id: &str,
    params: &TrailerParams,
    flush_mode: TapeFlushMode,
    bookkeeping: &mut FlushBookkeeping,
    max_bytes_before_flush: u64,
    max_files_before_flush: u64,
) -> Result<(), TapeError> {
    // close the data
    dev.write_tape_mark(false)?;

    if info.lblcode.is_labelled() {
        let (first, second) = if params.volume_spans {
            (LabelKind::Eov1, LabelKind::Eov2)
        } else {
            (LabelKind::Eof1, LabelKind::Eof2)
        };
        dev.write_block(&build_hdr1_family(first, file_id, info.cfseq, 1))?;
        dev.write_block(&build_hdr1_family(second, file_id, info.cfseq, 1))?;
        if info.lblcode == LabelCode::Aul {
            dev.write_block(&build_hdr1_family(LabelKind::Utl1, file_id, info.cfseq, 1))?;
        }
    }

    bookkeeping.record_file(params.bytes_written);
    let immediate = match flush_mode {
        TapeFlushMode::NFlushesPerFile => true,
        TapeFlushMode::OneFlushPerNFiles => {
            bookkeeping.flush_due(max_bytes_before_flush, max_files_before_flush)
        }
    };
    dev.write_tape_mark(immediate)?;
    if immediate {
        debug!(
            files = bookkeeping.files_since_flush,
            bytes = bookkeeping.bytes_since_flush,
            "flushed to the medium"
        );
        bookkeeping.reset();
    }
    Ok(())
}

/// Writes the logical end-of-tape: two tape marks, then a backspace over
/// the second so the next file overwrites it. The marks are always forced
/// out; an unflushed end-of-tape is indistinguishable from a torn session.
pub fn wrteotmrk(dev: &mut dyn TapeDevice) -> Result<(), TapeError> {
    dev.write_tape_mark(false)?;
    dev.write_tape_mark(true)?;
    dev.space_backward_marks(1)?;
    Ok(())
}
