//! Positions a mounted volume at a requested file boundary.
//!
//! The engine is a bounded finite-state machine over the physical
//! primitives of [`TapeDevice`]. Every exit, success or failure, funnels
//! through one [`finish`] transformation that normalizes internal failure
//! codes, shapes the user-facing message, and enforces the wall-clock
//! ceiling on the whole operation.
//!
//! Positional bookkeeping: `cfseq` is the file the drive is believed to sit
//! at. For unlabelled tapes that is the start of the file's data; for
//! labelled tapes the start of its data just past the header group. A
//! freshly mounted or rewound volume is at beginning-of-tape with
//! `cfseq == 1`.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::tape::device::{DeviceRead, TapeDevice};
use crate::tape::label::{
    check_file_seq, check_label, file_seq_of, LabelCode, LabelKind, LABEL_RECORD_LEN,
};
use crate::tape::TapeError;

/// Transfer direction of the session the positioning serves.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TapeMode {
    Read,
    Write,
}

/// What the caller asserts about the target file's existence.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FileStatus {
    /// The file must already exist.
    CheckFile,
    /// A new file is being created; positioning past the current end of
    /// data is legitimate.
    NewFile,
    /// Appending after the last file.
    Append,
    /// No existence check at all.
    NoFileCheck,
}

/// Per-open-tape-path label state, kept from reserve to release.
#[derive(Debug, Clone)]
pub struct DevLabelInfo {
    pub device_type: String,
    pub lblcode: LabelCode,
    /// Believed current file-sequence number.
    pub cfseq: u32,
    /// Whether the drive sits at beginning-of-tape, i.e. the volume labels
    /// have not been crossed yet.
    pub at_bot: bool,
    pub vol1: Option<[u8; LABEL_RECORD_LEN]>,
    pub hdr1: Option<[u8; LABEL_RECORD_LEN]>,
    pub hdr2: Option<[u8; LABEL_RECORD_LEN]>,
    pub uhl1: Option<[u8; LABEL_RECORD_LEN]>,
}

impl DevLabelInfo {
    pub fn new(device_type: &str, lblcode: LabelCode) -> DevLabelInfo {
        DevLabelInfo {
            device_type: device_type.to_string(),
            lblcode,
            cfseq: 1,
            at_bot: true,
            vol1: None,
            hdr1: None,
            hdr2: None,
            uhl1: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PositionRequest {
    pub target_fseq: u32,
    pub mode: TapeMode,
    pub filstat: FileStatus,
}

#[derive(Debug, Clone)]
pub struct PositionConfig {
    /// Wall-clock ceiling on one whole positioning operation. A positioning
    /// that succeeds but overruns this is reported as a hardware error: a
    /// drive that is slow for no reason cannot be trusted to be right.
    pub position_timeout: Duration,
    /// Minimum file distance before a drive's direct locate is preferred
    /// over iterative spacing.
    pub fast_position_threshold: u32,
}

impl Default for PositionConfig {
    fn default() -> PositionConfig {
        PositionConfig {
            position_timeout: crate::config::POSITION_TIMEOUT_FLOOR,
            fast_position_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PositionOutcome {
    /// File the drive actually sits at. Differs from the requested one only
    /// when an unlabelled tape ran out of files and the caller was allowed
    /// to append.
    pub fseq: u32,
    /// Physical positioning operations performed (spaces, rewinds,
    /// locates).
    pub skips: u32,
    /// The drive sits at the end of data, ready for a new file, rather than
    /// at an existing file.
    pub at_append_point: bool,
}

/// Classification of the trailer-label group after a file's data.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrailerOutcome {
    /// EOF1/EOF2: the file ends on this volume.
    EndOfFile,
    /// EOV1/EOV2: the file section continues on another volume.
    VolumeContinues,
}

/// Failure vocabulary internal to the state machine; [`finish`] owns the
/// mapping to the caller-visible error codes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PositFailure {
    BadLabel { reason: String, raw: Vec<u8> },
    WrongFileSequence { detail: String },
    Device(TapeError),
}

impl From<TapeError> for PositFailure {
    fn from(e: TapeError) -> PositFailure {
        PositFailure::Device(e)
    }
}

/// Positions the drive at the file boundary `req` names.
pub fn posittape(
    dev: &mut dyn TapeDevice,
    info: &mut DevLabelInfo,
    req: &PositionRequest,
    cfg: &PositionConfig,
) -> Result<PositionOutcome, TapeError> {
    let started = Instant::now();
    let result = run_state_machine(dev, info, req, cfg);
    finish(result, started.elapsed(), cfg)
}

/// The single join point of every positioning exit path: normalizes the
/// internal failure vocabulary to the caller-visible codes, shapes the
/// user-facing message, and converts an over-long success into a hardware
/// error.
fn finish(
    result: Result<PositionOutcome, PositFailure>,
    elapsed: Duration,
    cfg: &PositionConfig,
) -> Result<PositionOutcome, TapeError> {
    let normalized = match result {
        Ok(outcome) => Ok(outcome),
        Err(PositFailure::BadLabel { reason, raw }) => Err(TapeError::Label { reason, raw }),
        Err(PositFailure::WrongFileSequence { detail }) => Err(TapeError::FileSequence(detail)),
        Err(PositFailure::Device(e)) => Err(e),
    };

    if elapsed > cfg.position_timeout {
        warn!(
            ?elapsed,
            ceiling = ?cfg.position_timeout,
            "positioning exceeded the wall-clock ceiling"
        );
        return Err(TapeError::Hardware(format!(
            "positioning took {}s, exceeding the allowed {}s: drive cannot be trusted",
            elapsed.as_secs(),
            cfg.position_timeout.as_secs()
        )));
    }
    normalized
}

/// Named states of the positioning machine. Transitions are bounded: the
/// driver loop gives up with a hardware error if the machine fails to
/// converge.
#[derive(Debug)]
enum State {
    Start,
    Rewind,
    ReadVol1,
    FastPosition,
    /// Iteratively space over `remaining` tape marks, probing for
    /// end-of-data after each one (unlabelled tapes only).
    SkipFilesUnlabelled { remaining: u32 },
    /// Space over `remaining` tape marks in one go, then read the header
    /// group (labelled tapes).
    SkipToHeaders { remaining: u32 },
    /// Read and validate HDR1/HDR2[/UHL1]; `after_locate` marks the
    /// mandatory verification pass of a fast position.
    ReadHeaders { after_locate: bool },
    Done(PositionOutcome),
}

struct Tracker {
    skips: u32,
    /// Labels read during this run; committed to the caller's
    /// [`DevLabelInfo`] only on success.
    vol1: Option<[u8; LABEL_RECORD_LEN]>,
    hdr1: Option<[u8; LABEL_RECORD_LEN]>,
    hdr2: Option<[u8; LABEL_RECORD_LEN]>,
    uhl1: Option<[u8; LABEL_RECORD_LEN]>,
    fast_position_spent: bool,
}

fn run_state_machine(
    dev: &mut dyn TapeDevice,
    info: &mut DevLabelInfo,
    req: &PositionRequest,
    cfg: &PositionConfig,
) -> Result<PositionOutcome, PositFailure> {
    if req.target_fseq == 0 {
        return Err(PositFailure::Device(TapeError::FileSequence(
            "file sequence numbers start at 1".into(),
        )));
    }

    let mut tracker = Tracker {
        skips: 0,
        vol1: None,
        hdr1: None,
        hdr2: None,
        uhl1: None,
        fast_position_spent: false,
    };
    let mut cfseq = info.cfseq;
    let mut at_bot = info.at_bot;
    let mut state = State::Start;

    // generous convergence bound: each file needs a fixed handful of
    // physical operations, plus one full restart after a failed locate
    let max_transitions = 8 * (req.target_fseq as u64 + 4) * 2;

    for _ in 0..max_transitions {
        debug!(?state, cfseq, at_bot, "positioning transition");
        state = match state {
            State::Start => {
                if req.target_fseq < cfseq {
                    State::Rewind
                } else if info.lblcode.is_labelled() {
                    if at_bot {
                        State::ReadVol1
                    } else if req.target_fseq == cfseq {
                        State::Done(PositionOutcome {
                            fseq: cfseq,
                            skips: tracker.skips,
                            at_append_point: false,
                        })
                    } else {
                        pick_labelled_approach(dev, cfg, &tracker, cfseq, at_bot, req.target_fseq)
                    }
                } else {
                    // NL/BLP: position is pure tape-mark arithmetic
                    if req.target_fseq == cfseq {
                        State::Done(PositionOutcome {
                            fseq: cfseq,
                            skips: tracker.skips,
                            at_append_point: false,
                        })
                    } else {
                        State::SkipFilesUnlabelled {
                            remaining: req.target_fseq - cfseq,
                        }
                    }
                }
            }

            State::Rewind => {
                dev.rewind()?;
                tracker.skips += 1;
                cfseq = 1;
                at_bot = true;
                if info.lblcode.is_labelled() {
                    State::ReadVol1
                } else {
                    State::Start
                }
            }

            State::ReadVol1 => {
                match dev.read_block(LABEL_RECORD_LEN)? {
                    DeviceRead::Record(record) => {
                        check_label(&record, LabelKind::Vol1).map_err(bad_label)?;
                        let mut vol1 = [0u8; LABEL_RECORD_LEN];
                        vol1.copy_from_slice(&record);
                        tracker.vol1 = Some(vol1);
                    }
                    DeviceRead::TapeMark => {
                        return Err(PositFailure::BadLabel {
                            reason: "tape mark where the VOL1 label was expected".into(),
                            raw: Vec::new(),
                        });
                    }
                    DeviceRead::Blank => {
                        return Err(PositFailure::Device(TapeError::Blank(
                            "tape is blank where the VOL1 label was expected".into(),
                        )));
                    }
                }
                // past VOL1 the header group of file 1 follows directly
                at_bot = false;
                cfseq = 1;
                if req.target_fseq == 1 {
                    State::ReadHeaders { after_locate: false }
                } else {
                    pick_labelled_approach_after_vol1(dev, cfg, &tracker, req.target_fseq)
                }
            }

            State::FastPosition => {
                dev.locate_file(req.target_fseq)?;
                tracker.skips += 1;
                at_bot = false;
                cfseq = req.target_fseq;
                State::ReadHeaders { after_locate: true }
            }

            State::SkipFilesUnlabelled { remaining } => {
                if remaining == 0 {
                    State::Done(PositionOutcome {
                        fseq: cfseq,
                        skips: tracker.skips,
                        at_append_point: false,
                    })
                } else {
                    dev.space_forward_marks(1)?;
                    tracker.skips += 1;
                    at_bot = false;
                    cfseq += 1;
                    match probe_for_end_of_data(dev)? {
                        Probe::MoreData => State::SkipFilesUnlabelled {
                            remaining: remaining - 1,
                        },
                        Probe::EndOfData { via_tape_mark } => State::Done(end_of_data_outcome(
                            dev,
                            req,
                            &mut tracker,
                            cfseq,
                            via_tape_mark,
                        )?),
                    }
                }
            }

            State::SkipToHeaders { remaining } => {
                if remaining > 0 {
                    dev.space_forward_marks(remaining)?;
                    tracker.skips += 1;
                    at_bot = false;
                }
                cfseq = req.target_fseq;
                State::ReadHeaders { after_locate: false }
            }

            State::ReadHeaders { after_locate } => {
                match read_header_group(dev, info, req, &mut tracker, after_locate)? {
                    HeaderOutcome::Positioned => {
                        dev.space_forward_marks(1)?;
                        tracker.skips += 1;
                        State::Done(PositionOutcome {
                            fseq: req.target_fseq,
                            skips: tracker.skips,
                            at_append_point: false,
                        })
                    }
                    HeaderOutcome::EndOfData { via_tape_mark } => State::Done(
                        end_of_data_outcome(dev, req, &mut tracker, cfseq, via_tape_mark)?,
                    ),
                    HeaderOutcome::LocateMissed { landed_on } => {
                        // the bulk-skip primitive overshoots on some
                        // drives; restart deliberately instead of trusting
                        // its landing point
                        warn!(
                            requested = req.target_fseq,
                            landed_on, "fast positioning missed, restarting iteratively"
                        );
                        State::Rewind
                    }
                }
            }

            State::Done(outcome) => {
                info.cfseq = outcome.fseq;
                info.at_bot = false;
                if tracker.vol1.is_some() {
                    info.vol1 = tracker.vol1;
                }
                if tracker.hdr1.is_some() {
                    info.hdr1 = tracker.hdr1;
                    info.hdr2 = tracker.hdr2;
                    info.uhl1 = tracker.uhl1;
                }
                return Ok(outcome);
            }
        };
    }

    Err(PositFailure::Device(TapeError::Hardware(format!(
        "positioning did not converge within {} transitions",
        max_transitions
    ))))
}

fn bad_label(e: TapeError) -> PositFailure {
    match e {
        TapeError::Label { reason, raw } => PositFailure::BadLabel { reason, raw },
        other => PositFailure::Device(other),
    }
}

fn pick_labelled_approach(
    dev: &mut dyn TapeDevice,
    cfg: &PositionConfig,
    tracker: &Tracker,
    cfseq: u32,
    at_bot: bool,
    target: u32,
) -> State {
    debug_assert!(!at_bot && target > cfseq);
    let distance = target - cfseq;
    if !tracker.fast_position_spent
        && distance >= cfg.fast_position_threshold
        && dev.supports_fast_position()
    {
        State::FastPosition
    } else {
        // from the data start of `cfseq`: its data mark, its trailer mark,
        // then three marks per intervening file
        State::SkipToHeaders {
            remaining: 3 * distance - 1,
        }
    }
}

fn pick_labelled_approach_after_vol1(
    dev: &mut dyn TapeDevice,
    cfg: &PositionConfig,
    tracker: &Tracker,
    target: u32,
) -> State {
    let distance = target - 1;
    if !tracker.fast_position_spent
        && distance >= cfg.fast_position_threshold
        && dev.supports_fast_position()
    {
        State::FastPosition
    } else {
        // from just past VOL1: three marks per preceding file
        State::SkipToHeaders {
            remaining: 3 * distance,
        }
    }
}

enum Probe {
    MoreData,
    EndOfData { via_tape_mark: bool },
}

/// After spacing over a tape mark, peeks one block to tell "next file's
/// data" from "double tape mark or blank tape". A data record is pushed
/// back so the position is unchanged.
fn probe_for_end_of_data(dev: &mut dyn TapeDevice) -> Result<Probe, PositFailure> {
    match dev.read_block(LABEL_RECORD_LEN)? {
        DeviceRead::Record(_) => {
            dev.space_backward_blocks(1)?;
            Ok(Probe::MoreData)
        }
        DeviceRead::TapeMark => Ok(Probe::EndOfData { via_tape_mark: true }),
        DeviceRead::Blank => Ok(Probe::EndOfData { via_tape_mark: false }),
    }
}

/// The one decision table for hitting end-of-data: appending is legitimate
/// only for a write that is allowed to create, everything else is a file
/// sequence error.
fn end_of_data_outcome(
    dev: &mut dyn TapeDevice,
    req: &PositionRequest,
    tracker: &mut Tracker,
    reached_fseq: u32,
    via_tape_mark: bool,
) -> Result<PositionOutcome, PositFailure> {
    let may_append = req.mode == TapeMode::Write
        && matches!(
            req.filstat,
            FileStatus::NewFile | FileStatus::Append | FileStatus::NoFileCheck
        );
    if !may_append {
        return Err(PositFailure::WrongFileSequence {
            detail: format!(
                "requested file {} but the volume ends at file {}",
                req.target_fseq,
                reached_fseq.saturating_sub(1)
            ),
        });
    }
    if via_tape_mark {
        // the probe consumed the second mark of the double tape mark; the
        // append point is just before it
        dev.space_backward_marks(1)?;
        tracker.skips += 1;
    }
    debug!(fseq = reached_fseq, "positioned at the append point");
    Ok(PositionOutcome {
        fseq: reached_fseq,
        skips: tracker.skips,
        at_append_point: true,
    })
}

enum HeaderOutcome {
    Positioned,
    EndOfData { via_tape_mark: bool },
    LocateMissed { landed_on: u32 },
}

/// Reads and validates the HDR1/HDR2[/UHL1] group of the target file.
fn read_header_group(
    dev: &mut dyn TapeDevice,
    info: &DevLabelInfo,
    req: &PositionRequest,
    tracker: &mut Tracker,
    after_locate: bool,
) -> Result<HeaderOutcome, PositFailure> {
    let hdr1 = match dev.read_block(LABEL_RECORD_LEN)? {
        DeviceRead::Record(record) => record,
        DeviceRead::TapeMark => return Ok(HeaderOutcome::EndOfData { via_tape_mark: true }),
        DeviceRead::Blank => return Ok(HeaderOutcome::EndOfData { via_tape_mark: false }),
    };

    check_label(&hdr1, LabelKind::Hdr1).map_err(bad_label)?;
    if after_locate {
        // mandatory verification of the locate's landing point
        let landed_on = file_seq_of(&hdr1).map_err(bad_label)?;
        if landed_on != req.target_fseq % 10_000 {
            tracker.fast_position_spent = true;
            return Ok(HeaderOutcome::LocateMissed { landed_on });
        }
    }
    check_file_seq(&hdr1, LabelKind::Hdr1, req.target_fseq).map_err(bad_label)?;
    let mut stored = [0u8; LABEL_RECORD_LEN];
    stored.copy_from_slice(&hdr1);
    tracker.hdr1 = Some(stored);

    let hdr2 = expect_label_record(dev, LabelKind::Hdr2)?;
    tracker.hdr2 = Some(hdr2);

    if info.lblcode == LabelCode::Aul {
        let uhl1 = expect_label_record(dev, LabelKind::Uhl1)?;
        tracker.uhl1 = Some(uhl1);
    }
    Ok(HeaderOutcome::Positioned)
}

fn expect_label_record(
    dev: &mut dyn TapeDevice,
    kind: LabelKind,
) -> Result<[u8; LABEL_RECORD_LEN], PositFailure> {
    match dev.read_block(LABEL_RECORD_LEN)? {
        DeviceRead::Record(record) => {
            check_label(&record, kind).map_err(bad_label)?;
            let mut stored = [0u8; LABEL_RECORD_LEN];
            stored.copy_from_slice(&record);
            Ok(stored)
        }
        DeviceRead::TapeMark => Err(PositFailure::BadLabel {
            reason: format!(
                "tape mark where the {} label was expected",
                String::from_utf8_lossy(kind.tag())
            ),
            raw: Vec::new(),
        }),
        DeviceRead::Blank => Err(PositFailure::Device(TapeError::Blank(format!(
            "blank tape where the {} label was expected",
            String::from_utf8_lossy(kind.tag())
        )))),
    }
}

/// Reads and classifies the trailer-label group after a file's data: EOF
/// means the file ends here, EOV means the section continues on another
/// volume. The trailer's file-sequence digits are validated against the
/// file just read.
pub fn read_trailer_labels(
    dev: &mut dyn TapeDevice,
    info: &DevLabelInfo,
) -> Result<TrailerOutcome, TapeError> {
    let first = match dev.read_block(LABEL_RECORD_LEN)? {
        DeviceRead::Record(record) => record,
        DeviceRead::TapeMark => {
            return Err(TapeError::Label {
                reason: "tape mark where a trailer label was expected".into(),
                raw: Vec::new(),
            });
        }
        DeviceRead::Blank => {
            return Err(TapeError::Blank(
                "blank tape where a trailer label was expected".into(),
            ));
        }
    };

    let (outcome, first_kind, second_kind) = if first.len() == LABEL_RECORD_LEN
        && first.starts_with(LabelKind::Eov1.tag())
    {
        (TrailerOutcome::VolumeContinues, LabelKind::Eov1, LabelKind::Eov2)
    } else {
        (TrailerOutcome::EndOfFile, LabelKind::Eof1, LabelKind::Eof2)
    };

    check_file_seq(&first, first_kind, info.cfseq)?;
    match dev.read_block(LABEL_RECORD_LEN)? {
        DeviceRead::Record(second) => check_label(&second, second_kind)?,
        _ => {
            return Err(TapeError::Label {
                reason: format!(
                    "missing {} label in the trailer group",
                    String::from_utf8_lossy(second_kind.tag())
                ),
                raw: Vec::new(),
            });
        }
    }
    Ok(outcome)
}
