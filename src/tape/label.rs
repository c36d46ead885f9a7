//! ANSI/IBM tape label records.
//!
//! All labels are 80-byte records of printable characters with fixed field
//! offsets. Validation failures always carry the raw bytes read, because
//! the label text itself is the one diagnostic an operator can compare
//! against the cartridge's paper history.

use crate::tape::TapeError;

/// Length of every label record.
pub const LABEL_RECORD_LEN: usize = 80;

/// Offset of the 4-digit file-sequence field of HDR1/EOF1/EOV1 records.
pub const HDR1_FSEQ_OFFSET: usize = 31;
/// Offset of the 4-digit file-section field of HDR1/EOF1/EOV1 records.
pub const HDR1_SECTION_OFFSET: usize = 27;
/// Offset of the 17-character file identifier of HDR1/EOF1/EOV1 records.
pub const HDR1_FILE_ID_OFFSET: usize = 4;
pub const HDR1_FILE_ID_LEN: usize = 17;
/// Offset of the volume id of a VOL1 record.
pub const VOL1_VID_OFFSET: usize = 4;
pub const VOL1_VID_LEN: usize = 6;

/// Label convention of a mounted volume.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LabelCode {
    /// ANSI labels.
    Al,
    /// ANSI labels plus user labels (UHL1/UTL1).
    Aul,
    /// IBM standard labels.
    Sl,
    /// No labels.
    Nl,
    /// Bypass label processing: treat whatever is on the tape as unlabelled.
    Blp,
}

impl LabelCode {
    pub fn is_labelled(self) -> bool {
        matches!(self, LabelCode::Al | LabelCode::Aul | LabelCode::Sl)
    }
}

/// The label record kinds the positioning engine distinguishes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LabelKind {
    Vol1,
    Hdr1,
    Hdr2,
    Uhl1,
    Eof1,
    Eof2,
    Eov1,
    Eov2,
    Utl1,
}

impl LabelKind {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            LabelKind::Vol1 => b"VOL1",
            LabelKind::Hdr1 => b"HDR1",
            LabelKind::Hdr2 => b"HDR2",
            LabelKind::Uhl1 => b"UHL1",
            LabelKind::Eof1 => b"EOF1",
            LabelKind::Eof2 => b"EOF2",
            LabelKind::Eov1 => b"EOV1",
            LabelKind::Eov2 => b"EOV2",
            LabelKind::Utl1 => b"UTL1",
        }
    }
}

fn label_error(reason: String, raw: &[u8]) -> TapeError {
    TapeError::Label {
        reason,
        raw: raw.to_vec(),
    }
}

/// Checks that `record` is a well-formed label of the given kind: exactly
/// 80 bytes starting with the expected 4-character tag.
pub fn check_label(record: &[u8], kind: LabelKind) -> Result<(), TapeError> {
    if record.len() != LABEL_RECORD_LEN {
        return Err(label_error(
            format!(
                "wrong record length for a {} label: expected {}, got {}",
                String::from_utf8_lossy(kind.tag()),
                LABEL_RECORD_LEN,
                record.len()
            ),
            record,
        ));
    }
    if &record[..4] != kind.tag() {
        return Err(label_error(
            format!(
                "expected a {} label, read \"{}\"",
                String::from_utf8_lossy(kind.tag()),
                String::from_utf8_lossy(&record[..4])
            ),
            record,
        ));
    }
    Ok(())
}

/// Reads the 4-digit file-sequence field of a HDR1/EOF1/EOV1 record.
pub fn file_seq_of(record: &[u8]) -> Result<u32, TapeError> {
    if record.len() < HDR1_FSEQ_OFFSET + 4 {
        return Err(label_error(
            format!("record of {} bytes has no file sequence field", record.len()),
            record,
        ));
    }
    let digits = &record[HDR1_FSEQ_OFFSET..HDR1_FSEQ_OFFSET + 4];
    let text = std::str::from_utf8(digits)
        .map_err(|_| label_error("file sequence field is not ASCII digits".into(), record))?;
    text.trim_start()
        .parse::<u32>()
        .map_err(|_| {
            label_error(
                format!("file sequence field \"{}\" is not a number", text),
                record,
            )
        })
}

/// Validates the file-sequence digits of a HDR1-family label against the
/// expected value. File-sequence numbers above 9999 wrap in the 4-digit
/// field, so the comparison is modulo 10000.
pub fn check_file_seq(record: &[u8], kind: LabelKind, expected: u32) -> Result<(), TapeError> {
    check_label(record, kind)?;
    let actual = file_seq_of(record)?;
    if actual != expected % 10_000 {
        return Err(label_error(
            format!(
                "file sequence mismatch in {} label: expected {}, label says {}",
                String::from_utf8_lossy(kind.tag()),
                expected % 10_000,
                actual
            ),
            record,
        ));
    }
    Ok(())
}

/// Builds an 80-byte label of the given kind; `fields` are (offset, bytes)
/// pairs laid over a blank-padded record.
pub fn build_label(kind: LabelKind, fields: &[(usize, &[u8])]) -> [u8; LABEL_RECORD_LEN] {
    let mut record = [b' '; LABEL_RECORD_LEN];
    record[..4].copy_from_slice(kind.tag());
    for (offset, content) in fields {
        record[*offset..*offset + content.len()].copy_from_slice(content);
    }
    record
}

pub fn build_vol1(vid: &str) -> [u8; LABEL_RECORD_LEN] {
    let mut vid_field = [b' '; VOL1_VID_LEN];
    let bytes = vid.as_bytes();
    let len = bytes.len().min(VOL1_VID_LEN);
    vid_field[..len].copy_from_slice(&bytes[..len]);
    build_label(LabelKind::Vol1, &[(VOL1_VID_OFFSET, &vid_field)])
}

/// Builds a HDR1-family label (HDR1/EOF1/EOV1 share the layout).
pub fn build_hdr1_family(
    kind: LabelKind,
    file_id: &str,
    fseq: u32,
    section: u32,
) -> [u8; LABEL_RECORD_LEN] {
    let mut id_field = [b' '; HDR1_FILE_ID_LEN];
    let bytes = file_id.as_bytes();
    let len = bytes.len().min(HDR1_FILE_ID_LEN);
    id_field[..len].copy_from_slice(&bytes[..len]);

    let fseq_digits = format!("{:04}", fseq % 10_000);
    let section_digits = format!("{:04}", section % 10_000);
    build_label(
        kind,
        &[
            (HDR1_FILE_ID_OFFSET, &id_field[..]),
            (HDR1_SECTION_OFFSET, section_digits.as_bytes()),
            (HDR1_FSEQ_OFFSET, fseq_digits.as_bytes()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_build_and_check_hdr1() {
        let record = build_hdr1_family(LabelKind::Hdr1, "CASTOR.FILE", 42, 1);
        assert_eq!(record.len(), LABEL_RECORD_LEN);
        assert_eq!(&record[..4], b"HDR1");
        check_label(&record, LabelKind::Hdr1).unwrap();
        check_file_seq(&record, LabelKind::Hdr1, 42).unwrap();
        assert_eq!(file_seq_of(&record).unwrap(), 42);
    }

    #[test]
    fn test_fseq_digits_at_fixed_offset() {
        let record = build_hdr1_family(LabelKind::Hdr1, "F", 123, 1);
        assert_eq!(&record[HDR1_FSEQ_OFFSET..HDR1_FSEQ_OFFSET + 4], b"0123");
    }

    #[test]
    fn test_fseq_wraps_above_9999() {
        let record = build_hdr1_family(LabelKind::Hdr1, "F", 12345, 1);
        assert_eq!(&record[HDR1_FSEQ_OFFSET..HDR1_FSEQ_OFFSET + 4], b"2345");
        check_file_seq(&record, LabelKind::Hdr1, 12345).unwrap();
    }

    #[test]
    fn test_check_file_seq_mismatch_carries_raw_label() {
        let record = build_hdr1_family(LabelKind::Hdr1, "F", 7, 1);
        match check_file_seq(&record, LabelKind::Hdr1, 8) {
            Err(TapeError::Label { reason, raw }) => {
                assert!(reason.contains("file sequence mismatch"));
                assert_eq!(raw, record.to_vec());
            }
            other => panic!("expected a label error, got {:?}", other),
        }
    }

    #[rstest]
    #[case::wrong_tag(LabelKind::Hdr2)]
    #[case::eof(LabelKind::Eof1)]
    fn test_check_label_wrong_tag(#[case] expected_kind: LabelKind) {
        let record = build_hdr1_family(LabelKind::Hdr1, "F", 1, 1);
        match check_label(&record, expected_kind) {
            Err(TapeError::Label { reason, raw }) => {
                assert!(reason.contains("expected"));
                assert_eq!(raw, record.to_vec());
            }
            other => panic!("expected a label error, got {:?}", other),
        }
    }

    #[test]
    fn test_check_label_wrong_length() {
        let record = [b'H'; 40];
        match check_label(&record, LabelKind::Hdr1) {
            Err(TapeError::Label { reason, .. }) => assert!(reason.contains("wrong record length")),
            other => panic!("expected a label error, got {:?}", other),
        }
    }

    #[test]
    fn test_vol1_carries_vid() {
        let record = build_vol1("T1234");
        assert_eq!(&record[..4], b"VOL1");
        assert_eq!(&record[VOL1_VID_OFFSET..VOL1_VID_OFFSET + VOL1_VID_LEN], b"T1234 ");
    }

    #[test]
    fn test_garbage_fseq_field() {
        let record = build_label(LabelKind::Hdr1, &[(HDR1_FSEQ_OFFSET, b"12x4")]);
        assert!(matches!(file_seq_of(&record), Err(TapeError::Label { .. })));
    }
}
