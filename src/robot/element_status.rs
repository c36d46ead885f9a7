//! Element-status model of a SCSI media changer: what sits where inside
//! the library.

/// SCSI element categories of a media changer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ElementType {
    /// A tape drive.
    DataTransfer,
    /// A storage slot.
    StorageCell,
    /// The robot arm itself.
    MediumTransport,
    /// An import/export mailbox slot.
    ImportExport,
}

impl ElementType {
    pub fn from_wire(value: u8) -> Option<ElementType> {
        match value {
            1 => Some(ElementType::MediumTransport),
            2 => Some(ElementType::StorageCell),
            3 => Some(ElementType::ImportExport),
            4 => Some(ElementType::DataTransfer),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ElementType::MediumTransport => 1,
            ElementType::StorageCell => 2,
            ElementType::ImportExport => 3,
            ElementType::DataTransfer => 4,
        }
    }
}

/// One element's reported state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ElementStatus {
    pub element_type: ElementType,
    pub address: u16,
    pub full: bool,
    /// Volume tag of the cartridge occupying the element, if any.
    pub vid: Option<String>,
}

/// Whether the statuses show `vid` sitting in a drive.
pub fn vid_in_drive(statuses: &[ElementStatus], vid: &str) -> bool {
    statuses.iter().any(|s| {
        s.element_type == ElementType::DataTransfer && s.full && s.vid.as_deref() == Some(vid)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status(element_type: ElementType, full: bool, vid: Option<&str>) -> ElementStatus {
        ElementStatus {
            element_type,
            address: 100,
            full,
            vid: vid.map(str::to_string),
        }
    }

    #[rstest]
    #[case::in_drive(vec![status(ElementType::DataTransfer, true, Some("T1"))], true)]
    #[case::in_slot(vec![status(ElementType::StorageCell, true, Some("T1"))], false)]
    #[case::empty_drive(vec![status(ElementType::DataTransfer, false, None)], false)]
    #[case::other_vid(vec![status(ElementType::DataTransfer, true, Some("T2"))], false)]
    #[case::nothing(vec![], false)]
    fn test_vid_in_drive(#[case] statuses: Vec<ElementStatus>, #[case] expected: bool) {
        assert_eq!(vid_in_drive(&statuses, "T1"), expected);
    }

    #[test]
    fn test_element_type_wire_round_trip() {
        for t in [
            ElementType::MediumTransport,
            ElementType::StorageCell,
            ElementType::ImportExport,
            ElementType::DataTransfer,
        ] {
            assert_eq!(ElementType::from_wire(t.to_wire()), Some(t));
        }
        assert_eq!(ElementType::from_wire(0), None);
        assert_eq!(ElementType::from_wire(9), None);
    }
}
