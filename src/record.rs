use std::fmt;

/// The coordinates of a record in the log.
///
/// Both components are 1-based: `segment` names the segment the record lives
/// in, `entry` its index within that segment. Positions are unique for the
/// lifetime of a log and never reused, even across reclamation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub segment: u64,
    pub entry: u64,
}

impl Position {
    pub const fn new(segment: u64, entry: u64) -> Self {
        Self { segment, entry }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.segment, self.entry)
    }
}

/// A stored record: its coordinates plus the opaque, non-empty payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// 1-based id of the segment holding the record.
    pub segment: u64,
    /// 1-based index of the record within its segment.
    pub entry: u64,
    /// The payload bytes, as passed to [`crate::Writer::append`].
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(segment: u64, entry: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            segment,
            entry,
            payload: payload.into(),
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.segment, self.entry)
    }
}
