use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::record::{Position, Record};

/// Per-reader progress state: an iteration cursor plus the set of already
/// acknowledged positions, compressed into inclusive runs of consecutive
/// entries.
///
/// Each segment's run list is kept sorted by lower bound, with the runs
/// pairwise disjoint and non-adjacent: an acknowledgment that would make two
/// runs touch merges them instead. After `n` consecutive acknowledgments the
/// footprint is a single pair rather than `n` entries; a fully fragmented
/// pattern costs one run per acknowledgment but collapses as the gaps fill.
///
/// The cursor is only moved by iteration ([`Register::next`] and
/// [`Register::next_segment`]); the runs are only changed by
/// [`Register::add`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Register {
    /// Segment of the last returned position, 0 before the first call.
    pub(crate) segment: u64,
    /// Entry of the last returned position, 0 at a segment start.
    pub(crate) entry: u64,
    /// Acknowledged runs per segment, each list sorted by lower bound.
    pub(crate) acked: BTreeMap<u64, Vec<(u64, u64)>>,
}

impl Register {
    /// An empty register positioned before the first record of the log.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty register positioned before the first record of `segment`.
    pub fn starting_at(segment: u64) -> Self {
        Self {
            segment,
            entry: 0,
            acked: BTreeMap::new(),
        }
    }

    /// A register over a copy of an existing run mapping.
    ///
    /// Later mutation of `runs` does not affect the constructed register.
    /// Every run list must be sorted by lower bound with the runs disjoint,
    /// non-adjacent, and within 1-based bounds.
    pub fn from_runs(runs: &BTreeMap<u64, Vec<(u64, u64)>>) -> Result<Self> {
        for (&segment, list) in runs {
            if segment == 0 {
                return Err(Error::InvalidArgument("segment ids are 1-based".into()));
            }
            let mut prev: Option<u64> = None;
            for &(lo, hi) in list {
                if lo == 0 || hi < lo {
                    return Err(Error::InvalidArgument(format!(
                        "malformed run ({lo}, {hi}) for segment {segment}"
                    )));
                }
                if prev.is_some_and(|p| p + 1 >= lo) {
                    return Err(Error::InvalidArgument(format!(
                        "overlapping or adjacent runs at ({lo}, {hi}) for segment {segment}"
                    )));
                }
                prev = Some(hi);
            }
        }
        Ok(Self {
            segment: 0,
            entry: 0,
            acked: runs.clone(),
        })
    }

    /// Record `record`'s position as acknowledged.
    ///
    /// Re-acknowledging a position is a no-op. An acknowledgment one past a
    /// run's upper bound (or one below its lower bound) extends the run, and
    /// one that closes the gap between two runs merges them, so the list
    /// stays sorted, disjoint, and non-adjacent throughout.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if either coordinate is zero.
    pub fn add(&mut self, record: &Record) -> Result<()> {
        if record.segment == 0 || record.entry == 0 {
            return Err(Error::InvalidArgument(
                "record coordinates are 1-based".into(),
            ));
        }
        let runs = self.acked.entry(record.segment).or_default();
        let entry = record.entry;
        // First run strictly above `entry`; its predecessor is the only run
        // that could contain or extend up to it.
        let i = runs.partition_point(|&(lo, _)| lo <= entry);
        if i > 0 && runs[i - 1].1 >= entry {
            return Ok(());
        }
        let extends_lower = i > 0 && runs[i - 1].1 == entry - 1;
        let extends_upper = i < runs.len() && runs[i].0 - 1 == entry;
        match (extends_lower, extends_upper) {
            (true, true) => {
                runs[i - 1].1 = runs[i].1;
                runs.remove(i);
            }
            (true, false) => runs[i - 1].1 = entry,
            (false, true) => runs[i].0 = entry,
            (false, false) => runs.insert(i, (entry, entry)),
        }
        Ok(())
    }

    /// The next position not yet acknowledged, advancing entry-wise.
    ///
    /// Positions inside an acknowledged run are skipped in one step by
    /// jumping the cursor to the run's upper bound. A cursor still at
    /// segment 0 is promoted to segment 1 first.
    pub fn next(&mut self) -> Position {
        if self.segment == 0 {
            self.segment = 1;
        }
        self.advance()
    }

    /// The next unacknowledged position of the following segment.
    pub fn next_segment(&mut self) -> Position {
        self.segment += 1;
        self.entry = 0;
        self.advance()
    }

    fn advance(&mut self) -> Position {
        loop {
            self.entry += 1;
            match self.run_containing(self.segment, self.entry) {
                // The candidate is already acknowledged; the next one is the
                // entry just past the run.
                Some((_, hi)) => self.entry = hi,
                None => return Position::new(self.segment, self.entry),
            }
        }
    }

    /// Rewind the cursor to before the first record. Acknowledgments are
    /// kept.
    pub fn reset(&mut self) {
        self.segment = 0;
        self.entry = 0;
    }

    /// The last returned position, `(0, 0)` before the first call to
    /// [`Register::next`].
    pub fn cursor(&self) -> Position {
        Position::new(self.segment, self.entry)
    }

    pub(crate) fn seek(&mut self, pos: Position) {
        self.segment = pos.segment;
        self.entry = pos.entry;
    }

    /// The acknowledged runs of `segment`, sorted by lower bound.
    pub fn runs(&self, segment: u64) -> &[(u64, u64)] {
        self.acked.get(&segment).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `true` if every entry of a segment holding `records` records has been
    /// acknowledged, i.e. the segment's runs have collapsed into the single
    /// run covering `1..=records`.
    pub fn covers(&self, segment: u64, records: u64) -> bool {
        match *self.runs(segment) {
            [(lo, hi)] => records > 0 && lo == 1 && hi >= records,
            _ => false,
        }
    }

    fn run_containing(&self, segment: u64, entry: u64) -> Option<(u64, u64)> {
        let runs = self.acked.get(&segment)?;
        let i = runs.partition_point(|&(lo, _)| lo <= entry);
        (i > 0 && runs[i - 1].1 >= entry).then(|| runs[i - 1])
    }
}
