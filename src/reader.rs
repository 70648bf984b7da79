use std::collections::{btree_map, BTreeMap};
use std::io;
use std::path::Path;

use log::{debug, trace};

use crate::checkpoint;
use crate::error::{Error, Result};
use crate::record::{Position, Record};
use crate::register::Register;
use crate::repo::{Catalog, Fs, Repo, SegmentRead};

/// A named consumer of the log.
///
/// Readers walk the log in position order, skipping everything their
/// register has already acknowledged, and persist the register under their
/// checkpoint name so a later session resumes exactly where this one left
/// off. Running out of records is not an error: [`Reader::next_record`]
/// returns `None` until the writer appends more.
#[derive(Debug)]
pub struct Reader<R: Repo> {
    repo: R,
    checkpoint: String,
    register: Register,
    /// Read handles for segments still in use, keyed by segment id.
    segments: BTreeMap<u64, R::SegmentReader>,
}

impl Reader<Fs> {
    /// Open the log at `path` read-only, resuming from the checkpoint named
    /// `checkpoint` when one was saved before.
    ///
    /// # Errors
    ///
    /// [`Error::Missing`] if no log exists at `path`.
    pub fn open(path: impl AsRef<Path>, checkpoint: &str) -> Result<Self> {
        let repo = Fs::open(path, false)?;
        Self::with_repo(repo, checkpoint)
    }
}

impl<R: Repo> Reader<R> {
    /// Open a reader over an arbitrary substrate.
    pub fn with_repo(repo: R, checkpoint: &str) -> Result<Self> {
        let register = match repo.read_checkpoint(checkpoint)? {
            Some(image) => {
                debug!("resuming checkpoint {checkpoint}");
                checkpoint::decode(&image)?
            }
            None => Register::new(),
        };
        Ok(Self {
            repo,
            checkpoint: checkpoint.to_owned(),
            register,
            segments: BTreeMap::new(),
        })
    }

    /// The name this reader persists its progress under.
    pub fn checkpoint_name(&self) -> &str {
        &self.checkpoint
    }

    /// This reader's register.
    pub fn register(&self) -> &Register {
        &self.register
    }

    /// The next record this reader has not yet acknowledged.
    ///
    /// Returns `None` once the log is exhausted; the cursor is left
    /// untouched in that case, so the same position is retried after the
    /// writer appends more. Reading does not acknowledge; interleave
    /// [`Reader::ack`] as records are processed.
    ///
    /// # Errors
    ///
    /// [`Error::Gone`] if the next position falls into a reclaimed segment.
    /// The cursor stays put; use [`Reader::skip_segment`] to move past the
    /// reclaimed segment.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let catalog = self.repo.catalog()?;
        let saved = self.register.cursor();
        match self.advance(&catalog) {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => {
                self.register.seek(saved);
                Ok(None)
            }
            Err(e) => {
                self.register.seek(saved);
                Err(e)
            }
        }
    }

    fn advance(&mut self, catalog: &Catalog) -> Result<Option<Record>> {
        let Some(tail) = catalog.max() else {
            return Ok(None);
        };
        let mut pos = self.register.next();
        loop {
            let Some(name) = catalog.get(pos.segment) else {
                if pos.segment > tail {
                    return Ok(None);
                }
                return Err(Error::Gone {
                    segment: pos.segment,
                });
            };
            match self.lookup(pos, name)? {
                Some(payload) => {
                    trace!("record {pos} ({} bytes)", payload.len());
                    return Ok(Some(Record {
                        segment: pos.segment,
                        entry: pos.entry,
                        payload,
                    }));
                }
                None if pos.segment == tail => return Ok(None),
                None => {
                    // Ran past the end of a sealed segment; its handle is no
                    // longer needed.
                    self.segments.remove(&pos.segment);
                    pos = self.register.next_segment();
                }
            }
        }
    }

    fn lookup(&mut self, pos: Position, name: &str) -> Result<Option<Vec<u8>>> {
        let segment = match self.segments.entry(pos.segment) {
            btree_map::Entry::Occupied(entry) => entry.into_mut(),
            btree_map::Entry::Vacant(entry) => match self.repo.open_segment_reader(name) {
                Ok(segment) => entry.insert(segment),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Listed a moment ago, reclaimed since.
                    return Err(Error::Gone {
                        segment: pos.segment,
                    });
                }
                Err(e) => return Err(e.into()),
            },
        };
        Ok(segment.get(pos.entry)?)
    }

    /// Acknowledge `record`.
    pub fn ack(&mut self, record: &Record) -> Result<()> {
        self.register.add(record)
    }

    /// Persist the register under this reader's checkpoint name.
    ///
    /// Saving the same logical state twice produces byte-identical images.
    pub fn save(&mut self) -> Result<()> {
        let image = checkpoint::encode(&self.register);
        self.repo.write_checkpoint(&self.checkpoint, &image)?;
        trace!("checkpoint {} saved ({} bytes)", self.checkpoint, image.len());
        Ok(())
    }

    /// Consumption status of every cataloged segment.
    ///
    /// A segment maps to `true` once this reader has acknowledged all of its
    /// records, except the catalog maximum, which always maps to `false`:
    /// the active tail may still grow and is never up for reclamation.
    pub fn status(&mut self) -> Result<BTreeMap<u64, bool>> {
        let catalog = self.repo.catalog()?;
        let tail = catalog.max();
        let mut status = BTreeMap::new();
        let mut cursor = catalog.cursor();
        while let Some((id, name)) = cursor.next() {
            let consumed = if Some(id) == tail {
                false
            } else {
                match self.repo.open_segment_reader(name) {
                    Ok(mut segment) => self.register.covers(id, segment.len()?),
                    // Reclaimed between the catalog snapshot and now.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            status.insert(id, consumed);
        }
        Ok(status)
    }

    /// Move the cursor past the segment it currently points into, without
    /// consuming the rest of that segment.
    ///
    /// This is the escape hatch after [`Reader::next_record`] reports a
    /// reclaimed segment: iteration resumes at the first unacknowledged
    /// position of the following segment.
    pub fn skip_segment(&mut self) {
        let current = self.register.cursor().segment.max(1);
        self.segments.remove(&current);
        debug!("skipping past segment {current}");
        self.register.seek(Position::new(current + 1, 0));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Reader;
    use crate::repo::Memory;
    use crate::writer::Writer;
    use crate::{Error, Options, Record};

    fn setup(records: usize) -> (Memory, Writer<Memory>) {
        let repo = Memory::new();
        let mut writer = Writer::with_repo(repo.clone(), Options::with_capacity(10)).unwrap();
        for i in 0..records {
            writer.append(format!("{i}").as_bytes()).unwrap();
        }
        (repo, writer)
    }

    #[test]
    fn reads_records_in_position_order() {
        let (repo, _writer) = setup(25);
        let mut reader = Reader::with_repo(repo, "t").unwrap();

        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            seen.push(record);
        }
        assert_eq!(seen.len(), 25);
        assert_eq!(seen[0], Record::new(1, 1, b"0".as_slice()));
        assert_eq!(seen[10], Record::new(2, 1, b"10".as_slice()));
        assert_eq!(seen[24], Record::new(3, 5, b"24".as_slice()));
    }

    #[test]
    fn exhaustion_is_not_sticky() {
        let (repo, mut writer) = setup(3);
        let mut reader = Reader::with_repo(repo, "t").unwrap();
        for _ in 0..3 {
            reader.next_record().unwrap().unwrap();
        }
        assert_eq!(reader.next_record().unwrap(), None);
        assert_eq!(reader.next_record().unwrap(), None);

        writer.append(b"late").unwrap();
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record, Record::new(1, 4, b"late".as_slice()));
    }

    #[test]
    fn empty_log_is_exhausted() {
        let repo = Memory::new();
        let mut reader = Reader::with_repo(repo.clone(), "t").unwrap();
        assert_eq!(reader.next_record().unwrap(), None);

        // A writer bootstraps the first (still empty) segment.
        Writer::with_repo(repo, Options::with_capacity(10)).unwrap();
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn out_of_band_acknowledgments_are_skipped() {
        let (repo, _writer) = setup(10);
        let mut reader = Reader::with_repo(repo, "t").unwrap();
        // Positions acknowledged ahead of the cursor, e.g. handed over from
        // another consumer.
        for entry in [2, 3, 7] {
            reader.ack(&Record::new(1, entry, b"x".as_slice())).unwrap();
        }
        let entries: Vec<u64> = (0..7)
            .map(|_| reader.next_record().unwrap().unwrap().entry)
            .collect();
        assert_eq!(entries, vec![1, 4, 5, 6, 8, 9, 10]);
    }

    #[test]
    fn resume_continues_from_the_saved_cursor() {
        let (repo, _writer) = setup(25);
        let mut reader = Reader::with_repo(repo.clone(), "t").unwrap();
        for _ in 0..10 {
            let record = reader.next_record().unwrap().unwrap();
            if record.entry % 2 == 1 {
                reader.ack(&record).unwrap();
            }
        }
        reader.save().unwrap();

        // The cursor is part of the checkpoint: iteration resumes after the
        // last returned record, not at the first unacknowledged one.
        let mut resumed = Reader::with_repo(repo, "t").unwrap();
        let first = resumed.next_record().unwrap().unwrap();
        assert_eq!((first.segment, first.entry), (2, 1));
    }

    #[test]
    fn status_tracks_full_consumption_per_segment() {
        let (repo, _writer) = setup(25);
        let mut reader = Reader::with_repo(repo, "t").unwrap();

        let status = reader.status().unwrap();
        assert_eq!(
            status.into_iter().collect::<Vec<_>>(),
            vec![(1, false), (2, false), (3, false)]
        );

        for _ in 0..11 {
            let record = reader.next_record().unwrap().unwrap();
            reader.ack(&record).unwrap();
        }
        let status = reader.status().unwrap();
        assert_eq!(
            status.into_iter().collect::<Vec<_>>(),
            vec![(1, true), (2, false), (3, false)]
        );
    }

    #[test]
    fn the_active_tail_is_never_consumable() {
        let (repo, _writer) = setup(5);
        let mut reader = Reader::with_repo(repo, "t").unwrap();
        for _ in 0..5 {
            let record = reader.next_record().unwrap().unwrap();
            reader.ack(&record).unwrap();
        }
        // Segment 1 is fully acknowledged but still the tail.
        assert_eq!(
            reader.status().unwrap().into_iter().collect::<Vec<_>>(),
            vec![(1, false)]
        );
    }

    #[test]
    fn reclaimed_segments_surface_as_gone_until_skipped() {
        let (repo, mut writer) = setup(25);
        {
            let mut consumer = Reader::with_repo(repo.clone(), "t").unwrap();
            for _ in 0..10 {
                let record = consumer.next_record().unwrap().unwrap();
                consumer.ack(&record).unwrap();
            }
            consumer.save().unwrap();
        }
        writer.delete(1).unwrap();

        // A fresh reader with no checkpoint starts at the reclaimed segment.
        let mut late = Reader::with_repo(repo, "late").unwrap();
        assert!(matches!(
            late.next_record().unwrap_err(),
            Error::Gone { segment: 1 }
        ));
        // The failed call moved nothing.
        assert!(matches!(
            late.next_record().unwrap_err(),
            Error::Gone { segment: 1 }
        ));

        late.skip_segment();
        let record = late.next_record().unwrap().unwrap();
        assert_eq!(record, Record::new(2, 1, b"10".as_slice()));
    }

    #[test]
    fn save_then_reopen_replays_the_same_stream() {
        let (repo, _writer) = setup(25);
        let mut reader = Reader::with_repo(repo.clone(), "t").unwrap();
        for _ in 0..8 {
            let record = reader.next_record().unwrap().unwrap();
            reader.ack(&record).unwrap();
        }
        reader.save().unwrap();

        let mut rest = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            rest.push(record);
        }

        let mut reopened = Reader::with_repo(repo, "t").unwrap();
        let mut replay = Vec::new();
        while let Some(record) = reopened.next_record().unwrap() {
            replay.push(record);
        }
        assert_eq!(rest, replay);
    }
}
