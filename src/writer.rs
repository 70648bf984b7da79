use std::path::Path;

use log::{debug, info, warn};

use crate::checkpoint;
use crate::error::{Error, Result};
use crate::record::Position;
use crate::repo::{Fs, Repo, SegmentRead, SegmentWrite};
use crate::{segment_name, Options};

/// Writer flavor: whether sealed segments may be reclaimed.
///
/// The names follow the two access models of the underlying store: a fully
/// transactional store supports whole-segment deletion, a concurrent-access
/// store does not.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flavor {
    /// Sealed segments can be reclaimed with [`Writer::delete`] once a saved
    /// checkpoint covers them.
    #[default]
    Transactional,
    /// Reclamation is unsupported; [`Writer::delete`] always fails.
    Concurrent,
}

/// The producing side of a log: appends records and drives the segment
/// lifecycle.
///
/// Opening a writer guarantees the catalog and at least one segment exist.
/// Appends always go to the active segment (the catalog maximum) and roll
/// over into a fresh segment once the tail holds
/// [`Options::max_segment_records`] records.
#[derive(Debug)]
pub struct Writer<R: Repo> {
    repo: R,
    opts: Options,
    head: Head<R::SegmentWriter>,
}

#[derive(Debug)]
struct Head<S> {
    id: u64,
    store: S,
}

impl Writer<Fs> {
    /// Open or create the log at `path`.
    ///
    /// Also sweeps segment files left behind by a reclamation that crashed
    /// between its catalog commit and the file removal.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let repo = Fs::open(path, true)?;
        for name in repo.remove_unlisted_segments()? {
            warn!("removed orphaned segment file {name}");
        }
        Self::with_repo(repo, opts)
    }
}

impl<R: Repo> Writer<R> {
    /// Open a writer over an arbitrary substrate.
    pub fn with_repo(repo: R, opts: Options) -> Result<Self> {
        let catalog = repo.catalog()?;
        let head = match catalog.last() {
            Some((id, name)) => {
                debug!("resuming active segment {name}");
                let store = repo.open_segment_writer(name)?;
                Head { id, store }
            }
            None => {
                info!("starting fresh log");
                Self::create_head(&repo, 1)?
            }
        };
        Ok(Self { repo, opts, head })
    }

    /// This writer's flavor.
    pub fn flavor(&self) -> Flavor {
        self.opts.flavor
    }

    /// Id of the segment currently accepting appends.
    ///
    /// Seals and rolls first if the tail already holds the configured
    /// maximum, so the returned segment always has room.
    pub fn active_segment(&mut self) -> Result<u64> {
        Ok(self.ensure_active()?.id)
    }

    /// Append `payload` to the log, rolling segments as needed.
    ///
    /// Returns the position assigned to the record. Within one writer,
    /// positions are assigned in strictly increasing order.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `payload` is empty.
    pub fn append(&mut self, payload: &[u8]) -> Result<Position> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument(
                "record payloads must be non-empty".into(),
            ));
        }
        let head = self.ensure_active()?;
        let entry = head.store.append(payload)?;
        Ok(Position::new(head.id, entry))
    }

    /// Flush the active segment to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.head.store.fsync()?;
        Ok(())
    }

    /// Reclaim the sealed segment `segment`.
    ///
    /// The segment file and its catalog entry are removed together. Callers
    /// prove consumption beforehand via [`crate::Reader::status`] and
    /// [`crate::Reader::save`]: reclamation requires a stored checkpoint
    /// whose register covers the whole segment. One covering checkpoint
    /// suffices: readers that never reached the segment do not hold it
    /// back, and coordinating several readers (by intersecting their
    /// `status` maps) is the deployment's job.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] on a [`Flavor::Concurrent`] writer.
    /// - [`Error::Gone`] if the catalog has no such segment.
    /// - [`Error::InvalidArgument`] if `segment` is the active segment, or
    ///   no stored checkpoint covers it.
    pub fn delete(&mut self, segment: u64) -> Result<()> {
        if self.opts.flavor == Flavor::Concurrent {
            return Err(Error::Unsupported(
                "segment reclamation requires a transactional writer",
            ));
        }
        let catalog = self.repo.catalog()?;
        let Some(name) = catalog.get(segment) else {
            return Err(Error::Gone { segment });
        };
        if catalog.max() == Some(segment) {
            return Err(Error::InvalidArgument(format!(
                "segment {segment} is active and cannot be reclaimed"
            )));
        }
        let records = self.repo.open_segment_reader(name)?.len()?;
        if !self.fully_acknowledged(segment, records)? {
            return Err(Error::InvalidArgument(format!(
                "segment {segment} has not been fully acknowledged"
            )));
        }
        info!("reclaiming segment {segment} ({name})");
        let name = name.to_owned();
        self.repo.remove_segment(segment, &name)?;
        Ok(())
    }

    /// `true` if some stored checkpoint covers all `records` records of
    /// `segment`.
    fn fully_acknowledged(&self, segment: u64, records: u64) -> Result<bool> {
        for (name, image) in self.repo.checkpoints()? {
            match checkpoint::decode(&image) {
                Ok(register) if register.covers(segment, records) => {
                    debug!("checkpoint {name} covers segment {segment}");
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable checkpoint {name}: {e}"),
            }
        }
        Ok(false)
    }

    fn ensure_active(&mut self) -> Result<&mut Head<R::SegmentWriter>> {
        if self.head.store.len()? >= self.opts.max_segment_records.get() {
            let next = self.head.id + 1;
            debug!("segment {} sealed, rolling to {next}", self.head.id);
            self.head = Self::create_head(&self.repo, next)?;
        }
        Ok(&mut self.head)
    }

    fn create_head(repo: &R, id: u64) -> Result<Head<R::SegmentWriter>> {
        let name = segment_name(id);
        let store = repo.create_segment(id, &name)?;
        Ok(Head { id, store })
    }
}
