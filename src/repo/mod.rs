//! The storage substrate of the log.
//!
//! [`Repo`] is the seam between the log protocol and the physical key-value
//! store: named segment tables, the segment catalog, and durable checkpoint
//! blobs. The writer and reader are generic over it; [`Fs`] is the
//! filesystem implementation and [`Memory`] an in-memory one for tests.

use std::io;

pub(crate) mod fs;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use fs::Fs;
#[cfg(any(test, feature = "test"))]
pub use mem::Memory;

/// A repository of log segments, their catalog, and reader checkpoints.
///
/// Every method must apply atomically on its own. In particular the two
/// multi-step mutations, segment creation (storage + catalog insert) and
/// segment removal (catalog remove + storage delete), must never be
/// observable half-applied.
pub trait Repo: Clone {
    /// Append handle to a segment table.
    type SegmentWriter: SegmentWrite;
    /// Read handle to a segment table.
    type SegmentReader: SegmentRead;

    /// Create the segment `name` and register it in the catalog under `id`.
    ///
    /// Must return [`io::ErrorKind::AlreadyExists`] if a non-empty segment
    /// `name` already exists. It is permissible to return a pre-existing but
    /// record-less segment: a previous creation attempt may have been
    /// interrupted before its catalog registration.
    fn create_segment(&self, id: u64, name: &str) -> io::Result<Self::SegmentWriter>;

    /// Open the existing segment `name` for appending.
    ///
    /// Returns [`io::ErrorKind::NotFound`] if no such segment exists.
    fn open_segment_writer(&self, name: &str) -> io::Result<Self::SegmentWriter>;

    /// Open the existing segment `name` for reading.
    ///
    /// Returns [`io::ErrorKind::NotFound`] if no such segment exists.
    fn open_segment_reader(&self, name: &str) -> io::Result<Self::SegmentReader>;

    /// Remove segment `name` from the catalog and from storage.
    ///
    /// Returns [`io::ErrorKind::NotFound`] if the catalog has no entry `id`.
    fn remove_segment(&self, id: u64, name: &str) -> io::Result<()>;

    /// A snapshot of the segment catalog, ascending by id.
    fn catalog(&self) -> io::Result<Catalog>;

    /// The checkpoint image stored under `name`, if any.
    fn read_checkpoint(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Durably replace the checkpoint image under `name`.
    fn write_checkpoint(&self, name: &str, image: &[u8]) -> io::Result<()>;

    /// All stored checkpoints as `(name, image)` pairs, ascending by name.
    fn checkpoints(&self) -> io::Result<Vec<(String, Vec<u8>)>>;
}

/// Append access to one segment table: an ordered map from the 1-based
/// record index to the payload.
pub trait SegmentWrite {
    /// Append `payload`, returning the record index assigned to it.
    fn append(&mut self, payload: &[u8]) -> io::Result<u64>;

    /// Current record count.
    fn len(&mut self) -> io::Result<u64>;

    fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush OS buffers to stable storage.
    fn fsync(&mut self) -> io::Result<()>;
}

/// Read access to one segment table.
///
/// Methods take `&mut self`: an implementation may refresh its view of a
/// concurrently growing segment on demand.
pub trait SegmentRead {
    /// The payload stored at the 1-based record index `entry`, or `None`
    /// past the current end.
    fn get(&mut self, entry: u64) -> io::Result<Option<Vec<u8>>>;

    /// Current record count.
    fn len(&mut self) -> io::Result<u64>;
}

/// An ordered snapshot of the segment catalog.
///
/// The minimum id is the oldest live segment; the maximum identifies the
/// segment currently accepting appends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    /// `(id, name)` pairs, ascending by id.
    entries: Vec<(u64, String)>,
}

impl Catalog {
    pub(crate) fn from_sorted(entries: Vec<(u64, String)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The name registered under `id`.
    pub fn get(&self, id: u64) -> Option<&str> {
        self.entries
            .binary_search_by_key(&id, |&(id, _)| id)
            .ok()
            .map(|i| self.entries[i].1.as_str())
    }

    /// The oldest live segment id.
    pub fn min(&self) -> Option<u64> {
        self.entries.first().map(|&(id, _)| id)
    }

    /// The active segment id.
    pub fn max(&self) -> Option<u64> {
        self.entries.last().map(|&(id, _)| id)
    }

    /// The newest catalog entry.
    pub fn last(&self) -> Option<(u64, &str)> {
        self.entries.last().map(|(id, name)| (*id, name.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|&(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.entries.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Bidirectional traversal over this snapshot.
    pub fn cursor(&self) -> CatalogCursor<'_> {
        CatalogCursor {
            entries: &self.entries,
            pos: None,
        }
    }

    pub(crate) fn insert(&mut self, id: u64, name: String) {
        match self.entries.binary_search_by_key(&id, |&(id, _)| id) {
            Ok(i) => self.entries[i].1 = name,
            Err(i) => self.entries.insert(i, (id, name)),
        }
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<String> {
        self.entries
            .binary_search_by_key(&id, |&(id, _)| id)
            .ok()
            .map(|i| self.entries.remove(i).1)
    }
}

/// Cursor over a [`Catalog`] snapshot.
///
/// A fresh cursor is unpositioned: `next` starts at the first entry and
/// `prev` at the last.
#[derive(Debug)]
pub struct CatalogCursor<'a> {
    entries: &'a [(u64, String)],
    pos: Option<usize>,
}

impl<'a> CatalogCursor<'a> {
    pub fn first(&mut self) -> Option<(u64, &'a str)> {
        self.select(if self.entries.is_empty() { None } else { Some(0) })
    }

    pub fn last(&mut self) -> Option<(u64, &'a str)> {
        self.select(self.entries.len().checked_sub(1))
    }

    pub fn next(&mut self) -> Option<(u64, &'a str)> {
        let candidate = match self.pos {
            None => 0,
            Some(p) => p + 1,
        };
        self.select((candidate < self.entries.len()).then_some(candidate))
    }

    pub fn prev(&mut self) -> Option<(u64, &'a str)> {
        let candidate = match self.pos {
            None => self.entries.len().checked_sub(1),
            Some(p) => p.checked_sub(1),
        };
        self.select(candidate)
    }

    fn select(&mut self, candidate: Option<usize>) -> Option<(u64, &'a str)> {
        let i = candidate?;
        self.pos = Some(i);
        let (id, name) = &self.entries[i];
        Some((*id, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::Catalog;

    fn catalog() -> Catalog {
        Catalog::from_sorted(vec![
            (2, "log.2".into()),
            (3, "log.3".into()),
            (7, "log.7".into()),
        ])
    }

    #[test]
    fn lookup_and_bounds() {
        let catalog = catalog();
        assert_eq!(catalog.get(3), Some("log.3"));
        assert_eq!(catalog.get(4), None);
        assert_eq!(catalog.min(), Some(2));
        assert_eq!(catalog.max(), Some(7));
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn cursor_traverses_both_ways() {
        let catalog = catalog();
        let mut cursor = catalog.cursor();
        assert_eq!(cursor.next(), Some((2, "log.2")));
        assert_eq!(cursor.next(), Some((3, "log.3")));
        assert_eq!(cursor.next(), Some((7, "log.7")));
        assert_eq!(cursor.next(), None);
        assert_eq!(cursor.prev(), Some((3, "log.3")));
        assert_eq!(cursor.first(), Some((2, "log.2")));
        assert_eq!(cursor.prev(), None);
        assert_eq!(cursor.last(), Some((7, "log.7")));
    }

    #[test]
    fn cursor_prev_from_fresh_starts_at_the_end() {
        let catalog = catalog();
        let mut cursor = catalog.cursor();
        assert_eq!(cursor.prev(), Some((7, "log.7")));
    }

    #[test]
    fn cursor_on_empty_catalog() {
        let catalog = Catalog::default();
        let mut cursor = catalog.cursor();
        assert_eq!(cursor.first(), None);
        assert_eq!(cursor.last(), None);
        assert_eq!(cursor.next(), None);
        assert_eq!(cursor.prev(), None);
    }

    #[test]
    fn insert_keeps_order() {
        let mut catalog = catalog();
        catalog.insert(5, "log.5".into());
        catalog.insert(1, "log.1".into());
        let ids: Vec<u64> = catalog.ids().collect();
        assert_eq!(ids, vec![1, 2, 3, 5, 7]);
        assert_eq!(catalog.remove(3), Some("log.3".into()));
        assert_eq!(catalog.remove(3), None);
    }
}
